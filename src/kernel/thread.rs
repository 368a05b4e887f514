//! Thread management
//!
//! Threads run inside a process and are addressed by a `Tid`. Each has
//! a process thread control block (`Ptcb`) holding its exit state and
//! join synchronisation; the schedulable entity itself is the backing
//! OS thread, which terminates once exit bookkeeping has committed.
//!
//! A Ptcb is owned jointly by its thread and by every blocked joiner:
//! the reference count starts at 1, each joiner adds one, and the
//! block is freed the moment it is both exited and unreferenced.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

use log::{debug, trace};

use super::process::{Pid, ProcessState, MAX_FILEID};
use super::sched::{self, CondVar};
use super::streams;
use super::syscall::{Kernel, SyscallError, SyscallResult};

/// Thread identifier. Ids increase monotonically and are never reused,
/// so a tid held after its thread was reaped can only fail to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tid(pub u64);

impl std::fmt::Display for Tid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

/// The process thread control block
#[derive(Debug)]
pub struct Ptcb {
    pub tid: Tid,
    /// Immutable once `exited` is set
    pub exitval: i32,
    pub exited: bool,
    /// Monotonic: once detached, stays detached
    pub detached: bool,
    /// The thread itself plus each active joiner
    pub refcount: usize,
    /// Broadcast on exit and on detach
    pub exit_cv: CondVar,
}

impl Ptcb {
    pub(crate) fn new(tid: Tid) -> Self {
        Self {
            tid,
            exitval: 0,
            exited: false,
            detached: false,
            refcount: 1,
            exit_cv: CondVar::new(),
        }
    }
}

/// Unwind payload used by `thread_exit`, caught by the trampoline.
struct ExitRequest(i32);

/// Keep the default panic hook quiet about `ExitRequest` unwinds.
fn install_exit_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let prev = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<ExitRequest>().is_none() {
                prev(info);
            }
        }));
    });
}

/// Create a new thread in the current process. The task's return
/// value becomes the thread's exit value.
pub(crate) fn create_thread(
    task: impl FnOnce() -> i32 + Send + 'static,
) -> SyscallResult<Tid> {
    let (pid, _) = sched::current().ok_or(SyscallError::NoProcess)?;
    let tid = {
        let mut k = sched::lock_kernel();
        let tid = k.alloc_tid();
        let proc = k.process_mut(pid).ok_or(SyscallError::NoProcess)?;
        proc.threads.insert(tid, Ptcb::new(tid));
        proc.thread_count += 1;
        tid
    };
    install_exit_hook();
    let spawned = sched::spawn_thread(format!("minos-{}.{}", pid.0, tid.0), move || {
        trampoline(pid, tid, task)
    });
    if spawned.is_err() {
        let mut k = sched::lock_kernel();
        if let Some(proc) = k.process_mut(pid) {
            proc.threads.remove(&tid);
            proc.thread_count -= 1;
        }
        return Err(SyscallError::Exhausted);
    }
    trace!("{} created {}", pid, tid);
    Ok(tid)
}

fn trampoline(pid: Pid, tid: Tid, task: impl FnOnce() -> i32) {
    sched::set_current(pid, tid);
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(exitval) => do_exit(exitval),
        Err(payload) => match payload.downcast::<ExitRequest>() {
            Ok(request) => do_exit(request.0),
            Err(payload) => {
                // a real panic in the task: record an error exit so
                // joiners are released, then let the unwind continue
                do_exit(-1);
                panic::resume_unwind(payload);
            }
        },
    }
}

/// Identity of the calling thread.
pub(crate) fn thread_self() -> SyscallResult<Tid> {
    sched::current().map(|(_, tid)| tid).ok_or(SyscallError::NoProcess)
}

/// Wait for a thread of the current process to exit and collect its
/// exit value. Joining yields the value exactly once across the
/// thread's lifetime per joiner; a tid that was already reaped fails.
pub(crate) fn thread_join(tid: Tid) -> SyscallResult<i32> {
    let (pid, self_tid) = sched::current().ok_or(SyscallError::NoProcess)?;
    if tid == self_tid {
        return Err(SyscallError::InvalidArgument);
    }
    let mut k = sched::lock_kernel();
    let cv = {
        let proc = k.process(pid).ok_or(SyscallError::NoProcess)?;
        let target = proc.threads.get(&tid).ok_or(SyscallError::NoThread)?;
        if target.exited {
            return Err(SyscallError::NoThread);
        }
        if target.detached {
            return Err(SyscallError::Detached);
        }
        target.exit_cv.clone()
    };
    if let Some(target) = thread_mut(&mut k, pid, tid) {
        target.refcount += 1;
    }
    loop {
        // the refcount we hold keeps the Ptcb in the table
        let Some(target) = thread_ref(&k, pid, tid) else {
            return Err(SyscallError::NoThread);
        };
        if target.exited || target.detached {
            break;
        }
        k = cv.wait(k);
    }
    let Some(target) = thread_ref(&k, pid, tid) else {
        return Err(SyscallError::NoThread);
    };
    if target.detached {
        ptcb_decref(&mut k, pid, tid);
        return Err(SyscallError::Detached);
    }
    let exitval = target.exitval;
    ptcb_decref(&mut k, pid, tid);
    trace!("{} joined {} -> {}", pid, tid, exitval);
    Ok(exitval)
}

/// Detach a thread of the current process: joining it becomes an
/// error and blocked joiners are released empty-handed.
pub(crate) fn thread_detach(tid: Tid) -> SyscallResult<()> {
    let (pid, _) = sched::current().ok_or(SyscallError::NoProcess)?;
    let mut k = sched::lock_kernel();
    let proc = k.process_mut(pid).ok_or(SyscallError::NoProcess)?;
    let target = proc.threads.get_mut(&tid).ok_or(SyscallError::NoThread)?;
    if target.exited {
        return Err(SyscallError::NoThread);
    }
    target.detached = true;
    target.exit_cv.broadcast();
    trace!("{} detached {}", pid, tid);
    Ok(())
}

/// Terminate the current thread with the given exit value.
pub fn thread_exit(exitval: i32) -> ! {
    install_exit_hook();
    panic::panic_any(ExitRequest(exitval));
}

/// Exit bookkeeping for the current thread. The last thread of a
/// process additionally tears the process down.
pub(crate) fn do_exit(exitval: i32) {
    let Some((pid, tid)) = sched::current() else {
        return;
    };
    let mut k = sched::lock_kernel();
    let last = {
        let Some(proc) = k.process_mut(pid) else {
            return;
        };
        let Some(own) = proc.threads.get_mut(&tid) else {
            return;
        };
        own.exitval = exitval;
        own.exited = true;
        own.refcount -= 1;
        own.exit_cv.broadcast();
        proc.thread_count -= 1;
        proc.thread_count == 0
    };
    trace!("{} {} exited with {}", pid, tid, exitval);
    if last {
        teardown_process(&mut k, pid, exitval);
    }
    ptcb_release(&mut k, pid, tid);
    drop(k);
    sched::clear_current();
}

/// Drop one joiner reference, reaping the Ptcb if it is done.
pub(crate) fn ptcb_decref(k: &mut Kernel, pid: Pid, tid: Tid) {
    if let Some(target) = thread_mut(k, pid, tid) {
        debug_assert!(target.refcount > 0);
        target.refcount -= 1;
    }
    ptcb_release(k, pid, tid);
}

/// Reap the Ptcb once it is exited and unreferenced.
fn ptcb_release(k: &mut Kernel, pid: Pid, tid: Tid) {
    if let Some(proc) = k.process_mut(pid) {
        let done = proc
            .threads
            .get(&tid)
            .is_some_and(|t| t.exited && t.refcount == 0);
        if done {
            proc.threads.remove(&tid);
        }
    }
}

fn thread_ref<'a>(k: &'a Kernel, pid: Pid, tid: Tid) -> Option<&'a Ptcb> {
    k.process(pid)?.threads.get(&tid)
}

fn thread_mut<'a>(k: &'a mut Kernel, pid: Pid, tid: Tid) -> Option<&'a mut Ptcb> {
    k.process_mut(pid)?.threads.get_mut(&tid)
}

/// The last thread has gone: settle the process's estate.
fn teardown_process(k: &mut Kernel, pid: Pid, exitval: i32) {
    const INIT: Pid = Pid(1);
    debug!("{} tearing down", pid);

    if pid != INIT {
        // live children are adopted by init
        let children = k
            .process_mut(pid)
            .map(|p| std::mem::take(&mut p.children))
            .unwrap_or_default();
        for &child in &children {
            if let Some(cp) = k.process_mut(child) {
                cp.parent = Some(INIT);
            }
        }
        if let Some(init) = k.process_mut(INIT) {
            init.children.extend(children);
        }

        // zombie children are handed to init for reaping
        let orphans = k
            .process_mut(pid)
            .map(|p| std::mem::take(&mut p.exited_children))
            .unwrap_or_default();
        if !orphans.is_empty() {
            if let Some(init) = k.process_mut(INIT) {
                init.exited_children.extend(orphans);
                init.child_exit.broadcast();
            }
        }

        // announce our own death to the parent
        let parent = k.process(pid).and_then(|p| p.parent);
        if let Some(parent) = parent {
            if let Some(pp) = k.process_mut(parent) {
                pp.exited_children.push(pid);
                pp.child_exit.broadcast();
            }
        }
    }

    // release the argument block and every live file id
    let keys: Vec<_> = {
        let Some(proc) = k.process_mut(pid) else {
            return;
        };
        if let Some(args) = proc.args.take() {
            trace!("{} released {} argument bytes", pid, args.len());
        }
        (0..MAX_FILEID)
            .filter_map(|i| proc.fid_table[i].take())
            .collect()
    };
    for key in keys {
        let _ = streams::fcb_decref(k, key);
    }

    if let Some(proc) = k.process_mut(pid) {
        proc.main_thread = None;
        proc.state = ProcessState::Zombie(exitval);
    }
}
