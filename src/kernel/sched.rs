//! Scheduler backing
//!
//! The kernel runs under a single big kernel lock: a process-wide
//! mutex around the `Kernel` structure. Condition variables are the
//! only suspension points; waiting on one atomically releases the
//! kernel lock and reacquires it on wake. Kernel threads are OS
//! threads; per-thread identity (current process and thread id) lives
//! in thread-local storage.

use std::cell::Cell;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use super::process::Pid;
use super::syscall::Kernel;
use super::thread::Tid;

/// Guard of the big kernel lock.
pub type KernelGuard = MutexGuard<'static, Kernel>;

fn kernel() -> &'static Mutex<Kernel> {
    static KERNEL: OnceLock<Mutex<Kernel>> = OnceLock::new();
    KERNEL.get_or_init(|| Mutex::new(Kernel::new()))
}

/// Acquire the big kernel lock.
///
/// A poisoned lock is recovered: kernel state is only mutated under
/// the lock by code that does not unwind mid-update.
pub(crate) fn lock_kernel() -> KernelGuard {
    kernel().lock().unwrap_or_else(PoisonError::into_inner)
}

/// A condition variable tied to the big kernel lock.
///
/// Cloning yields a handle to the same underlying variable, so a
/// waiter can clone it out of a kernel object, wait, and re-resolve
/// the object afterwards. Waits may wake spuriously; every wait site
/// re-checks its predicate in a loop.
#[derive(Clone, Debug, Default)]
pub struct CondVar(Arc<Condvar>);

impl CondVar {
    pub fn new() -> Self {
        CondVar(Arc::new(Condvar::new()))
    }

    /// Release the kernel lock, block until signalled, reacquire.
    pub fn wait(&self, guard: KernelGuard) -> KernelGuard {
        self.0.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// As `wait`, but gives up after `dur`. Returns the reacquired
    /// guard and whether the wait timed out.
    pub fn wait_timeout(&self, guard: KernelGuard, dur: Duration) -> (KernelGuard, bool) {
        match self.0.wait_timeout(guard, dur) {
            Ok((guard, timeout)) => (guard, timeout.timed_out()),
            Err(poisoned) => {
                let (guard, timeout) = poisoned.into_inner();
                (guard, timeout.timed_out())
            }
        }
    }

    /// Wake one waiter.
    pub fn signal(&self) {
        self.0.notify_one();
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        self.0.notify_all();
    }
}

thread_local! {
    static CURRENT: Cell<Option<(Pid, Tid)>> = const { Cell::new(None) };
}

/// Identity of the calling kernel thread, if it has one.
pub fn current() -> Option<(Pid, Tid)> {
    CURRENT.get()
}

pub(crate) fn set_current(pid: Pid, tid: Tid) {
    CURRENT.set(Some((pid, tid)));
}

pub(crate) fn clear_current() {
    CURRENT.set(None);
}

/// Spawn a kernel thread. The entry runs on a fresh OS thread.
pub(crate) fn spawn_thread(
    name: String,
    entry: impl FnOnce() + Send + 'static,
) -> std::io::Result<()> {
    std::thread::Builder::new().name(name).spawn(entry)?;
    Ok(())
}
