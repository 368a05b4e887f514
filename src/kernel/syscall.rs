//! System call interface
//!
//! This is the boundary between user code and the kernel. All resource
//! access goes through these calls: they acquire the big kernel lock,
//! translate a file id to an FCB, and dispatch on the stream behind
//! it. Errors are reported, never panicked on; a short read or write
//! is the normal success mode, and `Ok(0)` from `read` means
//! end-of-stream.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use slab::Slab;

use super::pipe::{self, PipeCb, PipeId};
use super::process::{Pid, Process};
use super::sched;
use super::socket::{self, ConnRequest, RequestId, ShutdownMode, SocketCb, SocketId, MAX_PORT};
use super::streams::{self, Fid, StreamObj};
use super::thread::{self, Ptcb, Tid};

/// System call error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// The calling thread has no process identity
    NoProcess,
    /// No such thread in the current process
    NoThread,
    /// The target thread is detached
    Detached,
    /// Invalid or wrongly-directed file id
    BadFd,
    /// Invalid argument
    InvalidArgument,
    /// File ids exhausted
    Exhausted,
    /// Pipe write with no reader left
    BrokenPipe,
    /// Socket operation needing a peer connection
    NotConnected,
    /// Port already has a listener
    AddressInUse,
    /// No listener behind the port, or it refused us
    ConnectionRefused,
    /// Connect gave up waiting
    TimedOut,
    /// Listener closed while we were blocked on it
    Closed,
}

impl std::fmt::Display for SyscallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyscallError::NoProcess => write!(f, "no current process"),
            SyscallError::NoThread => write!(f, "no such thread"),
            SyscallError::Detached => write!(f, "thread is detached"),
            SyscallError::BadFd => write!(f, "bad file id"),
            SyscallError::InvalidArgument => write!(f, "invalid argument"),
            SyscallError::Exhausted => write!(f, "file ids exhausted"),
            SyscallError::BrokenPipe => write!(f, "broken pipe"),
            SyscallError::NotConnected => write!(f, "socket not connected"),
            SyscallError::AddressInUse => write!(f, "port already in use"),
            SyscallError::ConnectionRefused => write!(f, "connection refused"),
            SyscallError::TimedOut => write!(f, "connection timed out"),
            SyscallError::Closed => write!(f, "closed while waiting"),
        }
    }
}

impl std::error::Error for SyscallError {}

pub type SyscallResult<T> = Result<T, SyscallError>;

/// The two file ids of a freshly created pipe.
#[derive(Debug, Clone, Copy)]
pub struct PipePair {
    pub read: Fid,
    pub write: Fid,
}

/// The kernel state - every table in the system.
///
/// A single instance lives behind the big kernel lock (`sched`); all
/// ids handed out by the tables below are monotonic and never reused.
pub struct Kernel {
    pub(crate) processes: HashMap<Pid, Process>,
    next_pid: u32,
    /// The FCB pool shared by all processes
    pub(crate) fcbs: Slab<streams::Fcb>,
    pub(crate) pipes: HashMap<PipeId, PipeCb>,
    next_pipe: u64,
    pub(crate) sockets: HashMap<SocketId, SocketCb>,
    next_socket: u64,
    pub(crate) requests: HashMap<RequestId, ConnRequest>,
    next_request: u64,
    /// At most one listener per port
    pub(crate) port_map: Vec<Option<SocketId>>,
    next_tid: u64,
}

impl Kernel {
    pub(crate) fn new() -> Self {
        Self {
            processes: HashMap::new(),
            next_pid: 1,
            fcbs: Slab::new(),
            pipes: HashMap::new(),
            next_pipe: 1,
            sockets: HashMap::new(),
            next_socket: 1,
            requests: HashMap::new(),
            next_request: 1,
            port_map: vec![None; MAX_PORT as usize + 1],
            next_tid: 1,
        }
    }

    pub(crate) fn process(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub(crate) fn process_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    pub(crate) fn alloc_tid(&mut self) -> Tid {
        let tid = Tid(self.next_tid);
        self.next_tid += 1;
        tid
    }

    pub(crate) fn insert_pipe(&mut self, cb: PipeCb) -> PipeId {
        let id = PipeId(self.next_pipe);
        self.next_pipe += 1;
        self.pipes.insert(id, cb);
        id
    }

    pub(crate) fn insert_socket(&mut self, cb: SocketCb) -> SocketId {
        let id = SocketId(self.next_socket);
        self.next_socket += 1;
        self.sockets.insert(id, cb);
        id
    }

    pub(crate) fn insert_request(&mut self, req: ConnRequest) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        self.requests.insert(id, req);
        id
    }

    /// Create a process with its main thread already registered. The
    /// first process spawned becomes init (pid 1).
    pub(crate) fn spawn_process(&mut self, name: &str, parent: Option<Pid>) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        let tid = self.alloc_tid();
        let mut proc = Process::new(pid, name.to_string(), parent);
        proc.threads.insert(tid, Ptcb::new(tid));
        proc.thread_count = 1;
        proc.main_thread = Some(tid);
        self.processes.insert(pid, proc);
        if let Some(parent) = parent {
            if let Some(pp) = self.processes.get_mut(&parent) {
                pp.children.push(pid);
            }
        }
        debug!("spawned {} ({})", pid, name);
        pid
    }
}

fn current_pid() -> SyscallResult<Pid> {
    sched::current()
        .map(|(pid, _)| pid)
        .ok_or(SyscallError::NoProcess)
}

// ========== PROCESS FIXTURE ==========

/// Spawn a new process. Its parent is the caller's process, if any.
pub fn spawn_process(name: &str) -> Pid {
    let parent = sched::current().map(|(pid, _)| pid);
    let mut k = sched::lock_kernel();
    k.spawn_process(name, parent)
}

/// Bind the calling OS thread to a process as its main thread.
pub fn set_current_process(pid: Pid) {
    let k = sched::lock_kernel();
    if let Some(main) = k.process(pid).and_then(|p| p.main_thread) {
        sched::set_current(pid, main);
    }
}

// ========== THREAD API ==========

/// Create a thread in the current process; its return value is its
/// exit value.
pub fn create_thread(task: impl FnOnce() -> i32 + Send + 'static) -> SyscallResult<Tid> {
    thread::create_thread(task)
}

/// The tid of the calling thread.
pub fn thread_self() -> SyscallResult<Tid> {
    thread::thread_self()
}

/// Wait for a thread of the current process to exit; returns its exit
/// value.
pub fn thread_join(tid: Tid) -> SyscallResult<i32> {
    thread::thread_join(tid)
}

/// Detach a thread of the current process.
pub fn thread_detach(tid: Tid) -> SyscallResult<()> {
    thread::thread_detach(tid)
}

/// Terminate the calling thread.
pub fn thread_exit(exitval: i32) -> ! {
    thread::thread_exit(exitval)
}

// ========== STREAM API ==========

/// Create a pipe and return the file ids of its two ends.
pub fn pipe() -> SyscallResult<PipePair> {
    let pid = current_pid()?;
    let mut k = sched::lock_kernel();
    let entries = streams::fcb_reserve(&mut k, pid, 2).ok_or(SyscallError::Exhausted)?;
    let (read, read_key) = entries[0];
    let (write, write_key) = entries[1];
    let id = k.insert_pipe(PipeCb::new(Some(read_key), Some(write_key)));
    if let Some(fcb) = k.fcbs.get_mut(read_key) {
        fcb.stream = StreamObj::PipeReader(id);
    }
    if let Some(fcb) = k.fcbs.get_mut(write_key) {
        fcb.stream = StreamObj::PipeWriter(id);
    }
    Ok(PipePair { read, write })
}

/// Read from a file id, blocking until bytes or end-of-stream are
/// available. `Ok(0)` is end-of-stream.
pub fn read(fid: Fid, buf: &mut [u8]) -> SyscallResult<usize> {
    let pid = current_pid()?;
    let k = sched::lock_kernel();
    let key = streams::get_fcb(&k, pid, fid).ok_or(SyscallError::BadFd)?;
    let stream = k.fcbs.get(key).map(|fcb| fcb.stream);
    match stream {
        Some(StreamObj::PipeReader(id)) => pipe::pipe_read(k, id, buf),
        Some(StreamObj::Socket(sid)) => socket::socket_read(k, sid, buf),
        _ => Err(SyscallError::BadFd),
    }
}

/// Write to a file id, blocking while there is no room at all. A
/// short write is normal.
pub fn write(fid: Fid, buf: &[u8]) -> SyscallResult<usize> {
    let pid = current_pid()?;
    let k = sched::lock_kernel();
    let key = streams::get_fcb(&k, pid, fid).ok_or(SyscallError::BadFd)?;
    let stream = k.fcbs.get(key).map(|fcb| fcb.stream);
    match stream {
        Some(StreamObj::PipeWriter(id)) => pipe::pipe_write(k, id, buf),
        Some(StreamObj::Socket(sid)) => socket::socket_write(k, sid, buf),
        _ => Err(SyscallError::BadFd),
    }
}

/// Duplicate a file id onto a fresh slot; both ids then share the
/// same FCB and the stream closes only when the last one is released.
pub fn dup(fid: Fid) -> SyscallResult<Fid> {
    let pid = current_pid()?;
    let mut k = sched::lock_kernel();
    let key = streams::get_fcb(&k, pid, fid).ok_or(SyscallError::BadFd)?;
    let new_fid = k
        .process(pid)
        .and_then(|proc| proc.free_fids(1))
        .ok_or(SyscallError::Exhausted)?[0];
    streams::fcb_incref(&mut k, key);
    if let Some(proc) = k.process_mut(pid) {
        proc.fid_set(new_fid, key);
    }
    Ok(new_fid)
}

/// Release a file id. The last release of the underlying FCB closes
/// its stream and propagates that close's result.
pub fn close(fid: Fid) -> SyscallResult<()> {
    let pid = current_pid()?;
    let mut k = sched::lock_kernel();
    let key = k
        .process_mut(pid)
        .ok_or(SyscallError::NoProcess)?
        .fid_clear(fid)
        .ok_or(SyscallError::BadFd)?;
    streams::fcb_decref(&mut k, key)
}

// ========== SOCKET API ==========

/// Create a socket bound to `port` (NOPORT for none).
pub fn socket(port: u16) -> SyscallResult<Fid> {
    let pid = current_pid()?;
    let mut k = sched::lock_kernel();
    socket::sys_socket(&mut k, pid, port)
}

/// Make the socket the listener for its port.
pub fn listen(fid: Fid) -> SyscallResult<()> {
    let pid = current_pid()?;
    let mut k = sched::lock_kernel();
    socket::sys_listen(&mut k, pid, fid)
}

/// Wait for and admit one connection; returns the new peer's file id.
pub fn accept(lfid: Fid) -> SyscallResult<Fid> {
    let pid = current_pid()?;
    let k = sched::lock_kernel();
    socket::sys_accept(k, pid, lfid)
}

/// Connect to the listener on `port`. `timeout` of None waits
/// indefinitely.
pub fn connect(fid: Fid, port: u16, timeout: Option<Duration>) -> SyscallResult<()> {
    let pid = current_pid()?;
    let k = sched::lock_kernel();
    socket::sys_connect(k, pid, fid, port, timeout)
}

/// Shut down one or both directions of a peer connection.
pub fn shut_down(fid: Fid, how: ShutdownMode) -> SyscallResult<()> {
    let pid = current_pid()?;
    let mut k = sched::lock_kernel();
    socket::sys_shutdown(&mut k, pid, fid, how)
}
