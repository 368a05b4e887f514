//! Stream objects and file control blocks
//!
//! Every byte stream in the system is reached through a file control
//! block (FCB). A process addresses an FCB via a file id, an index
//! into its file-id table; the FCB itself lives in a kernel-wide pool
//! and carries a reference count plus a tag naming the underlying
//! stream. Dispatching a read, write or close on a file id means
//! matching on that tag.
//!
//! FCBs are shared: `Close` decrements the reference count and only
//! the last release actually closes the underlying stream, so a
//! closed-but-still-referenced FCB cannot exist.

use log::trace;

use super::pipe::{self, PipeId};
use super::process::Pid;
use super::socket::{self, SocketId};
use super::syscall::{Kernel, SyscallResult};

/// Key into the kernel FCB pool.
pub type FcbKey = usize;

/// File identifier - an index into a process's file-id table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fid(pub usize);

impl std::fmt::Display for Fid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fid:{}", self.0)
    }
}

/// The stream behind an FCB.
///
/// Pipe endpoints are directional: the read end of a pipe rejects
/// writes and vice versa. `Null` is the reserved-but-unwired state
/// between `fcb_reserve` and stream installation; it never survives a
/// system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamObj {
    Null,
    PipeReader(PipeId),
    PipeWriter(PipeId),
    Socket(SocketId),
}

/// The file control block
#[derive(Debug)]
pub struct Fcb {
    /// Number of file-id slots (plus transient holders) referencing us
    pub refcount: usize,
    pub stream: StreamObj,
}

/// Atomically allocate `n` free file ids in process `pid` and `n` pool
/// FCBs, each with refcount 1. On any shortage nothing changes.
pub(crate) fn fcb_reserve(k: &mut Kernel, pid: Pid, n: usize) -> Option<Vec<(Fid, FcbKey)>> {
    let fids = k.process(pid)?.free_fids(n)?;
    let mut entries = Vec::with_capacity(n);
    for fid in fids {
        let key = k.fcbs.insert(Fcb {
            refcount: 1,
            stream: StreamObj::Null,
        });
        entries.push((fid, key));
    }
    match k.process_mut(pid) {
        Some(proc) => {
            for &(fid, key) in &entries {
                proc.fid_set(fid, key);
            }
            Some(entries)
        }
        None => {
            for &(_, key) in &entries {
                k.fcbs.remove(key);
            }
            None
        }
    }
}

/// Undo a reservation without invoking close. Only meaningful for
/// FCBs that never had a stream installed.
pub fn fcb_unreserve(k: &mut Kernel, pid: Pid, entries: &[(Fid, FcbKey)]) {
    for &(fid, key) in entries {
        if let Some(proc) = k.process_mut(pid) {
            proc.fid_clear(fid);
        }
        if k.fcbs.contains(key) {
            k.fcbs.remove(key);
        }
    }
}

/// Resolve a file id of `pid` to an FCB key.
pub(crate) fn get_fcb(k: &Kernel, pid: Pid, fid: Fid) -> Option<FcbKey> {
    k.process(pid)?.fid_get(fid)
}

pub(crate) fn fcb_incref(k: &mut Kernel, key: FcbKey) {
    if let Some(fcb) = k.fcbs.get_mut(key) {
        fcb.refcount += 1;
    }
}

/// Drop one reference. The last release removes the FCB from the pool
/// and closes its stream, propagating the close's result.
pub(crate) fn fcb_decref(k: &mut Kernel, key: FcbKey) -> SyscallResult<()> {
    let Some(fcb) = k.fcbs.get_mut(key) else {
        debug_assert!(false, "decref on a freed FCB");
        return Ok(());
    };
    debug_assert!(fcb.refcount > 0);
    fcb.refcount -= 1;
    if fcb.refcount > 0 {
        return Ok(());
    }
    let fcb = k.fcbs.remove(key);
    trace!("closing stream {:?}", fcb.stream);
    match fcb.stream {
        StreamObj::Null => Ok(()),
        StreamObj::PipeReader(id) => pipe::reader_close(k, id),
        StreamObj::PipeWriter(id) => pipe::writer_close(k, id),
        StreamObj::Socket(sid) => socket::socket_close(k, sid),
    }
}

#[cfg(test)]
mod tests {
    use crate::kernel::syscall;
    use crate::kernel::syscall::SyscallError;

    fn init_test() -> crate::kernel::Pid {
        let pid = syscall::spawn_process("streams-test");
        syscall::set_current_process(pid);
        pid
    }

    #[test]
    fn test_fid_exhaustion() {
        init_test();
        // 16 slots, 2 per pipe
        let mut pairs = Vec::new();
        for _ in 0..8 {
            pairs.push(syscall::pipe().unwrap());
        }
        assert_eq!(syscall::pipe().unwrap_err(), SyscallError::Exhausted);

        // releasing a pair frees its slots again
        let pair = pairs.pop().unwrap();
        syscall::close(pair.read).unwrap();
        syscall::close(pair.write).unwrap();
        assert!(syscall::pipe().is_ok());
    }

    #[test]
    fn test_invalid_fid() {
        init_test();
        let mut buf = [0u8; 4];
        assert_eq!(
            syscall::read(crate::kernel::Fid(99), &mut buf).unwrap_err(),
            SyscallError::BadFd
        );
        assert_eq!(
            syscall::close(crate::kernel::Fid(3)).unwrap_err(),
            SyscallError::BadFd
        );
    }

    #[test]
    fn test_double_close() {
        init_test();
        let pair = syscall::pipe().unwrap();
        syscall::close(pair.read).unwrap();
        assert_eq!(syscall::close(pair.read).unwrap_err(), SyscallError::BadFd);
        syscall::close(pair.write).unwrap();
    }

    #[test]
    fn test_dup_shares_the_stream() {
        init_test();
        let pair = syscall::pipe().unwrap();
        let dup = syscall::dup(pair.read).unwrap();
        assert_ne!(dup, pair.read);

        // closing one of the two ids must not close the stream
        syscall::close(pair.read).unwrap();
        syscall::write(pair.write, b"still open").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(syscall::read(dup, &mut buf).unwrap(), 10);

        syscall::close(dup).unwrap();
        syscall::close(pair.write).unwrap();
    }
}
