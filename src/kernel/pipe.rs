//! Pipe implementation
//!
//! A pipe is a one-directional bounded byte stream: a 16 KiB circular
//! buffer with a read cursor, a write cursor and an occupancy count,
//! plus two condition variables. A reader blocks while the buffer is
//! empty and the write end is still open; a writer blocks while the
//! buffer is full and the read end is still open. Closing the write
//! end turns an empty buffer into end-of-file for the reader; closing
//! the read end turns every subsequent write into an error.
//!
//! State changes broadcast (rather than signal) their condition
//! variable: several threads may share an endpoint, and socket peers
//! reach the same pipes through their own FCBs.

use log::trace;

use super::sched::{CondVar, KernelGuard};
use super::streams::FcbKey;
use super::syscall::{Kernel, SyscallError, SyscallResult};

/// Capacity of a pipe's buffer in bytes.
pub const PIPE_BUFFER_SIZE: usize = 16384;

/// Pipe identifier. Ids increase monotonically and are never reused,
/// so a handle held across a blocking wait cannot alias a new pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeId(pub u64);

impl std::fmt::Display for PipeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pipe:{}", self.0)
    }
}

/// The pipe control block
#[derive(Debug)]
pub struct PipeCb {
    /// FCB holding the read end; None once that end is closed
    pub(crate) reader: Option<FcbKey>,
    /// FCB holding the write end; None once that end is closed
    pub(crate) writer: Option<FcbKey>,
    /// Signalled when buffer space is freed or the read end closes
    pub(crate) has_space: CondVar,
    /// Signalled when bytes arrive or the write end closes
    pub(crate) has_data: CondVar,
    buf: Vec<u8>,
    r_pos: usize,
    w_pos: usize,
    count: usize,
}

impl PipeCb {
    pub(crate) fn new(reader: Option<FcbKey>, writer: Option<FcbKey>) -> Self {
        Self {
            reader,
            writer,
            has_space: CondVar::new(),
            has_data: CondVar::new(),
            buf: vec![0; PIPE_BUFFER_SIZE],
            r_pos: 0,
            w_pos: 0,
            count: 0,
        }
    }

    pub fn bytes_in_buffer(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == PIPE_BUFFER_SIZE
    }

    fn space(&self) -> usize {
        PIPE_BUFFER_SIZE - self.count
    }

    #[cfg(test)]
    pub(crate) fn read_pos(&self) -> usize {
        self.r_pos
    }

    #[cfg(test)]
    pub(crate) fn write_pos(&self) -> usize {
        self.w_pos
    }

    /// Copy as much of `data` as fits into the buffer at the write
    /// cursor, advancing it modulo the capacity. Returns bytes copied.
    pub(crate) fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.space());
        let first = n.min(PIPE_BUFFER_SIZE - self.w_pos);
        self.buf[self.w_pos..self.w_pos + first].copy_from_slice(&data[..first]);
        self.buf[..n - first].copy_from_slice(&data[first..n]);
        self.w_pos = (self.w_pos + n) % PIPE_BUFFER_SIZE;
        self.count += n;
        n
    }

    /// Copy up to `out.len()` buffered bytes to `out` from the read
    /// cursor, advancing it modulo the capacity. Returns bytes copied.
    pub(crate) fn pull(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.count);
        let first = n.min(PIPE_BUFFER_SIZE - self.r_pos);
        out[..first].copy_from_slice(&self.buf[self.r_pos..self.r_pos + first]);
        out[first..n].copy_from_slice(&self.buf[..n - first]);
        self.r_pos = (self.r_pos + n) % PIPE_BUFFER_SIZE;
        self.count -= n;
        n
    }
}

/// Write up to `buf.len()` bytes into the pipe, blocking while the
/// buffer is full and the read end is open. A short write is the
/// normal success mode: one call transfers at most the space free
/// when it stops blocking.
pub(crate) fn pipe_write(mut k: KernelGuard, id: PipeId, buf: &[u8]) -> SyscallResult<usize> {
    loop {
        let Some(p) = k.pipes.get(&id) else {
            // both ends closed while we were blocked
            return Err(SyscallError::BrokenPipe);
        };
        if p.writer.is_none() {
            return Err(SyscallError::BadFd);
        }
        if p.reader.is_none() {
            return Err(SyscallError::BrokenPipe);
        }
        if !p.is_full() {
            break;
        }
        let cv = p.has_space.clone();
        k = cv.wait(k);
    }
    let Some(p) = k.pipes.get_mut(&id) else {
        return Err(SyscallError::BrokenPipe);
    };
    let n = p.push(buf);
    p.has_data.broadcast();
    Ok(n)
}

/// Read up to `buf.len()` bytes from the pipe, blocking while the
/// buffer is empty and the write end is open. Returns `Ok(0)` for
/// end-of-file once the write end has closed and the buffer drained.
pub(crate) fn pipe_read(mut k: KernelGuard, id: PipeId, buf: &mut [u8]) -> SyscallResult<usize> {
    loop {
        let Some(p) = k.pipes.get(&id) else {
            // read end was closed under us
            return Err(SyscallError::BadFd);
        };
        if p.reader.is_none() {
            return Err(SyscallError::BadFd);
        }
        if !p.is_empty() {
            break;
        }
        if p.writer.is_none() {
            return Ok(0);
        }
        let cv = p.has_data.clone();
        k = cv.wait(k);
    }
    let Some(p) = k.pipes.get_mut(&id) else {
        return Err(SyscallError::BadFd);
    };
    let n = p.pull(buf);
    p.has_space.broadcast();
    Ok(n)
}

/// Close the read end. The last end to close frees the pipe and wakes
/// everything still blocked on it; otherwise blocked writers are woken
/// so they observe the dead reader.
pub(crate) fn reader_close(k: &mut Kernel, id: PipeId) -> SyscallResult<()> {
    let Some(p) = k.pipes.get_mut(&id) else {
        return Err(SyscallError::BadFd);
    };
    if p.reader.take().is_none() {
        return Err(SyscallError::BadFd);
    }
    if p.writer.is_none() {
        free_pipe(k, id);
    } else {
        p.has_space.broadcast();
    }
    Ok(())
}

/// Close the write end. The last end to close frees the pipe and wakes
/// everything still blocked on it; otherwise blocked readers are woken
/// so they observe end-of-file.
pub(crate) fn writer_close(k: &mut Kernel, id: PipeId) -> SyscallResult<()> {
    let Some(p) = k.pipes.get_mut(&id) else {
        return Err(SyscallError::BadFd);
    };
    if p.writer.take().is_none() {
        return Err(SyscallError::BadFd);
    }
    if p.reader.is_none() {
        free_pipe(k, id);
    } else {
        p.has_data.broadcast();
    }
    Ok(())
}

fn free_pipe(k: &mut Kernel, id: PipeId) {
    if let Some(p) = k.pipes.remove(&id) {
        trace!("{} freed", id);
        // wake any thread still blocked on the dead pipe; it will fail
        // to find the id and report the closed end
        p.has_space.broadcast();
        p.has_data.broadcast();
    }
}
