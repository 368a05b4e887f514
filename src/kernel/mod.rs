//! The kernel - threads, streams, pipes, sockets
//!
//! Core abstractions:
//! - Process: unit of isolation, owns a file-id table and its threads
//! - Fid/Fcb: a per-process file id referencing a kernel stream object
//! - Pipe: one-directional bounded byte stream with two endpoints
//! - Socket: local TCP-like rendezvous built out of two pipes
//! - Syscall: the interface between user code and the kernel
//!
//! All kernel state lives in a single `Kernel` structure behind one
//! big lock (see `sched`); condition variables release that lock
//! atomically while a thread is blocked.

pub mod pipe;
pub mod process;
pub mod sched;
pub mod socket;
pub mod streams;
pub mod syscall;
pub mod thread;

#[cfg(test)]
mod invariants_test;

pub use pipe::{PipeId, PIPE_BUFFER_SIZE};
pub use process::{Pid, Process, ProcessState, MAX_FILEID};
pub use sched::CondVar;
pub use socket::{ShutdownMode, SocketId, MAX_PORT, NOPORT};
pub use streams::{Fcb, Fid, StreamObj};
pub use syscall::{Kernel, PipePair, SyscallError, SyscallResult};
pub use thread::{Ptcb, Tid};
