//! minos - a small educational OS kernel in Rust
//!
//! Design principles:
//! - Tractable: bounded complexity, comprehensible by one human
//! - One big kernel lock: every kernel operation runs under a single
//!   mutex, so kernel data needs no fine-grained synchronisation
//! - Blocking is explicit: the only suspension points are condition
//!   variables owned by kernel objects (pipes, sockets, threads)
//! - True ownership: objects live in kernel tables and are referenced
//!   by ids, never by raw pointers
//!
//! The kernel provides intra-process threads, a uniform byte-stream
//! layer behind per-process file ids, bounded pipes, and a TCP-like
//! local socket layer with listen/accept/connect rendezvous.

pub mod kernel;
