//! Process abstraction
//!
//! A process is the unit of isolation: it owns a fixed-size file-id
//! table, the threads running inside it, and its parent/child links.
//! Process lifecycle (exec, wait) is out of scope here; processes are
//! spawned directly and become zombies when their last thread exits.

use std::collections::HashMap;

use super::sched::CondVar;
use super::streams::{FcbKey, Fid};
use super::thread::{Ptcb, Tid};

/// Number of file-id slots per process.
pub const MAX_FILEID: usize = 16;

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has at least one live thread
    Running,
    /// All threads have exited; carries the exit value of the last one
    Zombie(i32),
}

/// The process control block
#[derive(Debug)]
pub struct Process {
    pub pid: Pid,
    pub name: String,
    pub parent: Option<Pid>,
    pub state: ProcessState,
    /// File-id table: each slot holds a key into the kernel FCB pool
    pub(crate) fid_table: [Option<FcbKey>; MAX_FILEID],
    /// Threads of this process, live and not-yet-reaped exited ones
    pub(crate) threads: HashMap<Tid, Ptcb>,
    /// Number of threads that have not exited yet
    pub thread_count: usize,
    /// The initial thread, cleared at process teardown
    pub main_thread: Option<Tid>,
    pub children: Vec<Pid>,
    pub exited_children: Vec<Pid>,
    /// Signalled when a child of this process exits
    pub child_exit: CondVar,
    /// Argument block released at teardown
    pub(crate) args: Option<Vec<u8>>,
}

impl Process {
    pub(crate) fn new(pid: Pid, name: String, parent: Option<Pid>) -> Self {
        Self {
            pid,
            name,
            parent,
            state: ProcessState::Running,
            fid_table: [None; MAX_FILEID],
            threads: HashMap::new(),
            thread_count: 0,
            main_thread: None,
            children: Vec::new(),
            exited_children: Vec::new(),
            child_exit: CondVar::new(),
            args: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state == ProcessState::Running
    }

    /// Look up a file-id slot. Out-of-range and empty slots yield None.
    pub fn fid_get(&self, fid: Fid) -> Option<FcbKey> {
        self.fid_table.get(fid.0).copied().flatten()
    }

    pub(crate) fn fid_set(&mut self, fid: Fid, key: FcbKey) {
        debug_assert!(self.fid_table[fid.0].is_none());
        self.fid_table[fid.0] = Some(key);
    }

    /// Empty a file-id slot, returning the FCB key it held.
    pub(crate) fn fid_clear(&mut self, fid: Fid) -> Option<FcbKey> {
        self.fid_table.get_mut(fid.0).and_then(|slot| slot.take())
    }

    /// Find `n` free file-id slots, lowest first. None if fewer exist.
    pub(crate) fn free_fids(&self, n: usize) -> Option<Vec<Fid>> {
        let free: Vec<_> = self
            .fid_table
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| Fid(i))
            .take(n)
            .collect();
        (free.len() == n).then_some(free)
    }
}
