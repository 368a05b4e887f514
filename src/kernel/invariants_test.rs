//! Invariant tests
//!
//! Each test is named after the invariant it checks, exercising the
//! kernel through the system-call surface and then inspecting the
//! tables under the kernel lock.

#[cfg(test)]
mod pipe_invariants {
    use crate::kernel::pipe::PipeCb;
    use crate::kernel::PIPE_BUFFER_SIZE;

    /// Occupancy stays within 0..=capacity and the cursors stay
    /// in-range through arbitrary interleavings of push and pull.
    #[test]
    fn occupancy_and_cursor_bounds() {
        let mut p = PipeCb::new(None, None);
        let chunk = [0xabu8; 7000];
        let mut out = [0u8; 5000];

        for _ in 0..40 {
            p.push(&chunk);
            assert!(p.bytes_in_buffer() <= PIPE_BUFFER_SIZE);
            assert!(p.write_pos() < PIPE_BUFFER_SIZE);

            p.pull(&mut out);
            assert!(p.bytes_in_buffer() <= PIPE_BUFFER_SIZE);
            assert!(p.read_pos() < PIPE_BUFFER_SIZE);
        }
    }

    /// A full buffer accepts nothing more; a drained buffer yields
    /// nothing more.
    #[test]
    fn at_most_capacity() {
        let mut p = PipeCb::new(None, None);
        let big = vec![1u8; PIPE_BUFFER_SIZE + 123];
        assert_eq!(p.push(&big), PIPE_BUFFER_SIZE);
        assert_eq!(p.push(&big), 0);
        assert!(p.is_full());

        let mut out = vec![0u8; PIPE_BUFFER_SIZE + 123];
        assert_eq!(p.pull(&mut out), PIPE_BUFFER_SIZE);
        assert_eq!(p.pull(&mut out), 0);
        assert!(p.is_empty());
    }

    /// Closing both endpoints makes the pipe unreachable.
    #[test]
    fn freed_after_both_ends_close() {
        use crate::kernel::sched::lock_kernel;
        use crate::kernel::{syscall, StreamObj};

        let pid = syscall::spawn_process("inv-pipe");
        syscall::set_current_process(pid);
        let pair = syscall::pipe().unwrap();

        let pipe_id = {
            let k = lock_kernel();
            let key = k.process(pid).unwrap().fid_get(pair.read).unwrap();
            match k.fcbs.get(key).unwrap().stream {
                StreamObj::PipeReader(id) => id,
                other => panic!("read end holds {:?}", other),
            }
        };

        syscall::close(pair.read).unwrap();
        {
            let k = lock_kernel();
            assert!(k.pipes.contains_key(&pipe_id));
        }
        syscall::close(pair.write).unwrap();
        {
            let k = lock_kernel();
            assert!(!k.pipes.contains_key(&pipe_id));
        }
    }
}

#[cfg(test)]
mod port_invariants {
    use crate::kernel::sched::lock_kernel;
    use crate::kernel::socket::SocketKind;
    use crate::kernel::syscall;

    /// A port-map entry always names a listener whose port matches
    /// its index, and is cleared when the listener closes.
    #[test]
    fn port_map_entries_are_listeners() {
        let pid = syscall::spawn_process("inv-port");
        syscall::set_current_process(pid);

        let fid = syscall::socket(710).unwrap();
        syscall::listen(fid).unwrap();

        {
            let k = lock_kernel();
            let sid = k.port_map[710].expect("listener installed");
            let sc = k.sockets.get(&sid).unwrap();
            assert!(matches!(sc.kind, SocketKind::Listener(_)));
            assert_eq!(sc.port, 710);
        }

        syscall::close(fid).unwrap();
        {
            let k = lock_kernel();
            assert!(k.port_map[710].is_none());
        }
    }
}

#[cfg(test)]
mod fcb_invariants {
    use crate::kernel::sched::lock_kernel;
    use crate::kernel::syscall;

    /// Every FCB's refcount equals the number of file-id slots
    /// referencing it (streams are not shared across processes here,
    /// so that number is one).
    #[test]
    fn refcount_matches_fid_slots() {
        let pid = syscall::spawn_process("inv-fcb");
        syscall::set_current_process(pid);
        let pair = syscall::pipe().unwrap();
        let sock = syscall::socket(0).unwrap();

        {
            let k = lock_kernel();
            let proc = k.process(pid).unwrap();
            for fid in [pair.read, pair.write, sock] {
                let key = proc.fid_get(fid).unwrap();
                assert_eq!(k.fcbs.get(key).unwrap().refcount, 1);
            }
        }

        // a duplicated id shares the FCB and is counted on it
        let dup = syscall::dup(pair.read).unwrap();
        {
            let k = lock_kernel();
            let proc = k.process(pid).unwrap();
            let key = proc.fid_get(pair.read).unwrap();
            assert_eq!(proc.fid_get(dup), Some(key));
            assert_eq!(k.fcbs.get(key).unwrap().refcount, 2);
        }
        syscall::close(dup).unwrap();
        {
            let k = lock_kernel();
            let proc = k.process(pid).unwrap();
            let key = proc.fid_get(pair.read).unwrap();
            assert_eq!(k.fcbs.get(key).unwrap().refcount, 1);
        }

        syscall::close(pair.read).unwrap();
        syscall::close(pair.write).unwrap();
        syscall::close(sock).unwrap();

        {
            let k = lock_kernel();
            let proc = k.process(pid).unwrap();
            assert!(proc.fid_get(pair.read).is_none());
            assert!(proc.fid_get(pair.write).is_none());
            assert!(proc.fid_get(sock).is_none());
        }
    }
}

#[cfg(test)]
mod socket_invariants {
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    use crate::kernel::sched::lock_kernel;
    use crate::kernel::socket::SocketKind;
    use crate::kernel::{syscall, StreamObj, NOPORT};

    /// Connected peers reference each other, and their two pipes are
    /// distinct and crossed: one side's read pipe is the other side's
    /// write pipe.
    #[test]
    fn peers_are_cross_linked() {
        let pid = syscall::spawn_process("inv-socket");
        syscall::set_current_process(pid);

        let listener = syscall::socket(720).unwrap();
        syscall::listen(listener).unwrap();

        let gate = Arc::new(Barrier::new(2));
        let connector_gate = gate.clone();
        syscall::create_thread(move || {
            let t = syscall::socket(NOPORT).unwrap();
            syscall::connect(t, 720, Some(Duration::from_millis(1000))).unwrap();
            connector_gate.wait();
            0
        })
        .unwrap();

        let c = syscall::accept(listener).unwrap();
        {
            let k = lock_kernel();
            let key = k.process(pid).unwrap().fid_get(c).unwrap();
            let StreamObj::Socket(sid) = k.fcbs.get(key).unwrap().stream else {
                panic!("accepted fid is not a socket");
            };
            let SocketKind::Peer(ours) = &k.sockets.get(&sid).unwrap().kind else {
                panic!("accepted socket is not a peer");
            };
            let SocketKind::Peer(theirs) = &k.sockets.get(&ours.peer).unwrap().kind else {
                panic!("connected socket is not a peer");
            };
            assert_eq!(theirs.peer, sid);
            assert_ne!(ours.read_pipe, ours.write_pipe);
            assert_eq!(ours.read_pipe, theirs.write_pipe);
            assert_eq!(ours.write_pipe, theirs.read_pipe);
            for id in [ours.read_pipe.unwrap(), ours.write_pipe.unwrap()] {
                assert!(k.pipes.contains_key(&id));
            }
        }

        gate.wait();
        syscall::close(c).unwrap();
        syscall::close(listener).unwrap();
    }
}

#[cfg(test)]
mod thread_invariants {
    use std::sync::{Arc, Barrier};

    use crate::kernel::sched::lock_kernel;
    use crate::kernel::syscall;

    /// A live Ptcb keeps refcount >= 1; once exited and unreferenced
    /// it leaves the thread table.
    #[test]
    fn refcount_lifecycle() {
        let pid = syscall::spawn_process("inv-thread");
        syscall::set_current_process(pid);

        let barrier = Arc::new(Barrier::new(2));
        let b = barrier.clone();
        let tid = syscall::create_thread(move || {
            b.wait();
            9
        })
        .unwrap();

        {
            let k = lock_kernel();
            let t = k.process(pid).unwrap().threads.get(&tid).unwrap();
            assert!(t.refcount >= 1);
            assert!(!t.exited);
        }

        // release the worker only once our join holds a reference
        let releaser = std::thread::spawn(move || {
            loop {
                let registered = {
                    let k = lock_kernel();
                    k.process(pid)
                        .and_then(|p| p.threads.get(&tid))
                        .is_none_or(|t| t.refcount >= 2)
                };
                if registered {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(2));
            }
            barrier.wait();
        });
        assert_eq!(syscall::thread_join(tid).unwrap(), 9);
        releaser.join().unwrap();

        {
            let k = lock_kernel();
            assert!(!k.process(pid).unwrap().threads.contains_key(&tid));
        }
    }
}

#[cfg(test)]
mod teardown_invariants {
    use crate::kernel::sched::lock_kernel;
    use crate::kernel::{syscall, thread, Pid, ProcessState, StreamObj};

    /// When the last thread exits: the file table is drained and its
    /// streams closed, children are reparented to init, the parent is
    /// told, and the process becomes a zombie.
    #[test]
    fn last_thread_settles_the_estate() {
        let home = syscall::spawn_process("inv-home");
        syscall::set_current_process(home);
        let target = syscall::spawn_process("inv-target");
        syscall::set_current_process(target);

        let pair = syscall::pipe().unwrap();
        let child = syscall::spawn_process("inv-child");

        let pipe_id = {
            let k = lock_kernel();
            let key = k.process(target).unwrap().fid_get(pair.read).unwrap();
            match k.fcbs.get(key).unwrap().stream {
                StreamObj::PipeReader(id) => id,
                other => panic!("read end holds {:?}", other),
            }
        };

        // the calling thread is target's main and also its last
        thread::do_exit(5);
        syscall::set_current_process(home);

        let k = lock_kernel();
        let proc = k.process(target).unwrap();
        assert_eq!(proc.state, ProcessState::Zombie(5));
        assert_eq!(proc.thread_count, 0);
        assert!(proc.main_thread.is_none());
        assert!(proc.fid_table.iter().all(|slot| slot.is_none()));
        assert!(!k.pipes.contains_key(&pipe_id));

        assert_eq!(k.process(child).unwrap().parent, Some(Pid(1)));
        assert!(k.process(Pid(1)).unwrap().children.contains(&child));
        assert!(k.process(home).unwrap().exited_children.contains(&target));
    }
}
