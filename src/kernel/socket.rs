//! Local sockets
//!
//! A TCP-like rendezvous layer over ports. A fresh socket is unbound;
//! `listen` installs it in the port map, `connect` queues a connection
//! request on a listener and blocks with a timeout, and `accept` pops
//! requests in FIFO order, wiring both sides into peers. A peer
//! connection is two pipes of opposite direction: this socket's read
//! pipe is its peer's write pipe and vice versa, so socket I/O is
//! pipe I/O.
//!
//! Requests live in a kernel table and listener queues hold their
//! ids. The connecting side always frees its own request: on timeout
//! it unlinks the request from the queue under the kernel lock, so an
//! accept can never pop a request whose owner has given up.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, trace};

use super::pipe::{self, PipeCb, PipeId};
use super::process::Pid;
use super::sched::{CondVar, KernelGuard};
use super::streams::{self, FcbKey, Fid, StreamObj};
use super::syscall::{Kernel, SyscallError, SyscallResult};

/// Highest usable port number.
pub const MAX_PORT: u16 = 1023;

/// The unbound port.
pub const NOPORT: u16 = 0;

/// Socket identifier. Ids increase monotonically and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub u64);

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sock:{}", self.0)
    }
}

/// Connection-request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// How much of a peer connection to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Close the receiving direction
    Read,
    /// Close the sending direction
    Write,
    /// Close both directions
    Both,
}

/// State of a listening socket.
#[derive(Debug)]
pub struct Listener {
    /// Pending connection requests, oldest first
    pub(crate) queue: VecDeque<RequestId>,
    /// Signalled when a request is queued or the listener closes
    pub(crate) req_available: CondVar,
}

/// State of a connected socket.
#[derive(Debug)]
pub struct Peer {
    /// The socket at the other end of the connection
    pub peer: SocketId,
    /// Pipe this socket reads from; None after a read shutdown
    pub read_pipe: Option<PipeId>,
    /// Pipe this socket writes to; None after a write shutdown
    pub write_pipe: Option<PipeId>,
}

/// The three lives of a socket.
#[derive(Debug)]
pub enum SocketKind {
    Unbound,
    Listener(Listener),
    Peer(Peer),
}

/// The socket control block
#[derive(Debug)]
pub struct SocketCb {
    /// Transient references held by blocked accepts/connects
    pub refcount: usize,
    /// Back-reference to the owning FCB; None once closed
    pub(crate) fcb: Option<FcbKey>,
    pub port: u16,
    pub kind: SocketKind,
}

/// A connection request linking a `connect` caller to a listener.
#[derive(Debug)]
pub struct ConnRequest {
    /// Set by accept once the connection is wired up
    pub admitted: bool,
    /// Set when the listener dies before admission
    pub refused: bool,
    /// The connecting socket
    pub peer: SocketId,
    pub connected_cv: CondVar,
}

/// Create a socket bound to `port` (NOPORT for none) and return its
/// file id.
pub(crate) fn sys_socket(k: &mut Kernel, pid: Pid, port: u16) -> SyscallResult<Fid> {
    if port > MAX_PORT {
        return Err(SyscallError::InvalidArgument);
    }
    let entries = streams::fcb_reserve(k, pid, 1).ok_or(SyscallError::Exhausted)?;
    let (fid, key) = entries[0];
    let sid = k.insert_socket(SocketCb {
        refcount: 0,
        fcb: Some(key),
        port,
        kind: SocketKind::Unbound,
    });
    if let Some(fcb) = k.fcbs.get_mut(key) {
        fcb.stream = StreamObj::Socket(sid);
    }
    trace!("{} opened {} on port {}", pid, sid, port);
    Ok(fid)
}

/// Turn an unbound socket into the listener for its port.
pub(crate) fn sys_listen(k: &mut Kernel, pid: Pid, fid: Fid) -> SyscallResult<()> {
    let sid = resolve_socket(k, pid, fid)?;
    let port = {
        let sc = k.sockets.get(&sid).ok_or(SyscallError::BadFd)?;
        if sc.port == NOPORT {
            return Err(SyscallError::InvalidArgument);
        }
        if !matches!(sc.kind, SocketKind::Unbound) {
            return Err(SyscallError::InvalidArgument);
        }
        if k.port_map[sc.port as usize].is_some() {
            return Err(SyscallError::AddressInUse);
        }
        sc.port
    };
    if let Some(sc) = k.sockets.get_mut(&sid) {
        sc.kind = SocketKind::Listener(Listener {
            queue: VecDeque::new(),
            req_available: CondVar::new(),
        });
    }
    k.port_map[port as usize] = Some(sid);
    debug!("{} listening on port {}", sid, port);
    Ok(())
}

/// Wait for a connection request on a listening socket and build the
/// peer pair. Returns the file id of the new peer socket.
pub(crate) fn sys_accept(mut k: KernelGuard, pid: Pid, lfid: Fid) -> SyscallResult<Fid> {
    let lsid = resolve_socket(&k, pid, lfid)?;
    let (port, cv) = {
        let sc = k.sockets.get_mut(&lsid).ok_or(SyscallError::BadFd)?;
        let SocketKind::Listener(listener) = &sc.kind else {
            return Err(SyscallError::InvalidArgument);
        };
        let cv = listener.req_available.clone();
        // keep the control block alive across the wait even if the
        // listener is closed under us
        sc.refcount += 1;
        (sc.port, cv)
    };

    let (rid, csid) = loop {
        // the listener may have been closed while we were blocked
        let closed = k
            .sockets
            .get(&lsid)
            .is_none_or(|sc| sc.fcb.is_none())
            || k.port_map[port as usize] != Some(lsid);
        if closed {
            socket_decref(&mut k, lsid);
            return Err(SyscallError::Closed);
        }
        let popped = match k.sockets.get_mut(&lsid).map(|sc| &mut sc.kind) {
            Some(SocketKind::Listener(listener)) => listener.queue.pop_front(),
            _ => {
                socket_decref(&mut k, lsid);
                return Err(SyscallError::Closed);
            }
        };
        match popped {
            None => k = cv.wait(k),
            Some(rid) => {
                let Some(csid) = k.requests.get(&rid).map(|r| r.peer) else {
                    continue;
                };
                // a connector that closed its socket while queued is
                // turned away rather than wired to a dead endpoint
                if k.sockets.get(&csid).is_none_or(|sc| sc.fcb.is_none()) {
                    if let Some(req) = k.requests.get_mut(&rid) {
                        req.refused = true;
                        req.connected_cv.broadcast();
                    }
                    continue;
                }
                break (rid, csid);
            }
        }
    };

    // reserve the peer file id before admitting, so exhaustion leaves
    // the connector queued and un-admitted
    let Some(entries) = streams::fcb_reserve(&mut k, pid, 1) else {
        if let Some(sc) = k.sockets.get_mut(&lsid) {
            if let SocketKind::Listener(listener) = &mut sc.kind {
                listener.queue.push_front(rid);
            }
        }
        socket_decref(&mut k, lsid);
        return Err(SyscallError::Exhausted);
    };
    let (peer_fid, peer_key) = entries[0];

    // the accepted socket is bound to the listener's port
    let new_sid = k.insert_socket(SocketCb {
        refcount: 0,
        fcb: Some(peer_key),
        port,
        kind: SocketKind::Unbound,
    });
    if let Some(fcb) = k.fcbs.get_mut(peer_key) {
        fcb.stream = StreamObj::Socket(new_sid);
    }

    // two pipes of opposite direction wire the peers together
    let conn_key = k.sockets.get(&csid).and_then(|sc| sc.fcb);
    let p1 = k.insert_pipe(PipeCb::new(Some(peer_key), conn_key));
    let p2 = k.insert_pipe(PipeCb::new(conn_key, Some(peer_key)));
    if let Some(sc) = k.sockets.get_mut(&new_sid) {
        sc.kind = SocketKind::Peer(Peer {
            peer: csid,
            read_pipe: Some(p1),
            write_pipe: Some(p2),
        });
    }
    if let Some(sc) = k.sockets.get_mut(&csid) {
        sc.kind = SocketKind::Peer(Peer {
            peer: new_sid,
            read_pipe: Some(p2),
            write_pipe: Some(p1),
        });
    }

    if let Some(req) = k.requests.get_mut(&rid) {
        req.admitted = true;
        req.connected_cv.signal();
    }
    socket_decref(&mut k, lsid);
    debug!("{} accepted {} on port {}", lsid, csid, port);
    Ok(peer_fid)
}

/// Request a connection to the listener on `port` and wait for
/// admission. `timeout` of None waits indefinitely.
pub(crate) fn sys_connect(
    mut k: KernelGuard,
    pid: Pid,
    fid: Fid,
    port: u16,
    timeout: Option<Duration>,
) -> SyscallResult<()> {
    let sid = resolve_socket(&k, pid, fid)?;
    if port == NOPORT || port > MAX_PORT {
        return Err(SyscallError::InvalidArgument);
    }
    {
        let sc = k.sockets.get(&sid).ok_or(SyscallError::BadFd)?;
        if !matches!(sc.kind, SocketKind::Unbound) {
            return Err(SyscallError::InvalidArgument);
        }
    }
    let lsid = k.port_map[port as usize].ok_or(SyscallError::ConnectionRefused)?;
    {
        let lsc = k
            .sockets
            .get_mut(&lsid)
            .ok_or(SyscallError::ConnectionRefused)?;
        if !matches!(lsc.kind, SocketKind::Listener(_)) {
            return Err(SyscallError::ConnectionRefused);
        }
        lsc.refcount += 1;
    }

    let rid = k.insert_request(ConnRequest {
        admitted: false,
        refused: false,
        peer: sid,
        connected_cv: CondVar::new(),
    });
    let cv = match k.requests.get(&rid) {
        Some(req) => req.connected_cv.clone(),
        None => CondVar::new(),
    };
    if let Some(lsc) = k.sockets.get_mut(&lsid) {
        if let SocketKind::Listener(listener) = &mut lsc.kind {
            listener.queue.push_back(rid);
            listener.req_available.signal();
        }
    }
    trace!("{} connecting to port {}", sid, port);

    // whoever commits first under the lock wins: admission by accept,
    // refusal by listener close, or our own deadline
    let deadline = timeout.map(|d| Instant::now() + d);
    loop {
        let settled = k
            .requests
            .get(&rid)
            .is_none_or(|req| req.admitted || req.refused);
        if settled {
            break;
        }
        match deadline {
            None => k = cv.wait(k),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = cv.wait_timeout(k, deadline - now);
                k = guard;
            }
        }
    }

    let (admitted, refused) = k
        .requests
        .get(&rid)
        .map(|req| (req.admitted, req.refused))
        .unwrap_or((false, true));
    if !admitted {
        // give up: unlink the request so accept never sees it
        if let Some(lsc) = k.sockets.get_mut(&lsid) {
            if let SocketKind::Listener(listener) = &mut lsc.kind {
                listener.queue.retain(|&queued| queued != rid);
            }
        }
    }
    k.requests.remove(&rid);
    socket_decref(&mut k, lsid);
    if admitted {
        debug!("{} connected to port {}", sid, port);
        Ok(())
    } else if refused {
        Err(SyscallError::ConnectionRefused)
    } else {
        Err(SyscallError::TimedOut)
    }
}

/// Shut down one or both directions of a peer connection.
pub(crate) fn sys_shutdown(
    k: &mut Kernel,
    pid: Pid,
    fid: Fid,
    how: ShutdownMode,
) -> SyscallResult<()> {
    let sid = resolve_socket(k, pid, fid)?;
    let (read_pipe, write_pipe) = {
        let sc = k.sockets.get_mut(&sid).ok_or(SyscallError::BadFd)?;
        let SocketKind::Peer(peer) = &mut sc.kind else {
            return Err(SyscallError::NotConnected);
        };
        match how {
            ShutdownMode::Read => (peer.read_pipe.take(), None),
            ShutdownMode::Write => (None, peer.write_pipe.take()),
            ShutdownMode::Both => (peer.read_pipe.take(), peer.write_pipe.take()),
        }
    };
    if let Some(id) = write_pipe {
        pipe::writer_close(k, id)?;
    }
    if let Some(id) = read_pipe {
        pipe::reader_close(k, id)?;
    }
    trace!("{} shut down {:?}", sid, how);
    Ok(())
}

/// Blocking read from a peer socket: delegates to its read pipe.
pub(crate) fn socket_read(k: KernelGuard, sid: SocketId, buf: &mut [u8]) -> SyscallResult<usize> {
    let pipe_id = {
        let sc = k.sockets.get(&sid).ok_or(SyscallError::BadFd)?;
        let SocketKind::Peer(peer) = &sc.kind else {
            return Err(SyscallError::NotConnected);
        };
        peer.read_pipe.ok_or(SyscallError::NotConnected)?
    };
    pipe::pipe_read(k, pipe_id, buf)
}

/// Blocking write to a peer socket: delegates to its write pipe.
pub(crate) fn socket_write(k: KernelGuard, sid: SocketId, buf: &[u8]) -> SyscallResult<usize> {
    let pipe_id = {
        let sc = k.sockets.get(&sid).ok_or(SyscallError::BadFd)?;
        let SocketKind::Peer(peer) = &sc.kind else {
            return Err(SyscallError::NotConnected);
        };
        peer.write_pipe.ok_or(SyscallError::NotConnected)?
    };
    pipe::pipe_write(k, pipe_id, buf)
}

/// Stream close for a socket FCB.
///
/// A listener leaves the port map and wakes blocked accepts and every
/// queued connector; a peer closes its half of both pipes. The
/// control block itself lingers while transient references exist.
pub(crate) fn socket_close(k: &mut Kernel, sid: SocketId) -> SyscallResult<()> {
    enum Cleanup {
        None,
        Listener(u16, Vec<RequestId>, CondVar),
        Peer(Option<PipeId>, Option<PipeId>),
    }

    let cleanup = {
        let Some(sc) = k.sockets.get_mut(&sid) else {
            return Err(SyscallError::BadFd);
        };
        sc.fcb = None;
        match &mut sc.kind {
            SocketKind::Unbound => Cleanup::None,
            SocketKind::Listener(listener) => Cleanup::Listener(
                sc.port,
                listener.queue.drain(..).collect(),
                listener.req_available.clone(),
            ),
            SocketKind::Peer(peer) => Cleanup::Peer(peer.read_pipe.take(), peer.write_pipe.take()),
        }
    };

    match cleanup {
        Cleanup::None => {}
        Cleanup::Listener(port, queued, req_available) => {
            if k.port_map[port as usize] == Some(sid) {
                k.port_map[port as usize] = None;
            }
            // blocked accepts notice the missing port map entry;
            // queued connectors are refused rather than left sleeping
            req_available.broadcast();
            for rid in queued {
                if let Some(req) = k.requests.get_mut(&rid) {
                    req.refused = true;
                    req.connected_cv.broadcast();
                }
            }
            debug!("{} stopped listening on port {}", sid, port);
        }
        Cleanup::Peer(read_pipe, write_pipe) => {
            if let Some(id) = read_pipe {
                pipe::reader_close(k, id)?;
            }
            if let Some(id) = write_pipe {
                pipe::writer_close(k, id)?;
            }
            trace!("{} closed", sid);
        }
    }

    if let Some(sc) = k.sockets.get(&sid) {
        if sc.refcount == 0 {
            k.sockets.remove(&sid);
        }
    }
    Ok(())
}

/// Drop a transient reference taken by accept or connect.
pub(crate) fn socket_decref(k: &mut Kernel, sid: SocketId) {
    if let Some(sc) = k.sockets.get_mut(&sid) {
        debug_assert!(sc.refcount > 0);
        sc.refcount -= 1;
        if sc.refcount == 0 && sc.fcb.is_none() {
            k.sockets.remove(&sid);
        }
    }
}

/// Resolve a file id to the socket behind it.
fn resolve_socket(k: &Kernel, pid: Pid, fid: Fid) -> SyscallResult<SocketId> {
    let key = streams::get_fcb(k, pid, fid).ok_or(SyscallError::BadFd)?;
    match k.fcbs.get(key).map(|fcb| fcb.stream) {
        Some(StreamObj::Socket(sid)) => Ok(sid),
        _ => Err(SyscallError::InvalidArgument),
    }
}
