// Copyright 2020 Joyent, Inc.

//! Per-node connection pooling.
//!
//! Each node keeps a LIFO of idle `TcpStream`s. A claim pops the most
//! recently parked stream and verifies it is still quietly connected with a
//! non-destructive peek before handing it out. When the queue runs dry a
//! new socket is connected non-blocking against the node's endpoints in
//! order; an in-progress handshake is fine, the claimer's first blocking
//! write completes it.

use std::io;
use std::mem;
use std::net::{SocketAddrV4, TcpStream};
use std::os::unix::io::FromRawFd;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use slog::{debug, info, warn};

use crate::error::Error;
use crate::node::{DunReason, Node};

/// Claim failures, ordered from softest to hardest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClaimError {
    /// A stale idle stream was discarded; claiming again may succeed.
    StaleRetry,
    /// No endpoint accepted a connection right now. The node accrues a
    /// health penalty from the caller.
    Transient,
    /// The node has no usable endpoints; claiming cannot succeed.
    Fatal,
}

impl ClaimError {
    pub fn code(self) -> i32 {
        match self {
            ClaimError::StaleRetry => -1,
            ClaimError::Transient => -2,
            ClaimError::Fatal => -3,
        }
    }
}

impl From<ClaimError> for Error {
    fn from(e: ClaimError) -> Error {
        match e {
            ClaimError::StaleRetry => Error::Transient("stale pooled connection".into()),
            ClaimError::Transient => Error::Transient("no endpoint accepted a connection".into()),
            ClaimError::Fatal => Error::Transient("node has no usable endpoints".into()),
        }
    }
}

enum Liveness {
    Idle,
    PeerClosed,
    Error,
    BadFd,
}

/// The idle-stream queue owned by each node.
pub(crate) struct ConnQueue {
    idle: Mutex<Vec<TcpStream>>,
}

impl ConnQueue {
    pub(crate) fn new() -> Self {
        ConnQueue {
            idle: Mutex::new(Vec::new()),
        }
    }

    fn pop(&self) -> Option<TcpStream> {
        self.idle.lock().unwrap().pop()
    }

    fn push(&self, stream: TcpStream) {
        self.idle.lock().unwrap().push(stream);
    }

    pub(crate) fn len(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    /// Shut down and close every idle stream. Returns the number closed.
    pub(crate) fn drain(&self) -> u64 {
        let mut streams = mem::take(&mut *self.idle.lock().unwrap());
        let count = streams.len() as u64;
        for stream in streams.drain(..) {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        count
    }
}

/// Pop idle streams until a live one turns up, else connect fresh.
pub(crate) fn claim(node: &Node) -> Result<TcpStream, ClaimError> {
    while let Some(stream) = node.conn_q.pop() {
        if stream.set_nonblocking(true).is_err() {
            warn!(node.log, "bad stream in queue for node {}", node.name());
            count_destroyed(node, 1);
            continue;
        }
        match probe(&stream) {
            Liveness::Idle => return Ok(stream),
            Liveness::PeerClosed => {
                debug!(node.log, "idle connection closed by peer");
                count_destroyed(node, 1);
                continue;
            }
            Liveness::Error => {
                count_destroyed(node, 1);
                node.dun(DunReason::RestartFd);
                return Err(ClaimError::StaleRetry);
            }
            Liveness::BadFd => {
                warn!(node.log, "bad stream in queue for node {}", node.name());
                count_destroyed(node, 1);
                continue;
            }
        }
    }

    connect_node(node)
}

pub(crate) fn release(node: &Node, stream: TcpStream) {
    node.conn_q.push(stream);
}

/// Distinguish (connected-idle, peer-closed, error) without consuming any
/// bytes: a zero-length-effect peek on a non-blocking socket.
fn probe(stream: &TcpStream) -> Liveness {
    let mut buf = [0u8; 1];
    match stream.peek(&mut buf) {
        Ok(0) => Liveness::PeerClosed,
        Ok(_) => Liveness::Idle,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Liveness::Idle,
        Err(e) if e.raw_os_error() == Some(libc::EBADF) => Liveness::BadFd,
        Err(_) => Liveness::Error,
    }
}

fn connect_node(node: &Node) -> Result<TcpStream, ClaimError> {
    let endpoints = node.endpoints();
    if endpoints.is_empty() {
        return Err(ClaimError::Fatal);
    }

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0) };
    if fd < 0 {
        warn!(node.log, "could not allocate a socket, serious problem");
        return Err(ClaimError::Transient);
    }
    debug!(node.log, "new socket: fd {} node {}", fd, node.name());
    if let Some(cluster) = node.cluster.upgrade() {
        cluster.stats.conns_created.fetch_add(1, Ordering::Relaxed);
    }

    for endpoint in &endpoints {
        match connect_nonblocking(fd, endpoint) {
            Ok(()) => {
                if let Some(cluster) = node.cluster.upgrade() {
                    cluster.stats.conns_connected.fetch_add(1, Ordering::Relaxed);
                }
                return Ok(unsafe { TcpStream::from_raw_fd(fd) });
            }
            Err(e) if e.raw_os_error() == Some(libc::ECONNREFUSED) => {
                debug!(node.log, "endpoint {} is refusing connections", endpoint);
            }
            Err(e) => {
                info!(node.log, "connect fail: {} ({})", endpoint, e);
            }
        }
    }

    count_destroyed(node, 1);
    unsafe { libc::close(fd) };
    Err(ClaimError::Transient)
}

/// Issue `connect(2)` on a non-blocking socket. Immediate success and
/// `EINPROGRESS` both count as success; the handshake finishes under the
/// claimer's first blocking write.
fn connect_nonblocking(fd: i32, addr: &SocketAddrV4) -> io::Result<()> {
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(*addr.ip()).to_be(),
        },
        sin_zero: [0; 8],
    };

    let rv = unsafe {
        libc::connect(
            fd,
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rv == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        Ok(())
    } else {
        Err(err)
    }
}

fn count_destroyed(node: &Node, n: u64) {
    if let Some(cluster) = node.cluster.upgrade() {
        cluster.stats.conns_destroyed.fetch_add(n, Ordering::Relaxed);
    }
}
