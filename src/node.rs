// Copyright 2020 Joyent, Inc.

//! Cluster node handles.
//!
//! A node is created the first time an endpoint answers a ping with a
//! previously-unseen server name, and co-owned from then on by the cluster
//! node vector, the partition table, and any in-flight operations. Every
//! reserve/release site carries a short tag (O, L, C, I, R, PR, PW, T) so
//! that a leaked reference shows up in the trace log as an unbalanced tag.

use std::net::SocketAddrV4;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use slog::{debug, info, trace, Logger};

use crate::cluster::ClusterInner;
use crate::conn_pool::{self, ClaimError, ConnQueue};

/// Sentinel for a node that has never reported a partition generation.
pub const PARTITION_GENERATION_UNKNOWN: u32 = 0xFFFF_FFFF;

// Accumulated dun score above which the eviction latch fires.
const DUN_THRESHOLD: u32 = 800;

/// The failure kinds that degrade a node's health score. It takes a
/// sustained run of user timeouts to evict a node, while a bad name or a
/// failed replicas fetch evicts on the spot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DunReason {
    UserTimeout,
    NetworkError,
    RestartFd,
    InfoFail,
    ReplicasFetch,
    NoEndpoint,
    BadName,
}

impl DunReason {
    fn weight(self) -> u32 {
        match self {
            DunReason::UserTimeout => 1,
            DunReason::NetworkError | DunReason::RestartFd => 50,
            DunReason::InfoFail => 300,
            DunReason::ReplicasFetch | DunReason::NoEndpoint | DunReason::BadName => 1000,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            DunReason::UserTimeout => "user timeout",
            DunReason::NetworkError => "network error",
            DunReason::RestartFd => "restart fd",
            DunReason::InfoFail => "info fail",
            DunReason::ReplicasFetch => "replicas fetch",
            DunReason::NoEndpoint => "no endpoint",
            DunReason::BadName => "bad name",
        }
    }
}

/// A reference-counted handle to one server node.
pub struct Node {
    name: String,
    endpoints: Mutex<Vec<SocketAddrV4>>,
    pub(crate) conn_q: ConnQueue,
    dun_count: AtomicU32,
    dunned: AtomicBool,
    pub(crate) partition_generation: AtomicU32,
    pub(crate) partition_last_req_ms: AtomicU64,
    // Lookup only; the cluster's lifetime strictly encloses every node's.
    pub(crate) cluster: Weak<ClusterInner>,
    pub(crate) log: Logger,
}

impl Node {
    pub(crate) fn new(name: &str, cluster: Weak<ClusterInner>, log: &Logger) -> Arc<Node> {
        let log = log.new(slog::o!("node" => name.to_string()));
        info!(log, "creating node {}", name);

        let node = Arc::new(Node {
            name: name.to_string(),
            endpoints: Mutex::new(Vec::with_capacity(4)),
            conn_q: ConnQueue::new(),
            dun_count: AtomicU32::new(0),
            dunned: AtomicBool::new(false),
            partition_generation: AtomicU32::new(PARTITION_GENERATION_UNKNOWN),
            partition_last_req_ms: AtomicU64::new(0),
            cluster,
            log,
        });
        trace!(node.log, "node reserve: O+ {} : {}", node.name, Arc::strong_count(&node));
        node
    }

    /// The opaque name the server reported for itself.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoints(&self) -> Vec<SocketAddrV4> {
        self.endpoints.lock().unwrap().clone()
    }

    pub(crate) fn first_endpoint(&self) -> Option<SocketAddrV4> {
        self.endpoints.lock().unwrap().first().copied()
    }

    /// Append an endpoint if it is not already present. Returns true when
    /// the endpoint was new.
    pub(crate) fn add_endpoint(&self, addr: SocketAddrV4) -> bool {
        let mut endpoints = self.endpoints.lock().unwrap();
        if endpoints.contains(&addr) {
            false
        } else {
            endpoints.push(addr);
            true
        }
    }

    pub(crate) fn has_endpoint(&self, addr: SocketAddrV4) -> bool {
        self.endpoints.lock().unwrap().contains(&addr)
    }

    pub fn is_dunned(&self) -> bool {
        self.dunned.load(Ordering::Acquire)
    }

    pub(crate) fn dun_count(&self) -> u32 {
        self.dun_count.load(Ordering::Relaxed)
    }

    pub fn partition_generation(&self) -> u32 {
        self.partition_generation.load(Ordering::Relaxed)
    }

    /// Apply one health demerit. Latches `dunned` once the accumulated
    /// score crosses the threshold; the latch never clears.
    pub(crate) fn dun(&self, reason: DunReason) {
        let count = self.dun_count.fetch_add(reason.weight(), Ordering::AcqRel)
            + reason.weight();

        match reason {
            DunReason::UserTimeout => {
                let prev = count - reason.weight();
                if prev == 0 || prev == 50 || prev == 100 || prev == 200 {
                    debug!(
                        self.log,
                        "dun node: {} reason: {} count: {}",
                        self.name,
                        reason.as_str(),
                        count
                    );
                }
            }
            _ => debug!(
                self.log,
                "dun node: {} reason: {} count: {}",
                self.name,
                reason.as_str(),
                count
            ),
        }

        if count > DUN_THRESHOLD && !self.dunned.swap(true, Ordering::AcqRel) {
            info!(self.log, "dun node: node {} fully dunned {}", self.name, count);
        }
    }

    /// Reset the health score after any successful info reply. The dunned
    /// latch is not cleared.
    pub(crate) fn ok(&self) {
        debug!(self.log, "ok node: {}", self.name);
        self.dun_count.store(0, Ordering::Release);
    }

    /// Loan a pooled or freshly-connected stream for traffic.
    pub fn claim_connection(&self) -> Result<TcpStream, ClaimError> {
        conn_pool::claim(self)
    }

    /// Return a healthy stream to the idle queue.
    pub fn return_connection(&self, stream: TcpStream) {
        conn_pool::release(self, stream);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        info!(self.log, "cluster node destroy: node {}", self.name);
        let closed = self.conn_q.drain();
        if let Some(cluster) = self.cluster.upgrade() {
            cluster.stats.conns_destroyed.fetch_add(closed, Ordering::Relaxed);
            cluster.stats.nodes_destroyed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("endpoints", &self.endpoints())
            .field("dun_count", &self.dun_count())
            .field("dunned", &self.is_dunned())
            .finish()
    }
}

/// Take one tagged strong reference.
pub(crate) fn reserve(node: &Arc<Node>, tag: &str) -> Arc<Node> {
    trace!(
        node.log,
        "node reserve: {} {} : {}",
        tag,
        node.name,
        Arc::strong_count(node)
    );
    Arc::clone(node)
}

/// Drop one tagged strong reference.
pub(crate) fn release(node: Arc<Node>, tag: &str) {
    trace!(
        node.log,
        "node release: {} {} : {}",
        tag,
        node.name,
        Arc::strong_count(&node)
    );
    drop(node);
}

/// Milliseconds since the UNIX epoch, for partition-fetch pacing.
pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::{o, Discard};

    fn test_node() -> Arc<Node> {
        Node::new("BB9020011AC4202", Weak::new(), &Logger::root(Discard, o!()))
    }

    #[test]
    fn dun_latches_above_threshold() {
        let node = test_node();
        for _ in 0..800 {
            node.dun(DunReason::UserTimeout);
        }
        assert!(!node.is_dunned());
        node.dun(DunReason::UserTimeout);
        assert!(node.is_dunned());
    }

    #[test]
    fn heavy_reasons_latch_immediately() {
        for reason in &[
            DunReason::BadName,
            DunReason::ReplicasFetch,
            DunReason::NoEndpoint,
        ] {
            let node = test_node();
            node.dun(*reason);
            assert!(node.is_dunned(), "{:?} should latch in one event", reason);
        }
    }

    #[test]
    fn network_errors_accumulate() {
        let node = test_node();
        for _ in 0..16 {
            node.dun(DunReason::NetworkError);
        }
        assert!(!node.is_dunned());
        node.dun(DunReason::NetworkError);
        assert!(node.is_dunned());
    }

    #[test]
    fn ok_resets_count_but_not_latch() {
        let node = test_node();
        for _ in 0..300 {
            node.dun(DunReason::UserTimeout);
        }
        node.ok();
        assert_eq!(node.dun_count(), 0);
        assert!(!node.is_dunned());

        node.dun(DunReason::BadName);
        node.ok();
        assert_eq!(node.dun_count(), 0);
        assert!(node.is_dunned());
    }

    #[test]
    fn endpoints_are_unique() {
        let node = test_node();
        let sa = "10.0.0.1:3000".parse().unwrap();
        assert!(node.add_endpoint(sa));
        assert!(!node.add_endpoint(sa));
        assert_eq!(node.endpoints().len(), 1);
        assert!(node.has_endpoint(sa));
    }
}
