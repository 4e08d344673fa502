// Copyright 2020 Joyent, Inc.

//! Cluster membership and routing.
//!
//! Each cluster runs one manager thread. Timer callbacks (the periodic
//! tender and the per-node probes), DNS helper threads, and info helper
//! threads all communicate with it through a single mpsc channel, so every
//! mutation of the node set and partition table happens on the manager.
//! Traffic threads only touch the routing state under `node_v_lock` (the
//! `routing` mutex) and the nodes' own atomics.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use slog::{debug, info, o, trace, warn, Drain, Logger};

use crate::error::Error;
use crate::info;
use crate::node::{self, now_ms, DunReason, Node};
use crate::partition::{partition_id, Digest, PartitionTable};
use crate::resolver::{self, Seed};
use crate::scan::ScanPool;

// Tend intervals. The node interval sits below the cluster interval so a
// freshly added node is probed before the next cluster pass.
const DEFAULT_TEND_INTERVAL_MS: u64 = 1200;
const DEFAULT_NODE_TEND_INTERVAL_MS: u64 = 1000;
const DEFAULT_INFO_TIMEOUT_MS: u64 = 3000;
const DEFAULT_SCAN_THREADS: usize = 8;

// Minimum spacing between partition-table fetches from one node. Better
// for clients to run slightly out of date than to hammer the server.
const PARTITION_REFRESH_MIN_MS: u64 = 5000;

const MAX_DESTROY_DELAY_MS: u64 = 60_000;

/// The configuration options for a cluster. Unset fields take the crate
/// defaults.
#[derive(Debug, Default)]
pub struct ClusterOptions {
    /// Adopt nodes discovered through gossip. Defaults to true.
    pub follow: Option<bool>,
    /// Cluster tender period in milliseconds.
    pub tend_interval_ms: Option<u64>,
    /// Per-node probe period in milliseconds.
    pub node_tend_interval_ms: Option<u64>,
    /// Deadline for one info exchange in milliseconds.
    pub info_timeout_ms: Option<u64>,
    /// Worker threads servicing scan fan-out. Ignored when `scan_pool`
    /// is supplied.
    pub scan_threads: Option<usize>,
    /// A scan worker pool to share with other clusters. The cluster
    /// builds a private pool when unset.
    pub scan_pool: Option<Arc<ScanPool>>,
    /// An optional `slog` logger. Falls back to the `slog-stdlog` drain.
    pub log: Option<Logger>,
}

/// Cumulative counters for one cluster.
#[derive(Default)]
pub struct ClusterStats {
    pub(crate) nodes_created: AtomicU64,
    pub(crate) nodes_destroyed: AtomicU64,
    pub(crate) conns_created: AtomicU64,
    pub(crate) conns_connected: AtomicU64,
    pub(crate) conns_destroyed: AtomicU64,
    pub(crate) partition_processes: AtomicU64,
}

/// A point-in-time copy of [`ClusterStats`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ClusterStatsSnapshot {
    pub nodes_created: u64,
    pub nodes_destroyed: u64,
    pub conns_created: u64,
    pub conns_connected: u64,
    pub conns_destroyed: u64,
    pub partition_processes: u64,
    /// Total nodes in the vector, dunned or not.
    pub node_count: usize,
}

impl ClusterStats {
    fn snapshot(&self, node_count: usize) -> ClusterStatsSnapshot {
        ClusterStatsSnapshot {
            nodes_created: self.nodes_created.load(Ordering::Relaxed),
            nodes_destroyed: self.nodes_destroyed.load(Ordering::Relaxed),
            conns_created: self.conns_created.load(Ordering::Relaxed),
            conns_connected: self.conns_connected.load(Ordering::Relaxed),
            conns_destroyed: self.conns_destroyed.load(Ordering::Relaxed),
            partition_processes: self.partition_processes.load(Ordering::Relaxed),
            node_count,
        }
    }
}

// Everything guarded by the node-vector lock: the node list itself, the
// round-robin cursor, and the partition slots.
pub(crate) struct Routing {
    pub(crate) node_v: Vec<Arc<Node>>,
    last_node: usize,
    pub(crate) partitions: PartitionTable,
}

pub(crate) struct ClusterInner {
    pub(crate) log: Logger,
    seeds: Mutex<Vec<Seed>>,
    pub(crate) routing: Mutex<Routing>,
    n_partitions: AtomicU32,
    follow: AtomicBool,
    pub(crate) shutdown: AtomicBool,
    requests_in_progress: AtomicI64,
    infos_in_progress: AtomicI64,
    pending_q: Mutex<VecDeque<Sender<()>>>,
    mgr_tx: Mutex<Option<Sender<MgrMsg>>>,
    pub(crate) stats: ClusterStats,
    info_timeout: Duration,
    node_tend_interval_ms: u64,
}

enum InfoPurpose {
    Ping { addr: SocketAddrV4 },
    NodeStatus { name: String },
    Replicas { name: String },
}

enum MgrMsg {
    TendTick,
    NodeTick(String),
    SeedResolved(Vec<SocketAddrV4>),
    InfoDone {
        purpose: InfoPurpose,
        result: Result<Vec<(String, String)>, Error>,
    },
    Stop,
}

/// A handle to one cluster. Clones share the underlying cluster; only the
/// original handle may destroy it, mirroring the thread-handle ownership.
pub struct Cluster {
    inner: Arc<ClusterInner>,
    mgr_thread: Option<thread::JoinHandle<()>>,
    scan_pool: Arc<ScanPool>,
    owns_scan_pool: bool,
}

impl Clone for Cluster {
    fn clone(&self) -> Cluster {
        Cluster {
            inner: Arc::clone(&self.inner),
            mgr_thread: None,
            scan_pool: Arc::clone(&self.scan_pool),
            owns_scan_pool: false,
        }
    }
}

impl Cluster {
    /// Create a cluster and start its manager thread. Seed hosts are added
    /// with [`Cluster::add_host`].
    pub fn create(options: ClusterOptions) -> Result<Cluster, Error> {
        let logger = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        info!(logger, "cluster create");

        let inner = Arc::new(ClusterInner {
            log: logger,
            seeds: Mutex::new(Vec::new()),
            routing: Mutex::new(Routing {
                node_v: Vec::new(),
                last_node: 0,
                partitions: PartitionTable::new(),
            }),
            n_partitions: AtomicU32::new(0),
            follow: AtomicBool::new(options.follow.unwrap_or(true)),
            shutdown: AtomicBool::new(false),
            requests_in_progress: AtomicI64::new(0),
            infos_in_progress: AtomicI64::new(0),
            pending_q: Mutex::new(VecDeque::new()),
            mgr_tx: Mutex::new(None),
            stats: ClusterStats::default(),
            info_timeout: Duration::from_millis(
                options.info_timeout_ms.unwrap_or(DEFAULT_INFO_TIMEOUT_MS),
            ),
            node_tend_interval_ms: options
                .node_tend_interval_ms
                .unwrap_or(DEFAULT_NODE_TEND_INTERVAL_MS),
        });

        let (tx, rx) = channel();
        *inner.mgr_tx.lock().unwrap() = Some(tx.clone());

        let tend_interval_ms = options.tend_interval_ms.unwrap_or(DEFAULT_TEND_INTERVAL_MS);

        // Hold the manager at a barrier until the cluster is assembled.
        let barrier = Arc::new(Barrier::new(2));
        let barrier_clone = Arc::clone(&barrier);
        let mgr_inner = Arc::clone(&inner);
        let mgr_thread = thread::spawn(move || {
            barrier_clone.wait();
            let manager = Manager {
                inner: mgr_inner,
                tx,
                timer: timer::Timer::new(),
                node_timers: HashMap::new(),
            };
            manager.run(rx, tend_interval_ms);
        });

        let (scan_pool, owns_scan_pool) = match options.scan_pool {
            Some(pool) => (pool, false),
            None => (
                Arc::new(ScanPool::new(
                    options.scan_threads.unwrap_or(DEFAULT_SCAN_THREADS),
                    &inner.log,
                )),
                true,
            ),
        };

        barrier.wait();

        Ok(Cluster {
            inner,
            mgr_thread: Some(mgr_thread),
            scan_pool,
            owns_scan_pool,
        })
    }

    /// Register a seed host. Repeat calls with the same host and port are
    /// no-ops. Fires the tender immediately to speed up resolution.
    pub fn add_host(&self, host: &str, port: u16) {
        debug!(self.inner.log, "adding host {}:{}", host, port);

        let seed = Seed::new(host, port);
        {
            let mut seeds = self.inner.seeds.lock().unwrap();
            if seeds.contains(&seed) {
                return;
            }
            seeds.push(seed);
        }

        if let Some(tx) = &*self.inner.mgr_tx.lock().unwrap() {
            let _ = tx.send(MgrMsg::TendTick);
        }
    }

    /// Control whether gossip-discovered nodes are adopted.
    pub fn follow(&self, flag: bool) {
        self.inner.follow.store(flag, Ordering::Release);
    }

    /// The number of healthy nodes: named, not dunned, with at least one
    /// endpoint.
    pub fn active_node_count(&self) -> usize {
        let routing = self.inner.routing.lock().unwrap();
        routing
            .node_v
            .iter()
            .filter(|n| !n.is_dunned() && !n.endpoints().is_empty())
            .count()
    }

    pub fn requests_in_progress(&self) -> i64 {
        self.inner.requests_in_progress.load(Ordering::Acquire)
    }

    /// The partition count discovered from the first node ping; zero until
    /// a node has answered.
    pub fn n_partitions(&self) -> u32 {
        self.inner.n_partitions.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ClusterStatsSnapshot {
        let node_count = self.inner.routing.lock().unwrap().node_v.len();
        self.inner.stats.snapshot(node_count)
    }

    pub fn node_names(&self) -> Vec<String> {
        let routing = self.inner.routing.lock().unwrap();
        routing.node_v.iter().map(|n| n.name().to_string()).collect()
    }

    /// Block until at least one node is known, or the timeout passes.
    /// Requests that arrive before discovery park here and are released by
    /// the first successful ping.
    pub fn wait_for_node(&self, timeout: Duration) -> bool {
        if !self.inner.routing.lock().unwrap().node_v.is_empty() {
            return true;
        }

        let (tx, rx) = channel();
        self.inner.pending_q.lock().unwrap().push_back(tx);

        // A node may have landed while we registered.
        if !self.inner.routing.lock().unwrap().node_v.is_empty() {
            return true;
        }

        rx.recv_timeout(timeout).is_ok()
    }

    /// Route a record to its replica node. Falls back to a round-robin
    /// pick when the partition table cannot answer.
    pub fn get_node(
        &self,
        namespace: &str,
        digest: &Digest,
        write: bool,
    ) -> Result<Arc<Node>, Error> {
        let n_partitions = self.inner.n_partitions.load(Ordering::Acquire);
        let mut routing = self.inner.routing.lock().unwrap();

        if n_partitions > 0 {
            let pid = partition_id(digest, n_partitions);
            if let Some(target) = routing.partitions.get(namespace, pid, write) {
                if !target.is_dunned() {
                    return Ok(target);
                }
                node::release(target, "T-");
            }
        }

        random_node_locked(&mut routing).ok_or(Error::ClusterEmpty)
    }

    /// Look a node up by its server-assigned name.
    pub fn node_by_name(&self, name: &str) -> Option<Arc<Node>> {
        let routing = self.inner.routing.lock().unwrap();
        routing
            .node_v
            .iter()
            .find(|n| n.name() == name)
            .map(|n| node::reserve(n, "O+"))
    }

    // Reserve every healthy node for a fan-out.
    pub(crate) fn reserve_nodes(&self) -> Vec<Arc<Node>> {
        let routing = self.inner.routing.lock().unwrap();
        routing
            .node_v
            .iter()
            .filter(|n| !n.is_dunned())
            .map(|n| node::reserve(n, "T+"))
            .collect()
    }

    pub(crate) fn scan_pool(&self) -> &ScanPool {
        &self.scan_pool
    }

    pub(crate) fn log(&self) -> &Logger {
        &self.inner.log
    }

    pub(crate) fn requests_guard(&self) -> RequestsGuard {
        self.inner.requests_in_progress.fetch_add(1, Ordering::AcqRel);
        RequestsGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Tear the cluster down: wait `delay_ms`, stop the manager after
    /// draining in-flight info requests, purge the node set and partition
    /// table, and free the seed list. Only the original handle may call
    /// this; clones get an error.
    pub fn destroy(&mut self, delay_ms: u64) -> Result<(), Error> {
        if self.mgr_thread.is_none() {
            trace!(self.inner.log, "destroy called by cluster handle clone");
            return Err(Error::DestroyCalledByClone);
        }

        let delay_ms = if delay_ms > MAX_DESTROY_DELAY_MS {
            warn!(
                self.inner.log,
                "cluster destroy delay_ms {} doesn't look right, using 100", delay_ms
            );
            100
        } else {
            delay_ms
        };
        thread::sleep(Duration::from_millis(delay_ms));

        info!(self.inner.log, "cluster destroy");
        if self.requests_in_progress() != 0 {
            warn!(self.inner.log, "cluster destroy with requests in progress");
        }

        self.inner.shutdown.store(true, Ordering::Release);

        if let Some(tx) = self.inner.mgr_tx.lock().unwrap().take() {
            let _ = tx.send(MgrMsg::Stop);
        }
        if let Some(handle) = self.mgr_thread.take() {
            let _ = handle.join();
        }

        {
            let mut routing = self.inner.routing.lock().unwrap();
            routing.partitions.clear();
            routing.last_node = 0;
            while let Some(target) = routing.node_v.pop() {
                node::release(target, "C-");
            }
        }
        self.inner.pending_q.lock().unwrap().clear();
        self.inner.seeds.lock().unwrap().clear();

        // A shared pool belongs to whoever built it; only a private pool
        // stops with its cluster.
        if self.owns_scan_pool {
            self.scan_pool.shutdown();
        }
        Ok(())
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        // Clones fall through; destroy reports the attempt at trace level.
        let _ = self.destroy(0);
    }
}

fn random_node_locked(routing: &mut Routing) -> Option<Arc<Node>> {
    let size = routing.node_v.len();
    if size == 0 {
        return None;
    }
    for _ in 0..size {
        routing.last_node = (routing.last_node + 1) % size;
        let candidate = &routing.node_v[routing.last_node];
        if !candidate.is_dunned() {
            return Some(node::reserve(candidate, "T+"));
        }
    }
    None
}

/// Holds `requests_in_progress` high for the duration of an operation.
pub(crate) struct RequestsGuard {
    inner: Arc<ClusterInner>,
}

impl Drop for RequestsGuard {
    fn drop(&mut self) {
        self.inner.requests_in_progress.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An explicit registry of clusters, so shutdown hooks can tear down
/// everything that was created without hidden module state. Register the
/// original handle and keep clones for traffic.
#[derive(Default)]
pub struct ClusterRegistry {
    clusters: Mutex<Vec<Cluster>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        ClusterRegistry {
            clusters: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, cluster: Cluster) {
        self.clusters.lock().unwrap().push(cluster);
    }

    pub fn len(&self) -> usize {
        self.clusters.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every registered cluster.
    pub fn shutdown_all(&self, delay_ms: u64) {
        let mut clusters: Vec<Cluster> = self.clusters.lock().unwrap().drain(..).collect();
        for cluster in clusters.iter_mut() {
            let _ = cluster.destroy(delay_ms);
        }
    }
}

// The manager: owns the timers and applies every membership mutation.
struct Manager {
    inner: Arc<ClusterInner>,
    tx: Sender<MgrMsg>,
    timer: timer::Timer,
    node_timers: HashMap<String, timer::Guard>,
}

impl Manager {
    fn run(mut self, rx: Receiver<MgrMsg>, tend_interval_ms: u64) {
        let tend_tx = self.tx.clone();
        let _tend_guard = self.timer.schedule_repeating(
            chrono::Duration::milliseconds(tend_interval_ms as i64),
            move || {
                let _ = tend_tx.send(MgrMsg::TendTick);
            },
        );

        // First tend happens right away, not one period out.
        let _ = self.tx.send(MgrMsg::TendTick);

        let mut stopping = false;
        while let Ok(msg) = rx.recv() {
            match msg {
                MgrMsg::Stop => stopping = true,
                MgrMsg::TendTick => {
                    if !stopping && !self.inner.shutdown.load(Ordering::Acquire) {
                        self.tend();
                    }
                }
                MgrMsg::NodeTick(name) => self.node_tick(&name, stopping),
                MgrMsg::SeedResolved(addrs) => {
                    if !stopping {
                        for addr in addrs {
                            self.sockaddr_observed(addr);
                        }
                    }
                }
                MgrMsg::InfoDone { purpose, result } => {
                    self.info_done(purpose, result, stopping)
                }
            }

            if stopping && self.inner.infos_in_progress.load(Ordering::Acquire) == 0 {
                break;
            }
        }
        trace!(self.inner.log, "cluster manager exiting");
    }

    // One tender pass: when the node set is empty, go back to the seeds.
    fn tend(&mut self) {
        debug!(self.inner.log, "cluster tend");
        self.dump();

        let size = self.inner.routing.lock().unwrap().node_v.len();
        if size != 0 {
            return;
        }

        let seeds = self.inner.seeds.lock().unwrap().clone();
        for seed in seeds {
            debug!(self.inner.log, "lookup hosts: {}:{}", seed.host, seed.port);
            match resolver::resolve_immediate(&seed.host, seed.port) {
                Some(addr) => self.sockaddr_observed(addr),
                None => {
                    let tx = self.tx.clone();
                    let log = self.inner.log.clone();
                    thread::spawn(move || match resolver::resolve(&seed.host, seed.port) {
                        Ok(addrs) => {
                            let _ = tx.send(MgrMsg::SeedResolved(addrs));
                        }
                        Err(e) => {
                            info!(log, "seed {}:{} resolution failed: {}", seed.host, seed.port, e)
                        }
                    });
                }
            }
        }
    }

    fn dump(&self) {
        let log = &self.inner.log;
        debug!(log, "=*=*= cluster dump =*=*=");
        for (i, seed) in self.inner.seeds.lock().unwrap().iter().enumerate() {
            debug!(log, " host {}: {}:{}", i, seed.host, seed.port);
        }
        let routing = self.inner.routing.lock().unwrap();
        debug!(log, "nodes: {}", routing.node_v.len());
        for (i, n) in routing.node_v.iter().enumerate() {
            debug!(
                log,
                " {} {} : {:?} ({} conns)",
                i,
                n.name(),
                n.first_endpoint(),
                n.conn_q.len()
            );
        }
    }

    // A new address has turned up: from a seed, gossip, or DNS. Debounce
    // against the union of known endpoints and ping anything new.
    fn sockaddr_observed(&mut self, addr: SocketAddrV4) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return;
        }

        {
            let routing = self.inner.routing.lock().unwrap();
            if routing.node_v.iter().any(|n| n.has_endpoint(addr)) {
                return;
            }
        }

        info!(self.inner.log, "new sockaddr found: {}", addr);

        let names = if self.inner.n_partitions.load(Ordering::Acquire) == 0 {
            "node\npartitions"
        } else {
            "node"
        };
        self.spawn_info(addr, names, InfoPurpose::Ping { addr });
    }

    fn spawn_info(&self, addr: SocketAddrV4, names: &str, purpose: InfoPurpose) {
        let inner = Arc::clone(&self.inner);
        let tx = self.tx.clone();
        let names = names.to_string();

        self.inner.infos_in_progress.fetch_add(1, Ordering::AcqRel);
        thread::spawn(move || {
            let result = info::exchange(addr, &names, inner.info_timeout);
            inner.infos_in_progress.fetch_sub(1, Ordering::AcqRel);
            let _ = tx.send(MgrMsg::InfoDone { purpose, result });
        });
    }

    // The per-node probe. Evicts a dunned node; otherwise asks it for its
    // name, partition generation, and gossip, and re-arms.
    fn node_tick(&mut self, name: &str, stopping: bool) {
        let target = {
            let routing = self.inner.routing.lock().unwrap();
            routing
                .node_v
                .iter()
                .find(|n| n.name() == name)
                .map(|n| node::reserve(n, "O+"))
        };
        let target = match target {
            Some(n) => n,
            None => {
                self.node_timers.remove(name);
                return;
            }
        };

        if target.is_dunned() {
            info!(
                self.inner.log,
                "node {} fully dunned, removed from cluster and node timer", name
            );
            let removed = {
                let mut routing = self.inner.routing.lock().unwrap();
                routing.partitions.remove_node(&target);
                routing
                    .node_v
                    .iter()
                    .position(|n| Arc::ptr_eq(n, &target))
                    .map(|pos| routing.node_v.remove(pos))
            };
            if let Some(removed) = removed {
                node::release(removed, "C-");
            }
            self.node_timers.remove(name);
            node::release(target, "O-");
            return;
        }

        if stopping || self.inner.shutdown.load(Ordering::Acquire) {
            self.node_timers.remove(name);
            node::release(target, "O-");
            return;
        }

        match target.first_endpoint() {
            Some(addr) => self.spawn_info(
                addr,
                "node\npartition-generation\nservices",
                InfoPurpose::NodeStatus {
                    name: name.to_string(),
                },
            ),
            None => target.dun(DunReason::NoEndpoint),
        }
        node::release(target, "O-");

        self.arm_node_timer(name);
    }

    fn arm_node_timer(&mut self, name: &str) {
        let tx = self.tx.clone();
        let name_owned = name.to_string();
        let guard = self.timer.schedule_with_delay(
            chrono::Duration::milliseconds(self.inner.node_tend_interval_ms as i64),
            move || {
                let _ = tx.send(MgrMsg::NodeTick(name_owned.clone()));
            },
        );
        self.node_timers.insert(name.to_string(), guard);
    }

    fn info_done(
        &mut self,
        purpose: InfoPurpose,
        result: Result<Vec<(String, String)>, Error>,
        stopping: bool,
    ) {
        match purpose {
            InfoPurpose::Ping { addr } => self.ping_done(addr, result, stopping),
            InfoPurpose::NodeStatus { name } => self.node_status_done(&name, result, stopping),
            InfoPurpose::Replicas { name } => self.replicas_done(&name, result, stopping),
        }
    }

    // A ping told us the name behind a fresh address. Attach the address
    // to the named node, creating it on first sight.
    fn ping_done(
        &mut self,
        addr: SocketAddrV4,
        result: Result<Vec<(String, String)>, Error>,
        stopping: bool,
    ) {
        if stopping || self.inner.shutdown.load(Ordering::Acquire) {
            debug!(self.inner.log, "ping reply for {} during shutdown, discarding", addr);
            return;
        }
        let pairs = match result {
            Ok(pairs) => pairs,
            Err(e) => {
                info!(self.inner.log, "ping node function: error on return {}", e);
                return;
            }
        };

        for (name, value) in &pairs {
            match name.as_str() {
                "node" => self.attach_endpoint(value, addr),
                "partitions" => {
                    if self.inner.n_partitions.load(Ordering::Acquire) == 0 {
                        match value.parse::<u32>() {
                            Ok(n) if n > 0 => {
                                self.inner.n_partitions.store(n, Ordering::Release)
                            }
                            _ => warn!(self.inner.log, "bad partitions value {}", value),
                        }
                    }
                }
                _ => (),
            }
        }

        // If requests were parked waiting for discovery, release them.
        if !self.inner.routing.lock().unwrap().node_v.is_empty() {
            let mut pending = self.inner.pending_q.lock().unwrap();
            while let Some(waiter) = pending.pop_front() {
                debug!(self.inner.log, "have node now, restart request");
                let _ = waiter.send(());
            }
        }
    }

    fn attach_endpoint(&mut self, name: &str, addr: SocketAddrV4) {
        let existing = {
            let routing = self.inner.routing.lock().unwrap();
            routing
                .node_v
                .iter()
                .find(|n| n.name() == name)
                .map(|n| node::reserve(n, "O+"))
        };

        let target = match existing {
            Some(n) => n,
            None => {
                let created = Node::new(name, Arc::downgrade(&self.inner), &self.inner.log);
                self.inner.stats.nodes_created.fetch_add(1, Ordering::Relaxed);
                {
                    let mut routing = self.inner.routing.lock().unwrap();
                    routing.node_v.push(node::reserve(&created, "C+"));
                }
                self.arm_node_timer(name);
                created
            }
        };

        target.add_endpoint(addr);
        node::release(target, "O-");
    }

    // The periodic probe reply: verify the name, watch the partition
    // generation, and feed gossip back into discovery.
    fn node_status_done(
        &mut self,
        name: &str,
        result: Result<Vec<(String, String)>, Error>,
        stopping: bool,
    ) {
        let target = {
            let routing = self.inner.routing.lock().unwrap();
            routing
                .node_v
                .iter()
                .find(|n| n.name() == name)
                .map(|n| node::reserve(n, "O+"))
        };
        let target = match target {
            Some(n) => n,
            None => return,
        };

        if target.is_dunned() || stopping || self.inner.shutdown.load(Ordering::Acquire) {
            node::release(target, "O-");
            return;
        }

        let pairs = match result {
            Ok(pairs) => pairs,
            Err(_) => {
                target.dun(DunReason::InfoFail);
                node::release(target, "O-");
                return;
            }
        };
        target.ok();

        for (pair_name, value) in &pairs {
            match pair_name.as_str() {
                "node" => {
                    if value != name {
                        warn!(
                            self.inner.log,
                            "node name has changed - was {} now {} - likely a bug - dun",
                            name,
                            value
                        );
                        target.dun(DunReason::BadName);
                        break;
                    }
                }
                "partition-generation" => {
                    let generation = match value.parse::<u32>() {
                        Ok(g) => g,
                        Err(_) => continue,
                    };
                    if target.partition_generation.load(Ordering::Acquire) != generation {
                        let now = now_ms();
                        if target.partition_last_req_ms.load(Ordering::Acquire)
                            + PARTITION_REFRESH_MIN_MS
                            < now
                        {
                            info!(self.inner.log, "making partition request of node {}", name);
                            target.partition_last_req_ms.store(now, Ordering::Release);
                            if let Some(addr) = target.first_endpoint() {
                                self.spawn_info(
                                    addr,
                                    "replicas-read\nreplicas-write\npartition-generation",
                                    InfoPurpose::Replicas {
                                        name: name.to_string(),
                                    },
                                );
                            }
                        }
                    }
                }
                "services" => {
                    if self.inner.follow.load(Ordering::Acquire) {
                        self.services_parse(value);
                    }
                }
                _ => (),
            }
        }

        node::release(target, "O-");
    }

    // Gossip: `host:port;host:port`. Hosts are numeric addresses; each new
    // one is pinged immediately and remembered as a seed so the cluster
    // can find its way back after dropping to zero nodes.
    fn services_parse(&mut self, services: &str) {
        let mut found: Vec<(String, u16, SocketAddrV4)> = Vec::new();
        for host_port in services.split(';') {
            if host_port.is_empty() {
                continue;
            }
            let mut parts = host_port.splitn(2, ':');
            let host = parts.next().unwrap_or("");
            let port = match parts.next().and_then(|p| p.parse::<u16>().ok()) {
                Some(p) => p,
                None => continue,
            };
            if let Some(addr) = resolver::resolve_immediate(host, port) {
                found.push((host.to_string(), port, addr));
            }
        }

        for (host, port, addr) in found {
            self.sockaddr_observed(addr);
            let seed = Seed::new(&host, port);
            let mut seeds = self.inner.seeds.lock().unwrap();
            if !seeds.contains(&seed) {
                seeds.push(seed);
            }
        }
    }

    // A fresh replica map: clear the node out of every slot, then install
    // the slots it reported.
    fn replicas_done(
        &mut self,
        name: &str,
        result: Result<Vec<(String, String)>, Error>,
        stopping: bool,
    ) {
        let target = {
            let routing = self.inner.routing.lock().unwrap();
            routing
                .node_v
                .iter()
                .find(|n| n.name() == name)
                .map(|n| node::reserve(n, "O+"))
        };
        let target = match target {
            Some(n) => n,
            None => return,
        };

        if target.is_dunned() || stopping || self.inner.shutdown.load(Ordering::Acquire) {
            node::release(target, "O-");
            return;
        }

        let pairs = match result {
            Ok(pairs) => pairs,
            Err(_) => {
                target.dun(DunReason::ReplicasFetch);
                node::release(target, "O-");
                return;
            }
        };
        target.ok();

        let n_partitions = self.inner.n_partitions.load(Ordering::Acquire);
        let mut routing = self.inner.routing.lock().unwrap();
        routing.partitions.remove_node(&target);
        target.partition_last_req_ms.store(now_ms(), Ordering::Release);

        for (pair_name, value) in &pairs {
            match pair_name.as_str() {
                "replicas-read" => {
                    self.inner.stats.partition_processes.fetch_add(1, Ordering::Relaxed);
                    routing.partitions.process_replicas(
                        n_partitions,
                        &target,
                        value,
                        false,
                        &self.inner.log,
                    );
                }
                "replicas-write" => {
                    self.inner.stats.partition_processes.fetch_add(1, Ordering::Relaxed);
                    routing.partitions.process_replicas(
                        n_partitions,
                        &target,
                        value,
                        true,
                        &self.inner.log,
                    );
                }
                "partition-generation" => {
                    if let Ok(generation) = value.parse::<u32>() {
                        target.partition_generation.store(generation, Ordering::Release);
                        debug!(
                            self.inner.log,
                            "received new partition generation {} node {}", generation, name
                        );
                    }
                }
                _ => (),
            }
        }

        drop(routing);
        node::release(target, "O-");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::Discard;

    fn test_options() -> ClusterOptions {
        ClusterOptions {
            log: Some(Logger::root(Discard, o!())),
            ..ClusterOptions::default()
        }
    }

    #[test]
    fn add_host_is_idempotent() {
        let mut cluster = Cluster::create(test_options()).unwrap();
        cluster.add_host("10.255.255.1", 3000);
        cluster.add_host("10.255.255.1", 3000);
        cluster.add_host("10.255.255.1", 3001);
        assert_eq!(cluster.inner.seeds.lock().unwrap().len(), 2);
        cluster.destroy(0).unwrap();
    }

    #[test]
    fn clone_cannot_destroy() {
        let mut cluster = Cluster::create(test_options()).unwrap();
        let mut handle = cluster.clone();
        assert!(matches!(
            handle.destroy(0),
            Err(Error::DestroyCalledByClone)
        ));
        cluster.destroy(0).unwrap();
    }

    #[test]
    fn empty_cluster_routes_nowhere() {
        let mut cluster = Cluster::create(test_options()).unwrap();
        let digest = Digest::from_key("demo", b"k");
        assert!(matches!(
            cluster.get_node("ns", &digest, false),
            Err(Error::ClusterEmpty)
        ));
        assert_eq!(cluster.active_node_count(), 0);
        cluster.destroy(0).unwrap();
    }

    #[test]
    fn shared_scan_pool_survives_cluster_destroy() {
        let log = Logger::root(Discard, o!());
        let pool = Arc::new(ScanPool::new(2, &log));

        let mut first = Cluster::create(ClusterOptions {
            scan_pool: Some(Arc::clone(&pool)),
            log: Some(log.clone()),
            ..ClusterOptions::default()
        })
        .unwrap();
        let mut second = Cluster::create(ClusterOptions {
            scan_pool: Some(Arc::clone(&pool)),
            log: Some(log),
            ..ClusterOptions::default()
        })
        .unwrap();

        first.destroy(0).unwrap();
        assert!(second.scan_pool().execute(Box::new(|| ())).is_ok());
        second.destroy(0).unwrap();
        assert!(pool.execute(Box::new(|| ())).is_ok());
    }

    #[test]
    fn registry_tears_down_registered_clusters() {
        let registry = ClusterRegistry::new();
        let cluster = Cluster::create(test_options()).unwrap();
        let handle = cluster.clone();
        registry.register(cluster);
        assert_eq!(registry.len(), 1);
        registry.shutdown_all(0);
        assert!(registry.is_empty());
        assert!(handle.inner.shutdown.load(Ordering::Acquire));
    }
}
