// Copyright 2020 Joyent, Inc.

//! Full-table scans.
//!
//! A scan fans a single shared command out to every cluster node. Each
//! node is driven by a blocking worker that reads the record stream and
//! feeds the user callback; a shared single-writer error slot aggregates
//! partial failures, and the callback may return `false` to abort the
//! whole fan-out cooperatively. Scans never retry, which is what makes
//! the command buffer safe to share between workers.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use derive_more::{Display, From, Into};
use slog::{debug, warn, Logger};

use crate::cluster::Cluster;
use crate::conn_pool::ClaimError;
use crate::error::Error;
use crate::node::{self, DunReason, Node};
use crate::proto::{
    self, split_proto_header, MsgHeader, Record, INFO3_LAST, PROTO_HEADER_SIZE, PROTO_SIZE_MAX,
    PROTO_TYPE_MESSAGE, PROTO_VERSION, RESULT_NOT_FOUND, RESULT_OK,
};

/// A client-chosen 63-bit identifier naming a scan job.
#[derive(Clone, Copy, Debug, Display, Eq, From, Into, PartialEq)]
pub struct TaskId(pub u64);

/// Server-side scheduling priority for a scan.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanPriority {
    Auto = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

/// A background UDF carried by a scan. The argument list is already
/// serialized by the caller; this crate does not own that codec.
#[derive(Clone, Debug)]
pub struct ScanUdf {
    pub module: String,
    pub function: String,
    pub arglist: Vec<u8>,
}

/// What to scan and how to deliver it.
#[derive(Clone, Debug)]
pub struct Scan {
    pub namespace: String,
    pub set: Option<String>,
    pub priority: ScanPriority,
    /// Percentage of records to sample, 1..=100.
    pub percent: u8,
    /// Ask the server for record metadata only.
    pub no_bins: bool,
    /// Restrict the stream to these bins. Empty means all bins.
    pub select: Vec<String>,
    pub udf: Option<ScanUdf>,
    /// Decode msgpack list/map bin values into structured `Value`s.
    pub deserialize_list_map: bool,
    /// Fan out to all nodes in parallel rather than walking them serially.
    pub concurrent: bool,
}

impl Scan {
    pub fn new(namespace: &str) -> Scan {
        Scan {
            namespace: namespace.to_string(),
            set: None,
            priority: ScanPriority::Auto,
            percent: 100,
            no_bins: false,
            select: Vec::new(),
            udf: None,
            deserialize_list_map: true,
            concurrent: false,
        }
    }
}

/// Per-operation knobs that are not properties of the scan itself.
#[derive(Clone, Debug)]
pub struct ScanPolicy {
    /// Total deadline per node in milliseconds. Zero means no deadline.
    pub timeout_ms: u32,
    pub fail_on_cluster_change: bool,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        ScanPolicy {
            timeout_ms: 0,
            fail_on_cluster_change: false,
        }
    }
}

/// Record delivery callback. Invoked once per record with `Some`, then
/// exactly once with `None` when the whole scan completed cleanly. Runs on
/// worker threads in fan-out mode and must be re-entrancy safe. Returning
/// `false` aborts the scan.
pub type ScanCallback = Arc<dyn Fn(Option<&Record>) -> bool + Send + Sync>;

/// Status of a background job, as reported by an external poller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobStatus {
    InProgress,
    Completed,
}

/// The external collaborator that knows how to poll job status.
pub trait JobPoller {
    fn job_status(&self, task_id: TaskId) -> Result<JobStatus, Error>;
}

/// Block until an external poller reports the job complete.
pub fn wait(poller: &dyn JobPoller, task_id: TaskId, interval_ms: u32) -> Result<(), Error> {
    let interval = Duration::from_millis(if interval_ms == 0 {
        1000
    } else {
        u64::from(interval_ms)
    });
    loop {
        match poller.job_status(task_id)? {
            JobStatus::Completed => return Ok(()),
            JobStatus::InProgress => thread::sleep(interval),
        }
    }
}

/// Scan every node, delivering records through the callback.
pub fn foreach(
    cluster: &Cluster,
    policy: &ScanPolicy,
    scan: &Scan,
    callback: ScanCallback,
) -> Result<(), Error> {
    scan_generic(cluster, policy, scan, Some(callback), 0).map(|_| ())
}

/// Scan exactly the named node.
pub fn node(
    cluster: &Cluster,
    policy: &ScanPolicy,
    scan: &Scan,
    node_name: &str,
    callback: ScanCallback,
) -> Result<(), Error> {
    let _requests = cluster.requests_guard();

    let target = cluster
        .node_by_name(node_name)
        .ok_or_else(|| Error::InvalidParameter(format!("invalid node name: {}", node_name)))?;

    let task_id = resolve_task_id(0);
    let cmd = Arc::new(proto::write_scan_command(policy, scan, task_id.0)?);
    let task = ScanTask {
        node: target,
        cmd,
        deadline: policy_deadline(policy),
        callback: Some(Arc::clone(&callback)),
        deserialize_list_map: scan.deserialize_list_map,
        error_latch: Arc::new(AtomicBool::new(false)),
        error_slot: Arc::new(Mutex::new(None)),
        task_id,
        log: cluster.log().clone(),
    };

    let result = execute_on_node(&task);
    node::release(task.node, "O-");
    match result {
        Ok(()) => {
            callback(None);
            Ok(())
        }
        Err(Error::ClientAbort) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Start a background scan (server-side UDF); no records come back.
/// A zero task id is replaced with a fresh random one and written back.
pub fn background(
    cluster: &Cluster,
    policy: &ScanPolicy,
    scan: &Scan,
    task_id: &mut TaskId,
) -> Result<TaskId, Error> {
    if scan.udf.is_none() {
        return Err(Error::InvalidParameter(
            "background scan requires a UDF".into(),
        ));
    }
    let assigned = scan_generic(cluster, policy, scan, None, task_id.0)?;
    *task_id = assigned;
    Ok(assigned)
}

fn resolve_task_id(seed: u64) -> TaskId {
    if seed != 0 {
        TaskId(seed)
    } else {
        TaskId(rand::random::<u64>() >> 1)
    }
}

fn policy_deadline(policy: &ScanPolicy) -> Option<Instant> {
    if policy.timeout_ms > 0 {
        Some(Instant::now() + Duration::from_millis(u64::from(policy.timeout_ms)))
    } else {
        None
    }
}

// One worker's bundle: everything needed to run a scan against one node.
struct ScanTask {
    node: Arc<Node>,
    cmd: Arc<Vec<u8>>,
    deadline: Option<Instant>,
    callback: Option<ScanCallback>,
    deserialize_list_map: bool,
    error_latch: Arc<AtomicBool>,
    error_slot: Arc<Mutex<Option<Error>>>,
    task_id: TaskId,
    log: Logger,
}

struct CompleteTask {
    node_name: String,
    task_id: TaskId,
    ok: bool,
}

fn scan_generic(
    cluster: &Cluster,
    policy: &ScanPolicy,
    scan: &Scan,
    callback: Option<ScanCallback>,
    task_id_seed: u64,
) -> Result<TaskId, Error> {
    let _requests = cluster.requests_guard();
    let log = cluster.log();

    let nodes = cluster.reserve_nodes();
    if nodes.is_empty() {
        return Err(Error::ClusterEmpty);
    }

    let task_id = resolve_task_id(task_id_seed);
    let cmd = Arc::new(proto::write_scan_command(policy, scan, task_id.0)?);
    let deadline = policy_deadline(policy);
    let error_latch = Arc::new(AtomicBool::new(false));
    let error_slot: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

    let make_task = |target: &Arc<Node>| ScanTask {
        node: node::reserve(target, "T+"),
        cmd: Arc::clone(&cmd),
        deadline,
        callback: callback.clone(),
        deserialize_list_map: scan.deserialize_list_map,
        error_latch: Arc::clone(&error_latch),
        error_slot: Arc::clone(&error_slot),
        task_id,
        log: log.clone(),
    };

    if scan.concurrent {
        // The completion channel is bounded to the node count; workers
        // never block pushing and the caller pops exactly `queued` times.
        let (complete_tx, complete_rx): (SyncSender<CompleteTask>, Receiver<CompleteTask>) =
            sync_channel(nodes.len());

        let mut queued = 0;
        for target in &nodes {
            let task = make_task(target);
            let tx = complete_tx.clone();
            match cluster.scan_pool().execute(Box::new(move || {
                run_worker(task, tx);
            })) {
                Ok(()) => queued += 1,
                Err(e) => {
                    // Worker could not be queued; latch and stop fanning out.
                    if !error_latch.swap(true, Ordering::AcqRel) {
                        *error_slot.lock().unwrap() = Some(e);
                    }
                    break;
                }
            }
        }

        for _ in 0..queued {
            match complete_rx.recv() {
                Ok(complete) => debug!(
                    log,
                    "scan task {} node {} complete ok={}",
                    complete.task_id,
                    complete.node_name,
                    complete.ok
                ),
                Err(_) => break,
            }
        }
    } else {
        for target in &nodes {
            let task = make_task(target);
            let result = execute_on_node(&task);
            node::release(task.node, "T-");
            if let Err(e) = result {
                error_latch.store(true, Ordering::Release);
                if !matches!(e, Error::ClientAbort) {
                    *error_slot.lock().unwrap() = Some(e);
                }
                break;
            }
        }
    }

    for target in nodes {
        node::release(target, "T-");
    }

    let aborted = error_latch.load(Ordering::Acquire);
    let taken = error_slot.lock().unwrap().take();
    match taken {
        Some(e) => Err(e),
        None => {
            // A client abort is success at the aggregate level, but the
            // end-of-stream sentinel only fires after a clean finish.
            if !aborted {
                if let Some(cb) = &callback {
                    cb(None);
                }
            }
            Ok(task_id)
        }
    }
}

fn run_worker(task: ScanTask, complete_tx: SyncSender<CompleteTask>) {
    let result = execute_on_node(&task);
    let ok = result.is_ok();

    if let Err(e) = result {
        let client_abort = matches!(e, Error::ClientAbort);
        if !task.error_latch.swap(true, Ordering::AcqRel) && !client_abort {
            *task.error_slot.lock().unwrap() = Some(e);
        }
    }

    let complete = CompleteTask {
        node_name: task.node.name().to_string(),
        task_id: task.task_id,
        ok,
    };
    node::release(task.node, "T-");
    let _ = complete_tx.send(complete);
}

// Drive one node from command write to end-of-stream.
fn execute_on_node(task: &ScanTask) -> Result<(), Error> {
    let node = &task.node;

    let stream = loop {
        match node.claim_connection() {
            Ok(stream) => break stream,
            Err(ClaimError::StaleRetry) => continue,
            Err(e @ ClaimError::Transient) => {
                node.dun(DunReason::NetworkError);
                return Err(e.into());
            }
            Err(e @ ClaimError::Fatal) => return Err(e.into()),
        }
    };

    match drive_stream(&stream, task) {
        Ok(()) => {
            node.return_connection(stream);
            Ok(())
        }
        Err(e) => {
            // The stream is mid-payload or broken; never pool it.
            drop(stream);
            Err(e)
        }
    }
}

fn drive_stream(mut stream: &TcpStream, task: &ScanTask) -> Result<(), Error> {
    let node = &task.node;

    stream.set_nonblocking(false)?;
    stream.set_write_timeout(remaining(task.deadline)?)?;

    if let Err(e) = stream.write_all(&task.cmd) {
        node.dun(DunReason::NetworkError);
        return Err(Error::Transient(format!("scan command write: {}", e)));
    }

    let mut payload: Vec<u8> = Vec::new();
    loop {
        stream.set_read_timeout(remaining(task.deadline)?)?;

        let mut header = [0u8; PROTO_HEADER_SIZE];
        if let Err(e) = stream.read_exact(&mut header) {
            return Err(read_failure(node, &e));
        }
        let (version, msg_type, size) =
            split_proto_header(u64::from_be_bytes(header));
        if version != PROTO_VERSION || msg_type != PROTO_TYPE_MESSAGE {
            return Err(Error::ParseError(format!(
                "unexpected scan frame: version {} type {}",
                version, msg_type
            )));
        }
        if size > PROTO_SIZE_MAX {
            return Err(Error::ParseError(format!("scan frame of {} bytes", size)));
        }
        if size == 0 {
            continue;
        }

        payload.resize(size as usize, 0);
        stream.set_read_timeout(remaining(task.deadline)?)?;
        if let Err(e) = stream.read_exact(&mut payload) {
            return Err(read_failure(node, &e));
        }

        if parse_payload(&payload, task)? {
            return Ok(());
        }
    }
}

fn remaining(deadline: Option<Instant>) -> Result<Option<Duration>, Error> {
    match deadline {
        None => Ok(None),
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                Err(Error::Timeout)
            } else {
                Ok(Some(d - now))
            }
        }
    }
}

fn read_failure(node: &Node, e: &std::io::Error) -> Error {
    use std::io::ErrorKind;
    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut {
        node.dun(DunReason::UserTimeout);
        Error::Timeout
    } else {
        node.dun(DunReason::NetworkError);
        Error::Transient(format!("scan stream read: {}", e))
    }
}

/// Walk every record message in one frame payload. Returns true when the
/// node's stream is finished.
fn parse_payload(payload: &[u8], task: &ScanTask) -> Result<bool, Error> {
    let mut buf = &payload[..];

    while !buf.is_empty() {
        let header = MsgHeader::read(&mut buf)?;

        if header.result_code != RESULT_OK {
            // A scan over a set name missing on this node comes back as
            // not-found; that is a normal end-of-stream, not an error.
            if header.result_code == RESULT_NOT_FOUND {
                return Ok(true);
            }
            return Err(Error::ServerError(header.result_code));
        }

        if header.info3 & INFO3_LAST != 0 {
            return Ok(true);
        }

        let record = proto::parse_record(&mut buf, &header, task.deserialize_list_map)?;

        if let Some(cb) = &task.callback {
            if !cb(Some(&record)) {
                return Err(Error::ClientAbort);
            }
        }

        if task.error_latch.load(Ordering::Acquire) {
            return Err(Error::ScanAborted);
        }
    }

    Ok(false)
}

/// The bounded pool that services scan workers. Workers block for the
/// lifetime of their node's stream. Each cluster builds its own pool by
/// default; pass one pool to several clusters through
/// `ClusterOptions::scan_pool` to share the workers instead.
pub struct ScanPool {
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    log: Logger,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

impl std::fmt::Debug for ScanPool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ScanPool")
            .field("workers", &self.workers.lock().unwrap().len())
            .finish()
    }
}

impl ScanPool {
    pub fn new(n_workers: usize, log: &Logger) -> ScanPool {
        let (tx, rx) = channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(n_workers);
        for _ in 0..n_workers {
            let rx = Arc::clone(&rx);
            workers.push(thread::spawn(move || loop {
                let job = rx.lock().unwrap().recv();
                match job {
                    Ok(job) => job(),
                    Err(_) => break,
                }
            }));
        }

        ScanPool {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            log: log.clone(),
        }
    }

    pub(crate) fn execute(&self, job: Job) -> Result<(), Error> {
        match &*self.tx.lock().unwrap() {
            Some(tx) => tx
                .send(job)
                .map_err(|_| Error::Transient("scan pool is stopped".into())),
            None => Err(Error::Transient("scan pool is stopped".into())),
        }
    }

    pub(crate) fn shutdown(&self) {
        drop(self.tx.lock().unwrap().take());
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        if !workers.is_empty() {
            debug!(self.log, "joining {} scan workers", workers.len());
        }
        for worker in workers {
            if worker.join().is_err() {
                warn!(self.log, "scan worker panicked");
            }
        }
    }
}

impl Drop for ScanPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
