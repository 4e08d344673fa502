// Copyright 2020 Joyent, Inc.

//! A cluster-aware client core for a partitioned key-value service
//!
//! Breakshot keeps a live map of a multi-node key-value cluster and routes
//! work to the right node. It was built for services where the server set
//! changes underneath the client: nodes are discovered from seed hosts and
//! from the peer lists the servers gossip, probed on a steady cadence, and
//! quietly dropped once their health score decays past the eviction latch.
//!
//! ## Membership and the tender
//!
//! A cluster starts from user-registered seed hosts
//! ([`Cluster::add_host`](cluster/struct.Cluster.html)). A periodic tender
//! resolves seeds whenever the node set is empty, pings every new address
//! for the server-assigned node name, and folds the reply into the node
//! set. Each node then runs its own probe: the probe verifies the node
//! still answers to its name, watches the partition generation, and feeds
//! the gossiped peer list back into discovery. Every failure kind carries
//! a weight (a timeout is nearly free, a bad name is fatal) and any
//! success resets the score, so routing stays stable through bursty
//! failures but a genuinely bad node latches out within a probe cycle.
//!
//! ## Partition routing
//!
//! Records hash to a partition by digest, and each (namespace, partition)
//! slot names a read-replica and a write-replica node. The table is fed by
//! the tender from the `replicas-read`/`replicas-write` info values and
//! consulted on every routed request
//! ([`Cluster::get_node`](cluster/struct.Cluster.html#method.get_node));
//! when it cannot answer (unknown partition count, empty slot, dunned
//! holder) routing falls back to a round-robin pick over healthy nodes.
//!
//! ## Connections
//!
//! Each node pools its idle TCP streams in a LIFO. A claim verifies the
//! stream is still quietly connected before handing it out, and a dry
//! queue turns into a non-blocking connect against the node's endpoints in
//! order, so claimers never wait out a handshake they can overlap with
//! their first write.
//!
//! ## Scans
//!
//! A scan ([`scan::foreach`](scan/fn.foreach.html)) builds its wire
//! command once and fans it out to every node on a bounded worker pool.
//! Workers stream records into the user callback in server-emission order
//! per node, with no ordering across nodes. The first real failure wins a
//! shared error slot; a callback returning `false` aborts the remaining
//! workers cooperatively and is reported as success. One final
//! `callback(None)` marks the end of a fully-successful stream.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use breakshot::cluster::{Cluster, ClusterOptions};
//! use breakshot::scan::{self, Scan, ScanPolicy};
//!
//! let cluster = Cluster::create(ClusterOptions::default())?;
//! cluster.add_host("10.0.0.1", 3000);
//!
//! cluster.wait_for_node(std::time::Duration::from_secs(5));
//!
//! let mut scan = Scan::new("test");
//! scan.concurrent = true;
//!
//! scan::foreach(
//!     &cluster,
//!     &ScanPolicy::default(),
//!     &scan,
//!     Arc::new(|record| {
//!         match record {
//!             Some(r) => println!("{} bins", r.bins.len()),
//!             None => println!("scan complete"),
//!         }
//!         true
//!     }),
//! )?;
//! ```

#![allow(missing_docs)]

pub mod cluster;
pub mod conn_pool;
pub mod error;
pub mod info;
pub mod node;
pub mod partition;
pub mod proto;
pub mod resolver;
pub mod scan;

pub use crate::cluster::{Cluster, ClusterOptions, ClusterRegistry, ClusterStatsSnapshot};
pub use crate::error::Error;
pub use crate::info::exchange as info_exchange;
pub use crate::node::Node;
pub use crate::partition::{partition_id, Digest};
pub use crate::proto::{Bin, Record, RecordKey, Value};
pub use crate::resolver::Seed;
pub use crate::scan::{
    JobPoller, JobStatus, Scan, ScanCallback, ScanPolicy, ScanPool, ScanPriority, ScanUdf, TaskId,
};
