// Copyright 2020 Joyent, Inc.

//! Per-namespace partition tables.
//!
//! Every namespace maps to an array of `n_partitions` slots, each holding
//! at most one read-replica and one write-replica node. The table is only
//! ever mutated under the cluster's routing lock; slots hold tagged strong
//! references (PR/PW) so the reference-count trace stays balanced.

use std::collections::HashMap;
use std::sync::Arc;

use sha1::Sha1;
use slog::{info, warn, Logger};

use crate::node::{release, reserve, Node};

// Namespace names beyond this length are invalid on the wire.
pub(crate) const MAX_NAMESPACE_LEN: usize = 30;

/// A fixed-size hash of a user key, from which the partition id derives.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Digest(pub [u8; 20]);

impl Digest {
    /// Hash a (set, key) pair into a digest.
    pub fn from_key(set: &str, key: &[u8]) -> Digest {
        let mut sha1 = Sha1::new();
        sha1.update(set.as_bytes());
        sha1.update(b"||");
        sha1.update(key);
        Digest(sha1.digest().bytes())
    }
}

/// Map a digest to its partition id.
pub fn partition_id(digest: &Digest, n_partitions: u32) -> u32 {
    let d = &digest.0;
    u32::from_be_bytes([d[0], d[1], d[2], d[3]]) % n_partitions
}

#[derive(Default)]
struct Slot {
    read: Option<Arc<Node>>,
    write: Option<Arc<Node>>,
}

/// `namespace -> [Slot; n_partitions]`.
pub(crate) struct PartitionTable {
    tables: HashMap<String, Vec<Slot>>,
}

impl PartitionTable {
    pub(crate) fn new() -> Self {
        PartitionTable {
            tables: HashMap::new(),
        }
    }

    /// Look up the replica for a slot, reserving it for the caller.
    pub(crate) fn get(&self, namespace: &str, partition_id: u32, write: bool) -> Option<Arc<Node>> {
        let slot = self.tables.get(namespace)?.get(partition_id as usize)?;
        let holder = if write { &slot.write } else { &slot.read };
        holder.as_ref().map(|node| reserve(node, "T+"))
    }

    /// Install a node as the read- or write-replica of a slot, dropping
    /// the previous holder's reference.
    pub(crate) fn set(
        &mut self,
        n_partitions: u32,
        node: &Arc<Node>,
        namespace: &str,
        partition_id: u32,
        write: bool,
    ) {
        let table = self
            .tables
            .entry(namespace.to_string())
            .or_insert_with(|| (0..n_partitions).map(|_| Slot::default()).collect());

        let slot = match table.get_mut(partition_id as usize) {
            Some(slot) => slot,
            None => return,
        };
        let (holder, plus, minus) = if write {
            (&mut slot.write, "PW+", "PW-")
        } else {
            (&mut slot.read, "PR+", "PR-")
        };
        if let Some(old) = holder.take() {
            release(old, minus);
        }
        *holder = Some(reserve(node, plus));
    }

    /// Clear every slot referencing the node, across all namespaces.
    pub(crate) fn remove_node(&mut self, node: &Arc<Node>) {
        for table in self.tables.values_mut() {
            for slot in table.iter_mut() {
                if slot.read.as_ref().map_or(false, |n| Arc::ptr_eq(n, node)) {
                    if let Some(old) = slot.read.take() {
                        release(old, "PR-");
                    }
                }
                if slot.write.as_ref().map_or(false, |n| Arc::ptr_eq(n, node)) {
                    if let Some(old) = slot.write.take() {
                        release(old, "PW-");
                    }
                }
            }
        }
    }

    /// Drop every reference in the table.
    pub(crate) fn clear(&mut self) {
        for (_, table) in self.tables.drain() {
            for slot in table {
                if let Some(node) = slot.read {
                    release(node, "PR-");
                }
                if let Some(node) = slot.write {
                    release(node, "PW-");
                }
            }
        }
    }

    /// Parse a `namespace:partition_id;...` replica string, installing the
    /// node into each valid slot. Entries with an oversized namespace or an
    /// out-of-scale partition id are dropped; their neighbors still apply.
    pub(crate) fn process_replicas(
        &mut self,
        n_partitions: u32,
        node: &Arc<Node>,
        value: &str,
        write: bool,
        log: &Logger,
    ) {
        for entry in value.split(';') {
            if entry.is_empty() {
                continue;
            }
            let mut parts = entry.splitn(2, ':');
            let namespace = parts.next().unwrap_or("");
            let partition_str = match parts.next() {
                Some(p) => p,
                None => continue,
            };
            if namespace.len() > MAX_NAMESPACE_LEN {
                info!(
                    log,
                    "partitions process: bad namespace: len {} space {}",
                    namespace.len(),
                    namespace
                );
                continue;
            }
            let partition_id: u32 = match partition_str.parse() {
                Ok(p) => p,
                Err(_) => {
                    warn!(log, "partitions process: bad partition id {}", partition_str);
                    continue;
                }
            };
            if partition_id > n_partitions {
                warn!(
                    log,
                    "partitions process: partitions out of scale: found {} max {}",
                    partition_id,
                    n_partitions
                );
                continue;
            }
            self.set(n_partitions, node, namespace, partition_id, write);
        }
    }

    /// Serialize the slots a node owns for one namespace and role back to
    /// the canonical `ns:id;ns:id` form, ascending by partition id.
    pub(crate) fn owned_by(&self, namespace: &str, node: &Arc<Node>, write: bool) -> String {
        let mut entries = Vec::new();
        if let Some(table) = self.tables.get(namespace) {
            for (partition_id, slot) in table.iter().enumerate() {
                let holder = if write { &slot.write } else { &slot.read };
                if let Some(n) = holder {
                    if Arc::ptr_eq(n, node) {
                        entries.push(format!("{}:{}", namespace, partition_id));
                    }
                }
            }
        }
        entries.join(";")
    }

    /// Number of (namespace, partition, role) slots referencing the node.
    pub(crate) fn slot_count(&self, node: &Arc<Node>) -> usize {
        let mut count = 0;
        for table in self.tables.values() {
            for slot in table {
                if let Some(n) = &slot.read {
                    if Arc::ptr_eq(n, node) {
                        count += 1;
                    }
                }
                if let Some(n) = &slot.write {
                    if Arc::ptr_eq(n, node) {
                        count += 1;
                    }
                }
            }
        }
        count
    }
}
