//! Core type definitions for the strand control plane.
//!
//! Identities in the data model are small integers: logs are 64-bit ids,
//! nodes are dense 16-bit indexes assigned by the cluster configuration, and
//! a shard is a `(node, shard)` pair. Nodesets are ordered sequences of
//! shards, strictly increasing by `(node_index, shard_index)`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a node in the cluster configuration.
pub type NodeIndex = u16;

/// Index of a shard within a node.
pub type ShardIndex = u16;

/// Epoch number of a log.
pub type Epoch = u32;

/// Sequence number of an event-log record.
pub type Lsn = u64;

/// Unique identifier of a log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogId(pub u64);

impl LogId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// A single storage shard: one slice of one node's local log store.
///
/// Ordering is lexicographic by `(node, shard)`, which is also the required
/// order of shards inside a storage set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ShardId {
    pub node: NodeIndex,
    pub shard: ShardIndex,
}

impl ShardId {
    pub fn new(node: NodeIndex, shard: ShardIndex) -> Self {
        Self { node, shard }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}:S{}", self.node, self.shard)
    }
}

/// An ordered set of shards eligible to hold records for a log.
///
/// Invariants (enforced by the selectors and checked by
/// [`crate::cluster::ClusterView::is_valid_storage_set`]): strictly
/// increasing, no duplicates, every shard storage-capable.
pub type StorageSet = Vec<ShardId>;

/// Check the ordering invariant of a storage set.
pub fn is_strictly_sorted(set: &[ShardId]) -> bool {
    set.windows(2).all(|w| w[0] < w[1])
}
