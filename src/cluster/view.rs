//! Immutable cluster-configuration snapshots.
//!
//! A [`ClusterView`] is a copy-on-write snapshot of the node roster: any
//! holder sees a consistent view for the duration of one operation, and
//! configuration updates publish a whole new snapshot behind an `Arc`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::cluster::{Location, LocationScope};
use crate::error::{Result, StrandError};
use crate::hashing;
use crate::replication::ReplicationProperty;
use crate::types::{is_strictly_sorted, NodeIndex, ShardId, ShardIndex};

/// Storage participation of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageState {
    /// Not a storage node.
    None,
    /// Serves reads only; receives no new copies.
    ReadOnly,
    /// Full storage participation.
    ReadWrite,
    /// Temporarily taken out of service.
    Disabled,
}

impl StorageState {
    pub fn is_writable(&self) -> bool {
        matches!(self, StorageState::ReadWrite)
    }

    pub fn is_readable(&self) -> bool {
        matches!(self, StorageState::ReadOnly | StorageState::ReadWrite)
    }

    fn wire_code(&self) -> u8 {
        match self {
            StorageState::None => 0,
            StorageState::ReadOnly => 1,
            StorageState::ReadWrite => 2,
            StorageState::Disabled => 3,
        }
    }
}

/// One node's entry in the cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub index: NodeIndex,
    /// Bumped when the node is replaced in place (wiped disks).
    pub generation: u32,
    pub sequencer_weight: f64,
    pub storage_state: StorageState,
    pub num_shards: ShardIndex,
    /// Relative capacity weight for placement.
    pub storage_weight: f64,
    pub location: Option<Location>,
    /// Keep existing data readable but never pick this node for new nodesets.
    pub exclude_from_nodesets: bool,
}

impl NodeDescriptor {
    /// Whether this node stores log records at all.
    pub fn is_storage_node(&self) -> bool {
        !matches!(self.storage_state, StorageState::None) && self.num_shards > 0
    }

    /// Whether the node may appear in newly generated nodesets.
    pub fn is_nodeset_candidate(&self) -> bool {
        self.storage_state.is_writable()
            && self.storage_weight > 0.0
            && self.num_shards > 0
            && !self.exclude_from_nodesets
    }

    /// The node's domain at `scope`, if it has a location.
    pub fn domain(&self, scope: LocationScope) -> Option<String> {
        self.location.as_ref().map(|l| l.domain(scope))
    }
}

/// Immutable snapshot of the cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterView {
    cluster_name: String,
    version: u64,
    nodes: BTreeMap<NodeIndex, NodeDescriptor>,
}

impl ClusterView {
    pub fn new(
        cluster_name: impl Into<String>,
        version: u64,
        nodes: impl IntoIterator<Item = NodeDescriptor>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            version,
            nodes: nodes.into_iter().map(|n| (n.index, n)).collect(),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn node(&self, index: NodeIndex) -> Option<&NodeDescriptor> {
        self.nodes.get(&index)
    }

    pub fn contains(&self, index: NodeIndex) -> bool {
        self.nodes.contains_key(&index)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn storage_nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values().filter(|n| n.is_storage_node())
    }

    pub fn num_storage_nodes(&self) -> usize {
        self.storage_nodes().count()
    }

    /// All shards of one node, in shard order.
    pub fn shards_of(&self, index: NodeIndex) -> Vec<ShardId> {
        match self.nodes.get(&index) {
            Some(n) => (0..n.num_shards).map(|s| ShardId::new(index, s)).collect(),
            None => Vec::new(),
        }
    }

    /// Digest of the storage-relevant part of the configuration.
    ///
    /// Covers the sorted `(index, generation, storage_state, weight,
    /// location)` tuples, encoded little-endian and folded through the
    /// 64-bit mixer. Stored inside epoch metadata to detect config drift.
    pub fn storage_config_hash(&self) -> u64 {
        let mut bytes = Vec::with_capacity(self.nodes.len() * 32);
        for node in self.storage_nodes() {
            bytes.extend_from_slice(&node.index.to_le_bytes());
            bytes.extend_from_slice(&node.generation.to_le_bytes());
            bytes.push(node.storage_state.wire_code());
            bytes.extend_from_slice(&node.storage_weight.to_le_bytes());
            bytes.extend_from_slice(&node.num_shards.to_le_bytes());
            if let Some(loc) = &node.location {
                let loc = loc.to_string();
                bytes.extend_from_slice(&(loc.len() as u16).to_le_bytes());
                bytes.extend_from_slice(loc.as_bytes());
            } else {
                bytes.extend_from_slice(&0u16.to_le_bytes());
            }
        }
        hashing::hash_bytes(&bytes)
    }

    /// Validate a storage set against this view and a replication property.
    ///
    /// Checks the ordering and uniqueness invariants, that every shard maps
    /// to a storage-capable shard of a configured node, and that the set
    /// spans enough distinct domains at every constrained scope.
    pub fn is_valid_storage_set(
        &self,
        set: &[ShardId],
        replication: &ReplicationProperty,
    ) -> bool {
        self.check_storage_set(set, replication).is_ok()
    }

    /// Like [`Self::is_valid_storage_set`] but explains the failure.
    pub fn check_storage_set(
        &self,
        set: &[ShardId],
        replication: &ReplicationProperty,
    ) -> Result<()> {
        if set.is_empty() {
            return Err(StrandError::InvalidStorageSet("empty".into()));
        }
        if !is_strictly_sorted(set) {
            return Err(StrandError::InvalidStorageSet(
                "not strictly increasing".into(),
            ));
        }
        for shard in set {
            let node = self
                .node(shard.node)
                .ok_or(StrandError::NodeNotFound(shard.node))?;
            if !node.is_storage_node() || shard.shard >= node.num_shards {
                return Err(StrandError::ShardNotFound(*shard));
            }
        }
        for (scope, required) in replication.entries() {
            let distinct = if scope == LocationScope::Node {
                set.iter().map(|s| s.node).collect::<BTreeSet<_>>().len()
            } else {
                let mut domains = BTreeSet::new();
                for shard in set {
                    // Nodes without a location count as their own domain.
                    let node = &self.nodes[&shard.node];
                    let domain = node
                        .domain(scope)
                        .unwrap_or_else(|| format!("#N{}", shard.node));
                    domains.insert(domain);
                }
                domains.len()
            };
            if distinct < required {
                return Err(StrandError::InvalidStorageSet(format!(
                    "{distinct} domains at scope {scope}, {required} required"
                )));
            }
        }
        Ok(())
    }
}

/// Builder for cluster views, used by tests and the metadata service.
#[derive(Debug, Default)]
pub struct ClusterViewBuilder {
    cluster_name: String,
    version: u64,
    nodes: Vec<NodeDescriptor>,
}

impl ClusterViewBuilder {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            version: 1,
            nodes: Vec::new(),
        }
    }

    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    fn next_index(&self) -> NodeIndex {
        self.nodes.last().map(|n| n.index + 1).unwrap_or(0)
    }

    /// Append `count` nodes at the given location. The first `storage_count`
    /// of them are read-write storage nodes with unit weight; the rest are
    /// sequencer-only.
    pub fn add_nodes(
        mut self,
        count: usize,
        num_shards: ShardIndex,
        location: Option<&str>,
        storage_count: usize,
    ) -> Result<Self> {
        let location = match location {
            Some(path) => Some(Location::parse(path)?),
            None => None,
        };
        let base = self.next_index();
        for i in 0..count {
            let is_storage = i < storage_count;
            self.nodes.push(NodeDescriptor {
                index: base + i as NodeIndex,
                generation: 1,
                sequencer_weight: 1.0,
                storage_state: if is_storage {
                    StorageState::ReadWrite
                } else {
                    StorageState::None
                },
                num_shards: if is_storage { num_shards } else { 0 },
                storage_weight: if is_storage { 1.0 } else { 0.0 },
                location: location.clone(),
                exclude_from_nodesets: false,
            });
        }
        Ok(self)
    }

    /// Append one fully custom node descriptor.
    pub fn add_node(mut self, node: NodeDescriptor) -> Self {
        self.nodes.push(node);
        self
    }

    /// Flip `exclude_from_nodesets` on an already-added node.
    pub fn exclude_from_nodesets(mut self, index: NodeIndex) -> Self {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.index == index) {
            node.exclude_from_nodesets = true;
        }
        self
    }

    /// Set the storage weight of an already-added node.
    pub fn weight(mut self, index: NodeIndex, weight: f64) -> Self {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.index == index) {
            node.storage_weight = weight;
        }
        self
    }

    pub fn build(self) -> Arc<ClusterView> {
        Arc::new(ClusterView::new(self.cluster_name, self.version, self.nodes))
    }
}
