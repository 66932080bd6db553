//! Epoch metadata records.

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterView;
use crate::config::LogAttributes;
use crate::error::Result;
use crate::placement::{Decision, NodesetSelector, SelectorOptions};
use crate::replication::ReplicationProperty;
use crate::types::{Epoch, LogId, StorageSet};

/// Flag bits carried by epoch metadata.
pub mod metadata_flags {
    /// `nodes_config_hash` is present.
    pub const HAS_NODES_CONFIG_HASH: u32 = 1 << 0;
    /// Metadata was written by a disaster-recovery tool.
    pub const WRITTEN_BY_RECOVERY: u32 = 1 << 1;
}

/// The per-log record binding a nodeset to a range of epochs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetadata {
    /// The nodeset, strictly increasing by `(node, shard)`.
    pub storage_set: StorageSet,
    pub replication: ReplicationProperty,
    /// First epoch this metadata applies to.
    pub effective_since: Epoch,
    /// Epoch the metadata was written at.
    pub epoch: Epoch,
    /// Digest of the storage-nodes configuration the set was computed from.
    pub nodes_config_hash: Option<u64>,
    pub flags: u32,
}

impl EpochMetadata {
    pub fn new(
        storage_set: StorageSet,
        replication: ReplicationProperty,
        epoch: Epoch,
        effective_since: Epoch,
    ) -> Self {
        Self {
            storage_set,
            replication,
            effective_since,
            epoch,
            nodes_config_hash: None,
            flags: 0,
        }
    }

    /// Stamp the storage-config digest of `view` into the metadata.
    pub fn with_config_hash(mut self, view: &ClusterView) -> Self {
        self.nodes_config_hash = Some(view.storage_config_hash());
        self.flags |= metadata_flags::HAS_NODES_CONFIG_HASH;
        self
    }

    pub fn has_config_hash(&self) -> bool {
        self.flags & metadata_flags::HAS_NODES_CONFIG_HASH != 0
    }

    /// Whether regenerating this log's metadata against `view` would keep
    /// the same decision.
    ///
    /// True iff the selector, fed this metadata as the previous one, decides
    /// [`Decision::Keep`]. A stored config hash that no longer matches the
    /// view makes this false without re-sampling.
    pub fn matches_config(
        &self,
        log_id: LogId,
        attrs: &LogAttributes,
        view: &ClusterView,
        selector: &dyn NodesetSelector,
    ) -> Result<bool> {
        if let Some(hash) = self.nodes_config_hash {
            if hash != view.storage_config_hash() {
                return Ok(false);
            }
        }
        let (decision, _) = selector.get_storage_set(
            log_id,
            attrs,
            view,
            Some(self),
            &SelectorOptions::default(),
        )?;
        Ok(decision == Decision::Keep)
    }

    /// Serialize for storage in the metadata log.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocationScope;
    use crate::types::ShardId;

    fn sample() -> EpochMetadata {
        EpochMetadata::new(
            vec![ShardId::new(0, 0), ShardId::new(1, 0), ShardId::new(3, 1)],
            ReplicationProperty::with_scope_factor(LocationScope::Rack, 3),
            4,
            2,
        )
    }

    #[test]
    fn test_bincode_roundtrip() {
        let meta = sample();
        let bytes = meta.to_bytes().unwrap();
        let back = EpochMetadata::from_bytes(&bytes).unwrap();
        assert_eq!(meta, back);
    }

    #[test]
    fn test_config_hash_flag() {
        let meta = sample();
        assert!(!meta.has_config_hash());
        let view = crate::cluster::ClusterViewBuilder::new("test")
            .add_nodes(4, 2, None, 4)
            .unwrap()
            .build();
        let meta = meta.with_config_hash(&view);
        assert!(meta.has_config_hash());
        assert_eq!(meta.nodes_config_hash, Some(view.storage_config_hash()));
    }
}
