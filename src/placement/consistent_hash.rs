//! Consistent-hashing nodeset selection.
//!
//! Same quota computation as the weight-aware selector, but shards inside a
//! domain are chosen by walking a 64-bit hash ring instead of sampling.
//! Each shard owns a number of virtual points proportional to its weight;
//! a log walks the ring from a position derived from its id and takes the
//! first `quota` distinct shards it meets. Membership changes only move the
//! points of the changed shards, so the symmetric difference between old
//! and new nodesets stays proportional to the changed fraction of the
//! cluster rather than to the nodeset size.

use crate::cluster::ClusterView;
use crate::config::LogAttributes;
use crate::error::{Result, StrandError};
use crate::hashing;
use crate::metadata::EpochMetadata;
use crate::placement::{
    finish, plan_quotas, Decision, Domain, DomainTree, LogToShardMapping, NodesetSelector,
    SelectorOptions,
};
use crate::types::{LogId, ShardId, StorageSet};

const SELECTOR_SALT: u64 = 0x72_69_6e_67; // "ring"
const POINT_SALT: u64 = 0x76_70_6f_69_6e_74; // "vpoint"

/// Virtual ring points granted per unit of storage weight.
const POINTS_PER_WEIGHT: f64 = 16.0;

#[derive(Debug, Clone)]
pub struct ConsistentHashingSelector {
    v2: bool,
    mapping: LogToShardMapping,
}

impl ConsistentHashingSelector {
    pub fn new(v2: bool, mapping: LogToShardMapping) -> Self {
        Self { v2, mapping }
    }

    /// Pick `quota` distinct shards from one domain's ring.
    fn walk_ring(domain: &Domain, log_id: LogId, quota: usize) -> Vec<ShardId> {
        let mut ring: Vec<(u64, ShardId)> = Vec::new();
        for leaf in &domain.shards {
            let points = (leaf.weight * POINTS_PER_WEIGHT).round().max(1.0) as u64;
            for i in 0..points {
                let position = hashing::hash_chain(&[
                    leaf.shard.node as u64,
                    leaf.shard.shard as u64,
                    i,
                    POINT_SALT,
                ]);
                ring.push((position, leaf.shard));
            }
        }
        ring.sort_unstable();

        let start = hashing::hash_chain(&[
            log_id.0,
            hashing::hash_bytes(domain.path.as_bytes()),
            SELECTOR_SALT,
        ]);
        let first = ring.partition_point(|&(p, _)| p < start);

        let mut picked: Vec<ShardId> = Vec::with_capacity(quota);
        for offset in 0..ring.len() {
            if picked.len() == quota {
                break;
            }
            let (_, shard) = ring[(first + offset) % ring.len()];
            if !picked.contains(&shard) {
                picked.push(shard);
            }
        }
        picked
    }

    fn compute(
        &self,
        log_id: LogId,
        attrs: &LogAttributes,
        view: &ClusterView,
        options: &SelectorOptions,
    ) -> Option<StorageSet> {
        let tree = DomainTree::build(view, log_id, self.mapping, options);
        let plan = plan_quotas(&tree, attrs.nodeset_size, &attrs.replication, self.v2)?;

        let mut set = Vec::with_capacity(plan.total);
        for (domain, &quota) in plan.domains.iter().zip(&plan.quotas) {
            if quota == 0 {
                continue;
            }
            set.extend(Self::walk_ring(domain, log_id, quota));
        }
        Some(set)
    }
}

impl NodesetSelector for ConsistentHashingSelector {
    fn get_storage_set(
        &self,
        log_id: LogId,
        attrs: &LogAttributes,
        view: &ClusterView,
        prev: Option<&EpochMetadata>,
        options: &SelectorOptions,
    ) -> Result<(Decision, Option<StorageSet>)> {
        match self.compute(log_id, attrs, view, options) {
            Some(set) => Ok(finish(set, log_id, attrs, view, prev)),
            None => Ok((Decision::Failed, None)),
        }
    }

    fn get_storage_set_size(
        &self,
        log_id: LogId,
        attrs: &LogAttributes,
        view: &ClusterView,
        options: &SelectorOptions,
    ) -> Result<usize> {
        let tree = DomainTree::build(view, log_id, self.mapping, options);
        plan_quotas(&tree, attrs.nodeset_size, &attrs.replication, self.v2)
            .map(|plan| plan.total)
            .ok_or_else(|| {
                StrandError::InvalidStorageSet(format!("no feasible nodeset for {log_id}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterViewBuilder, LocationScope};
    use crate::replication::ReplicationProperty;
    use std::sync::Arc;

    fn racked_view(extra_in_last_rack: usize) -> Arc<ClusterView> {
        ClusterViewBuilder::new("test")
            .add_nodes(4, 1, Some("region0.datacenter1.01.a.a"), 4)
            .unwrap()
            .add_nodes(4, 1, Some("region0.datacenter2.01.a.a"), 4)
            .unwrap()
            .add_nodes(4 + extra_in_last_rack, 1, Some("region1.datacenter1.02.a.a"), 4 + extra_in_last_rack)
            .unwrap()
            .build()
    }

    fn attrs() -> LogAttributes {
        LogAttributes::new(
            ReplicationProperty::from_entries([
                (LocationScope::Rack, 2),
                (LocationScope::Node, 3),
            ])
            .unwrap(),
        )
        .nodeset_size(6)
    }

    #[test]
    fn test_deterministic() {
        let sel = ConsistentHashingSelector::new(false, LogToShardMapping::Legacy);
        let view = racked_view(0);
        let options = SelectorOptions::default();
        let (d1, s1) = sel
            .get_storage_set(LogId(11), &attrs(), &view, None, &options)
            .unwrap();
        let (d2, s2) = sel
            .get_storage_set(LogId(11), &attrs(), &view, None, &options)
            .unwrap();
        assert_eq!(d1, Decision::NeedsChange);
        assert_eq!(d1, d2);
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_size_matches_prediction() {
        let sel = ConsistentHashingSelector::new(false, LogToShardMapping::Legacy);
        let view = racked_view(0);
        let options = SelectorOptions::default();
        for log in 1..50u64 {
            let (decision, set) = sel
                .get_storage_set(LogId(log), &attrs(), &view, None, &options)
                .unwrap();
            assert_eq!(decision, Decision::NeedsChange);
            let predicted = sel
                .get_storage_set_size(LogId(log), &attrs(), &view, &options)
                .unwrap();
            assert_eq!(set.unwrap().len(), predicted);
        }
    }

    #[test]
    fn test_membership_change_moves_few_logs() {
        let sel = ConsistentHashingSelector::new(false, LogToShardMapping::Legacy);
        let before = racked_view(0);
        let after = racked_view(1);
        let options = SelectorOptions::default();

        let logs = 500u64;
        let mut moved = 0usize;
        for log in 1..=logs {
            let (_, a) = sel
                .get_storage_set(LogId(log), &attrs(), &before, None, &options)
                .unwrap();
            let (_, b) = sel
                .get_storage_set(LogId(log), &attrs(), &after, None, &options)
                .unwrap();
            if a != b {
                moved += 1;
            }
        }
        // The new node only perturbs its own rack's ring.
        assert!(moved < logs as usize / 2, "moved {moved} of {logs}");
    }
}
