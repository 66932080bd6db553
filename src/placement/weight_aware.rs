//! Weight-aware nodeset selection.
//!
//! Distributes the target size across failure domains proportionally to
//! aggregate weight, with a per-domain floor that keeps any copyset legal
//! even when replication concentrates in the minimum number of domains.
//! Within a domain, shards are drawn by deterministic weighted sampling
//! seeded from `(log id, domain path)`.
//!
//! The V2 variant differs only in quota rounding: it hands the remainder
//! out in equal per-domain shares when supplies allow, falling back to
//! weighted shares otherwise.

use crate::cluster::ClusterView;
use crate::config::LogAttributes;
use crate::error::{Result, StrandError};
use crate::metadata::EpochMetadata;
use crate::placement::{
    draw_seed, finish, plan_quotas, weighted_sample, Decision, DomainTree, LogToShardMapping,
    NodesetSelector, SelectorOptions,
};
use crate::types::{LogId, StorageSet};

const SELECTOR_SALT: u64 = 0x77_65_69_67_68_74; // "weight"

#[derive(Debug, Clone)]
pub struct WeightAwareSelector {
    v2: bool,
    mapping: LogToShardMapping,
}

impl WeightAwareSelector {
    pub fn new(v2: bool, mapping: LogToShardMapping) -> Self {
        Self { v2, mapping }
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
            let seed = draw_seed(log_id, &domain.path, SELECTOR_SALT);
            set.extend(weighted_sample(&domain.shards, quota, seed));
        }
        Some(set)
    }
}

impl NodesetSelector for WeightAwareSelector {
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

    fn selector() -> WeightAwareSelector {
        WeightAwareSelector::new(false, LogToShardMapping::Legacy)
    }

    fn two_rack_view() -> Arc<crate::cluster::ClusterView> {
        ClusterViewBuilder::new("test")
            .add_nodes(3, 1, Some("region0.datacenter1.01.a.a"), 3)
            .unwrap()
            .add_nodes(3, 1, Some("region0.datacenter1.01.a.b"), 3)
            .unwrap()
            .build()
    }

    #[test]
    fn test_exclude_from_nodesets_shrinks_supply() {
        // Three of six nodes are flagged away from new nodesets; only the
        // remaining three may appear, and the target collapses to them.
        let view = ClusterViewBuilder::new("test")
            .add_nodes(3, 1, Some("region0.datacenter1.01.a.a"), 3)
            .unwrap()
            .add_nodes(3, 1, Some("region0.datacenter1.01.a.b"), 3)
            .unwrap()
            .exclude_from_nodesets(0)
            .exclude_from_nodesets(1)
            .exclude_from_nodesets(3)
            .build();
        let attrs = LogAttributes::new(
            ReplicationProperty::from_entries([
                (LocationScope::Rack, 2),
                (LocationScope::Node, 3),
            ])
            .unwrap(),
        )
        .nodeset_size(5);

        let (decision, set) = selector()
            .get_storage_set(LogId(1), &attrs, &view, None, &SelectorOptions::default())
            .unwrap();
        assert_eq!(decision, Decision::NeedsChange);
        let set = set.unwrap();
        assert_eq!(set.len(), 3);
        for shard in &set {
            assert!([2u16, 4, 5].contains(&shard.node));
        }
    }

    #[test]
    fn test_flat_target_raised_to_replication_factor() {
        let view = ClusterViewBuilder::new("test")
            .add_nodes(8, 1, None, 8)
            .unwrap()
            .build();
        let attrs =
            LogAttributes::new(ReplicationProperty::with_factor(4)).nodeset_size(2);
        let (decision, set) = selector()
            .get_storage_set(LogId(3), &attrs, &view, None, &SelectorOptions::default())
            .unwrap();
        assert_eq!(decision, Decision::NeedsChange);
        assert_eq!(set.unwrap().len(), 4);
    }

    #[test]
    fn test_keep_on_matching_previous() {
        let view = two_rack_view();
        let attrs = LogAttributes::new(ReplicationProperty::with_scope_factor(
            LocationScope::Rack,
            2,
        ))
        .nodeset_size(4);
        let sel = selector();
        let options = SelectorOptions::default();

        let (_, set) = sel
            .get_storage_set(LogId(9), &attrs, &view, None, &options)
            .unwrap();
        let prev = EpochMetadata::new(set.unwrap(), attrs.replication.clone(), 1, 1)
            .with_config_hash(&view);
        let (decision, set) = sel
            .get_storage_set(LogId(9), &attrs, &view, Some(&prev), &options)
            .unwrap();
        assert_eq!(decision, Decision::Keep);
        assert!(set.is_none());
    }

    #[test]
    fn test_infeasible_when_supply_below_factor() {
        let view = two_rack_view();
        let attrs = LogAttributes::new(ReplicationProperty::with_factor(7));
        let (decision, set) = selector()
            .get_storage_set(LogId(2), &attrs, &view, None, &SelectorOptions::default())
            .unwrap();
        assert_eq!(decision, Decision::Failed);
        assert!(set.is_none());
        assert!(selector()
            .get_storage_set_size(LogId(2), &attrs, &view, &SelectorOptions::default())
            .is_err());
    }
}
