//! Materialized rebuilding state, replayed from the event log.
//!
//! The event log is the single source of truth for rebuilding state; this
//! fold of its record stream answers the supervisor's gate queries. It is a
//! soft cache: rebuilding it from the log from scratch always converges to
//! the same state.

use std::collections::{BTreeMap, BTreeSet};

use crate::cluster::ClusterView;
use crate::eventlog::record::EventRecord;
use crate::types::{Lsn, NodeIndex, ShardId};

/// Rebuilding state of one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRebuildingState {
    /// Node that requested the rebuild.
    pub source_node: NodeIndex,
    /// Mini rebuildings recover a time range only.
    pub time_ranged: bool,
    /// Shard is being drained rather than recovered.
    pub drain: bool,
    /// LSN of the `SHARD_NEEDS_REBUILD` that started this rebuilding.
    pub started_at: Lsn,
}

/// All shards currently rebuilding, per the event log.
#[derive(Debug, Default, Clone)]
pub struct RebuildingSet {
    shards: BTreeMap<ShardId, ShardRebuildingState>,
    /// LSN of the last applied record.
    version: Lsn,
}

impl RebuildingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one committed record.
    pub fn apply(&mut self, lsn: Lsn, record: &EventRecord) {
        self.version = self.version.max(lsn);
        match record {
            EventRecord::ShardNeedsRebuild { shard, source_node, .. } => {
                self.shards.insert(
                    *shard,
                    ShardRebuildingState {
                        source_node: *source_node,
                        time_ranged: record.is_time_ranged(),
                        drain: record_is_drain(record),
                        started_at: lsn,
                    },
                );
            }
            EventRecord::ShardAbortRebuild { shard }
            | EventRecord::ShardIsRebuilt { shard }
            | EventRecord::ShardAckRebuilt { shard } => {
                self.shards.remove(shard);
            }
            EventRecord::ShardUndrain { shard } => {
                if let Some(state) = self.shards.get_mut(shard) {
                    state.drain = false;
                }
            }
        }
    }

    /// LSN of the last applied record.
    pub fn version(&self) -> Lsn {
        self.version
    }

    pub fn is_rebuilding(&self, shard: ShardId) -> bool {
        self.shards.contains_key(&shard)
    }

    pub fn get(&self, shard: ShardId) -> Option<&ShardRebuildingState> {
        self.shards.get(&shard)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Nodes present in `view` with at least one non-time-ranged rebuilding.
    ///
    /// This is the population the supervisor's concurrency threshold counts:
    /// mini rebuildings and nodes that have left the configuration are
    /// ignored.
    pub fn nodes_with_full_rebuilding(&self, view: &ClusterView) -> usize {
        let nodes: BTreeSet<NodeIndex> = self
            .shards
            .iter()
            .filter(|(shard, state)| !state.time_ranged && view.contains(shard.node))
            .map(|(shard, _)| shard.node)
            .collect();
        nodes.len()
    }
}

fn record_is_drain(record: &EventRecord) -> bool {
    use crate::eventlog::record::record_flags;
    matches!(
        record,
        EventRecord::ShardNeedsRebuild { flags, .. } if flags & record_flags::DRAIN != 0
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterViewBuilder;
    use crate::eventlog::record::{RebuildReason, TimeRanges};

    fn needs_rebuild(node: NodeIndex, ranges: Option<TimeRanges>) -> EventRecord {
        EventRecord::shard_needs_rebuild(
            ShardId::new(node, 0),
            0,
            RebuildReason::DeadNode,
            None,
            ranges,
        )
    }

    #[test]
    fn test_apply_and_clear() {
        let mut set = RebuildingSet::new();
        set.apply(1, &needs_rebuild(1, None));
        assert!(set.is_rebuilding(ShardId::new(1, 0)));
        assert_eq!(set.version(), 1);

        set.apply(2, &EventRecord::ShardIsRebuilt { shard: ShardId::new(1, 0) });
        assert!(!set.is_rebuilding(ShardId::new(1, 0)));
        assert!(set.is_empty());
    }

    #[test]
    fn test_threshold_count_skips_mini_and_unknown_nodes() {
        let view = ClusterViewBuilder::new("test")
            .add_nodes(4, 1, None, 4)
            .unwrap()
            .build();
        let mut set = RebuildingSet::new();
        // Full rebuilding on a configured node.
        set.apply(1, &needs_rebuild(1, None));
        // Mini rebuilding on another configured node.
        set.apply(2, &needs_rebuild(2, Some(TimeRanges::single(0, 10))));
        // Full rebuilding on a node outside the configuration.
        set.apply(3, &needs_rebuild(39, None));

        assert_eq!(set.len(), 3);
        assert_eq!(set.nodes_with_full_rebuilding(&view), 1);
    }

    #[test]
    fn test_replay_converges() {
        let records = [
            (1, needs_rebuild(1, None)),
            (2, needs_rebuild(2, None)),
            (3, EventRecord::ShardAbortRebuild { shard: ShardId::new(2, 0) }),
        ];
        let mut a = RebuildingSet::new();
        for (lsn, record) in &records {
            a.apply(*lsn, record);
        }
        let mut b = RebuildingSet::new();
        for (lsn, record) in &records {
            b.apply(*lsn, record);
        }
        assert_eq!(a.len(), b.len());
        assert_eq!(a.version(), b.version());
        assert!(a.is_rebuilding(ShardId::new(1, 0)));
        assert!(!a.is_rebuilding(ShardId::new(2, 0)));
    }

    #[test]
    fn test_undrain_clears_drain_flag() {
        use crate::eventlog::record::record_flags;
        let mut set = RebuildingSet::new();
        let record = EventRecord::ShardNeedsRebuild {
            shard: ShardId::new(3, 0),
            flags: record_flags::DRAIN,
            source_node: 0,
            conditional_version: None,
            ranges: None,
        };
        set.apply(1, &record);
        assert!(set.get(ShardId::new(3, 0)).unwrap().drain);

        set.apply(2, &EventRecord::ShardUndrain { shard: ShardId::new(3, 0) });
        assert!(!set.get(ShardId::new(3, 0)).unwrap().drain);
    }
}
