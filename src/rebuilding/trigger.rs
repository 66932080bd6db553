//! Rebuild triggers and the per-leader trigger queue.
//!
//! A trigger is the supervisor's intent to append `SHARD_NEEDS_REBUILD` for
//! one shard. Triggers live in an in-memory queue until fired or cancelled;
//! the queue is a soft cache over the event log and is rebuilt from scratch
//! on leadership changes.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::eventlog::{RebuildReason, TimeRanges};
use crate::types::{NodeIndex, ShardId};

/// A pending intent to request a shard rebuild.
#[derive(Debug, Clone)]
pub struct RebuildingTrigger {
    pub shard: ShardId,
    pub reason: RebuildReason,
    /// When the underlying failure was first observed.
    pub first_observed_at: Instant,
    /// When the pre-fire gates are next evaluated.
    pub fire_at: Instant,
    /// Dirty ranges for mini rebuildings.
    pub ranges: Option<TimeRanges>,
    /// Failed or deferred fire attempts so far.
    pub attempts: u32,
}

impl RebuildingTrigger {
    pub fn new(shard: ShardId, reason: RebuildReason, fire_at: Instant) -> Self {
        Self {
            shard,
            reason,
            first_observed_at: Instant::now(),
            fire_at,
            ranges: None,
            attempts: 0,
        }
    }

    pub fn with_ranges(mut self, ranges: TimeRanges) -> Self {
        self.ranges = Some(ranges);
        self
    }

    /// Locally observed failures fire even while the node looks alive to
    /// the failure detector. Time-ranged triggers are local by nature: a
    /// node reports its own dirty ranges after a crash.
    pub fn is_local(&self) -> bool {
        matches!(
            self.reason,
            RebuildReason::IoError
                | RebuildReason::Corrupted
                | RebuildReason::MissingCompletionMetadata
                | RebuildReason::TimeRanged
        )
    }
}

/// The supervisor's pending triggers, keyed by shard.
#[derive(Debug, Default)]
pub struct TriggerQueue {
    triggers: BTreeMap<ShardId, RebuildingTrigger>,
}

impl TriggerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless a trigger for the shard is already pending.
    /// Returns whether the trigger was inserted.
    pub fn insert(&mut self, trigger: RebuildingTrigger) -> bool {
        use std::collections::btree_map::Entry;
        match self.triggers.entry(trigger.shard) {
            Entry::Vacant(slot) => {
                slot.insert(trigger);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn contains(&self, shard: ShardId) -> bool {
        self.triggers.contains_key(&shard)
    }

    pub fn get_mut(&mut self, shard: ShardId) -> Option<&mut RebuildingTrigger> {
        self.triggers.get_mut(&shard)
    }

    pub fn remove(&mut self, shard: ShardId) -> Option<RebuildingTrigger> {
        self.triggers.remove(&shard)
    }

    /// Cancel every trigger belonging to `node`.
    pub fn remove_node(&mut self, node: NodeIndex) -> Vec<RebuildingTrigger> {
        let shards: Vec<ShardId> = self
            .triggers
            .keys()
            .filter(|s| s.node == node)
            .copied()
            .collect();
        shards
            .into_iter()
            .filter_map(|s| self.triggers.remove(&s))
            .collect()
    }

    /// Drop everything (leadership loss).
    pub fn clear(&mut self) -> usize {
        let n = self.triggers.len();
        self.triggers.clear();
        n
    }

    /// The earliest pending deadline.
    pub fn next_fire_at(&self) -> Option<Instant> {
        self.triggers.values().map(|t| t.fire_at).min()
    }

    /// Shards whose deadline has passed, in shard order.
    pub fn due(&self, now: Instant) -> Vec<ShardId> {
        self.triggers
            .values()
            .filter(|t| t.fire_at <= now)
            .map(|t| t.shard)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RebuildingTrigger> {
        self.triggers.values()
    }
}
