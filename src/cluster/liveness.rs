//! Per-node liveness tracking.
//!
//! The actual failure detector (gossip transport, phi accrual) lives outside
//! this crate; it feeds state transitions and gossip counts into the
//! [`LivenessTracker`], which smooths them for the rebuilding supervisor:
//! a node coming up passes through `Suspect` until it has gossiped enough
//! times and its suspect grace elapsed, and stale gossip regressions are
//! ignored.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::types::NodeIndex;

/// Liveness state of a node, as seen from this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Alive,
    /// Recently heard but not yet trusted as stable.
    Suspect,
    Dead,
    Unknown,
}

impl NodeState {
    pub fn is_alive(&self) -> bool {
        matches!(self, NodeState::Alive)
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, NodeState::Dead)
    }
}

/// Per-node liveness record.
#[derive(Debug, Clone)]
pub struct LivenessRecord {
    pub state: NodeState,
    pub last_heard: Instant,
    pub gossip_count: u64,
}

/// A state transition worth acting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessTransition {
    pub node: NodeIndex,
    pub from: NodeState,
    pub to: NodeState,
}

/// Tracks the liveness of every node in the cluster.
#[derive(Debug)]
pub struct LivenessTracker {
    records: HashMap<NodeIndex, LivenessRecord>,
    /// Gossip count below which a reviving node stays suspect.
    min_gossips_for_stable_state: u64,
    /// Minimum time a reviving node stays suspect.
    suspect_grace: Duration,
}

impl LivenessTracker {
    pub fn new(min_gossips_for_stable_state: u64, suspect_grace: Duration) -> Self {
        Self {
            records: HashMap::new(),
            min_gossips_for_stable_state,
            suspect_grace,
        }
    }

    pub fn state(&self, node: NodeIndex) -> NodeState {
        self.records
            .get(&node)
            .map(|r| r.state)
            .unwrap_or(NodeState::Unknown)
    }

    pub fn record(&self, node: NodeIndex) -> Option<&LivenessRecord> {
        self.records.get(&node)
    }

    /// Ingest a gossip observation for `node`.
    ///
    /// Returns a transition when the node's state changed. A dead or unknown
    /// node moves to `Suspect` first and is promoted to `Alive` once it has
    /// gossiped `min_gossips_for_stable_state` times since revival and its
    /// suspect grace elapsed. Gossip-count regressions (reordered packets)
    /// are dropped.
    pub fn on_gossip(&mut self, node: NodeIndex, gossip_count: u64) -> Option<LivenessTransition> {
        let now = Instant::now();
        let record = self.records.entry(node).or_insert(LivenessRecord {
            state: NodeState::Unknown,
            last_heard: now,
            gossip_count: 0,
        });
        if gossip_count < record.gossip_count {
            debug!(node, gossip_count, "stale gossip ignored");
            return None;
        }

        let from = record.state;
        let suspect_since = match from {
            NodeState::Dead | NodeState::Unknown => {
                record.gossip_count = gossip_count;
                record.last_heard = now;
                record.state = NodeState::Suspect;
                return Some(LivenessTransition {
                    node,
                    from,
                    to: NodeState::Suspect,
                });
            }
            NodeState::Suspect => record.last_heard,
            NodeState::Alive => {
                record.gossip_count = gossip_count;
                record.last_heard = now;
                return None;
            }
        };

        let gossips_since_revival = gossip_count.saturating_sub(record.gossip_count);
        if gossips_since_revival >= self.min_gossips_for_stable_state
            && now.duration_since(suspect_since) >= self.suspect_grace
        {
            record.state = NodeState::Alive;
            record.gossip_count = gossip_count;
            record.last_heard = now;
            Some(LivenessTransition {
                node,
                from,
                to: NodeState::Alive,
            })
        } else {
            None
        }
    }

    /// Apply an externally detected state (failure-detector verdicts).
    pub fn set_state(&mut self, node: NodeIndex, state: NodeState) -> Option<LivenessTransition> {
        let now = Instant::now();
        let record = self.records.entry(node).or_insert(LivenessRecord {
            state: NodeState::Unknown,
            last_heard: now,
            gossip_count: 0,
        });
        let from = record.state;
        if from == state {
            return None;
        }
        record.state = state;
        record.last_heard = now;
        Some(LivenessTransition { node, from, to: state })
    }

    /// Nodes currently alive, in index order.
    pub fn alive_nodes(&self) -> Vec<NodeIndex> {
        let mut alive: Vec<_> = self
            .records
            .iter()
            .filter(|(_, r)| r.state.is_alive())
            .map(|(&n, _)| n)
            .collect();
        alive.sort_unstable();
        alive
    }
}
