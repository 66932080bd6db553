//! The rebuilding supervisor.
//!
//! Runs on every node; every instance maintains the same trigger state
//! machine for warm failover, but only the elected leader appends
//! `SHARD_NEEDS_REBUILD` deltas. Leadership is deterministic: the lowest
//! node index that is a storage node, is not known dead, and has read the
//! event log up to its tail.
//!
//! Trigger lifecycle: a failure-detector DEAD transition (or a local shard
//! failure) schedules a trigger `grace_period` in the future; at its
//! deadline the pre-fire gates run in order (in-config, still-dead,
//! storage-node, not-already-rebuilding, concurrency threshold) and the
//! trigger either drops (with a counter naming the reason), defers, or
//! fires. Every appended record observed on the tail cancels the matching
//! pending trigger, which is what makes re-observing an already-published
//! rebuild idempotent.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::admin::RuntimeOverrides;
use crate::cluster::{ClusterView, LivenessTracker, NodeState};
use crate::config::{RebuildingSettings, Settings};
use crate::error::StrandError;
use crate::eventlog::{
    EventLogClient, EventLogEntry, EventLogStore, EventRecord, RebuildReason, RebuildingSet,
    TimeRanges,
};
use crate::rebuilding::{RebuildingTrigger, TriggerQueue};
use crate::stats::SupervisorStats;
use crate::types::{Lsn, NodeIndex, ShardId};

/// Inputs fed to a supervisor from the outside.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// A gossip observation from the failure detector.
    Gossip { node: NodeIndex, count: u64 },
    /// A failure-detector verdict.
    NodeState { node: NodeIndex, state: NodeState },
    /// The local storage engine reported a shard failure.
    LocalShardFailure {
        shard: ShardId,
        reason: RebuildReason,
        ranges: Option<TimeRanges>,
    },
    /// A new cluster configuration snapshot was published.
    ViewUpdated(Arc<ClusterView>),
}

/// Cheap cloneable handle for feeding a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<SupervisorEvent>,
    stats: Arc<SupervisorStats>,
}

impl SupervisorHandle {
    pub fn send(&self, event: SupervisorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn gossip(&self, node: NodeIndex, count: u64) {
        self.send(SupervisorEvent::Gossip { node, count });
    }

    pub fn node_state(&self, node: NodeIndex, state: NodeState) {
        self.send(SupervisorEvent::NodeState { node, state });
    }

    pub fn local_shard_failure(&self, shard: ShardId, reason: RebuildReason) {
        self.send(SupervisorEvent::LocalShardFailure {
            shard,
            reason,
            ranges: None,
        });
    }

    /// A local failure confined to a time range (mini rebuilding).
    pub fn local_time_ranged_failure(&self, shard: ShardId, ranges: TimeRanges) {
        self.send(SupervisorEvent::LocalShardFailure {
            shard,
            reason: RebuildReason::TimeRanged,
            ranges: Some(ranges),
        });
    }

    pub fn view_updated(&self, view: Arc<ClusterView>) {
        self.send(SupervisorEvent::ViewUpdated(view));
    }

    pub fn stats(&self) -> &Arc<SupervisorStats> {
        &self.stats
    }
}

/// The per-node rebuilding supervisor.
pub struct RebuildingSupervisor {
    node: NodeIndex,
    view: Arc<ClusterView>,
    settings: Settings,
    overrides: Arc<RuntimeOverrides>,
    stats: Arc<SupervisorStats>,

    client: EventLogClient,
    tail_rx: mpsc::UnboundedReceiver<EventLogEntry>,
    events_rx: mpsc::UnboundedReceiver<SupervisorEvent>,

    liveness: LivenessTracker,
    rebuilding_set: RebuildingSet,
    queue: TriggerQueue,

    throttled: bool,
    was_leader: bool,
    caught_up: bool,
    /// Tail LSN this node must replay before it may lead.
    catch_up_target: Option<Lsn>,
}

impl RebuildingSupervisor {
    pub fn new(
        node: NodeIndex,
        view: Arc<ClusterView>,
        settings: Settings,
        overrides: Arc<RuntimeOverrides>,
        store: Arc<dyn EventLogStore>,
    ) -> (Self, SupervisorHandle) {
        let (tx, events_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(SupervisorStats::new());
        let tail_rx = store.subscribe();
        let client = EventLogClient::new(store, settings.event_log.clone());
        let effective = overrides.apply(&settings.rebuilding);
        let liveness = LivenessTracker::new(
            effective.min_gossips_for_stable_state,
            Duration::from_millis(0),
        );
        let supervisor = Self {
            node,
            view,
            settings,
            overrides,
            stats: Arc::clone(&stats),
            client,
            tail_rx,
            events_rx,
            liveness,
            rebuilding_set: RebuildingSet::new(),
            queue: TriggerQueue::new(),
            throttled: false,
            was_leader: false,
            caught_up: false,
            catch_up_target: None,
        };
        (supervisor, SupervisorHandle { tx, stats })
    }

    pub fn stats(&self) -> &Arc<SupervisorStats> {
        &self.stats
    }

    /// Drive the supervisor until shutdown.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(node = self.node, "rebuilding supervisor starting");
        self.refresh_catch_up().await;

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(node = self.node, "rebuilding supervisor shutting down");
                    break;
                }
                entry = self.tail_rx.recv() => {
                    match entry {
                        Some(entry) => self.on_entry(entry),
                        None => break,
                    }
                }
                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => self.on_event(event),
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.on_tick().await;
                }
            }
        }
    }

    fn next_deadline(&self) -> tokio::time::Instant {
        let now = Instant::now();
        let fallback = now + if self.caught_up {
            Duration::from_secs(1)
        } else {
            // Keep retrying the tail read until we are caught up.
            Duration::from_millis(50)
        };
        let at = self.queue.next_fire_at().unwrap_or(fallback).min(fallback);
        tokio::time::Instant::from_std(at)
    }

    fn effective_settings(&self) -> RebuildingSettings {
        self.overrides.apply(&self.settings.rebuilding)
    }

    /// Leader = lowest-index storage node not known dead. A node only acts
    /// on its own leadership once caught up on the event log.
    fn current_leader(&self) -> Option<NodeIndex> {
        self.view
            .storage_nodes()
            .map(|n| n.index)
            .filter(|&idx| {
                idx == self.node
                    || matches!(
                        self.liveness.state(idx),
                        NodeState::Alive | NodeState::Suspect
                    )
            })
            .min()
    }

    fn is_leader(&self) -> bool {
        self.caught_up && self.current_leader() == Some(self.node)
    }

    async fn refresh_catch_up(&mut self) {
        if self.caught_up {
            return;
        }
        match self.client.tail_lsn().await {
            Ok(tail) => {
                self.catch_up_target = Some(tail);
                if self.rebuilding_set.version() >= tail {
                    self.caught_up = true;
                    debug!(node = self.node, tail, "caught up with event log");
                }
            }
            Err(err) => {
                debug!(node = self.node, error = %err, "tail read failed");
            }
        }
    }

    fn on_entry(&mut self, entry: EventLogEntry) {
        let (_, record) = match EventLogClient::decode(&entry) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(node = self.node, lsn = entry.lsn, error = %err, "undecodable event log record");
                return;
            }
        };
        self.rebuilding_set.apply(entry.lsn, &record);
        if let Some(target) = self.catch_up_target {
            if !self.caught_up && self.rebuilding_set.version() >= target {
                self.caught_up = true;
            }
        }

        // A published rebuild supersedes the matching pending trigger. This
        // also makes re-observing a record we fired ourselves a no-op.
        if let EventRecord::ShardNeedsRebuild { shard, .. } = record {
            if self.queue.remove(shard).is_some() {
                debug!(node = self.node, %shard, "trigger cancelled, rebuilding already published");
                self.stats.not_triggered_started();
            }
        }
    }

    fn on_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Gossip { node, count } => {
                if let Some(transition) = self.liveness.on_gossip(node, count) {
                    self.on_transition(transition.node, transition.to);
                }
            }
            SupervisorEvent::NodeState { node, state } => {
                if let Some(transition) = self.liveness.set_state(node, state) {
                    self.on_transition(transition.node, transition.to);
                }
            }
            SupervisorEvent::LocalShardFailure {
                shard,
                reason,
                ranges,
            } => {
                self.schedule_local(shard, reason, ranges);
            }
            SupervisorEvent::ViewUpdated(view) => {
                self.on_view_updated(view);
            }
        }
    }

    fn on_transition(&mut self, node: NodeIndex, state: NodeState) {
        match state {
            NodeState::Dead => self.schedule_node(node),
            NodeState::Alive => self.cancel_node_alive(node),
            NodeState::Suspect | NodeState::Unknown => {
                // Triggers are held through the suspect state.
            }
        }
    }

    /// Schedule triggers for every shard of a dead node.
    fn schedule_node(&mut self, node: NodeIndex) {
        if node == self.node || !self.view.contains(node) {
            return;
        }
        let grace = self.effective_settings().self_initiated_rebuilding_grace_period;
        let fire_at = Instant::now() + grace;
        for shard in self.view.shards_of(node) {
            if self
                .queue
                .insert(RebuildingTrigger::new(shard, RebuildReason::DeadNode, fire_at))
            {
                self.stats.scheduled();
                debug!(node = self.node, %shard, "rebuild trigger scheduled");
            }
        }
    }

    fn schedule_local(&mut self, shard: ShardId, reason: RebuildReason, ranges: Option<TimeRanges>) {
        let grace = self.effective_settings().self_initiated_rebuilding_grace_period;
        let mut trigger = RebuildingTrigger::new(shard, reason, Instant::now() + grace);
        if let Some(ranges) = ranges {
            trigger = trigger.with_ranges(ranges);
        }
        if self.queue.insert(trigger) {
            self.stats.scheduled();
            warn!(node = self.node, %shard, %reason, "local shard failure, rebuild trigger scheduled");
        }
    }

    /// A node came back: cancel its pending triggers, except locally
    /// observed failures, which fire regardless of liveness.
    fn cancel_node_alive(&mut self, node: NodeIndex) {
        let cancelled: Vec<RebuildingTrigger> = self
            .queue
            .remove_node(node)
            .into_iter()
            .filter(|t| {
                if t.is_local() {
                    self.queue.insert(t.clone());
                    false
                } else {
                    true
                }
            })
            .collect();
        for trigger in &cancelled {
            debug!(node = self.node, shard = %trigger.shard, "trigger cancelled, node alive again");
            self.stats.not_triggered_nodealive();
        }
    }

    fn on_view_updated(&mut self, view: Arc<ClusterView>) {
        // Drop triggers whose node left the configuration; count once per
        // node, the gates are node-granular.
        let gone: Vec<NodeIndex> = {
            let mut nodes: Vec<NodeIndex> =
                self.queue.iter().map(|t| t.shard.node).collect();
            nodes.sort_unstable();
            nodes.dedup();
            nodes.into_iter().filter(|n| !view.contains(*n)).collect()
        };
        for node in gone {
            self.queue.remove_node(node);
            self.stats.not_triggered_notinconfig();
            info!(node = self.node, gone = node, "triggers dropped, node left configuration");
        }
        self.view = view;
    }

    /// Apply any already-delivered tail entries before making decisions, so
    /// conditional appends run against the freshest replayed version.
    fn drain_tail(&mut self) {
        while let Ok(entry) = self.tail_rx.try_recv() {
            self.on_entry(entry);
        }
    }

    /// Gates re-evaluate on every scheduled fire; that only helps if
    /// pending liveness and tail input is applied first.
    fn drain_inputs(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.on_event(event);
        }
        self.drain_tail();
    }

    async fn on_tick(&mut self) {
        self.drain_inputs();
        self.refresh_catch_up().await;

        let effective = self.effective_settings();
        let leader = self.is_leader();
        if self.was_leader && !leader {
            let dropped = self.queue.clear();
            if self.throttled {
                self.throttled = false;
                self.stats.set_throttled(false);
            }
            info!(node = self.node, dropped, "leadership lost, pending triggers cancelled");
        }
        self.was_leader = leader;

        if leader {
            // Trigger-queue threshold: while over the limit, nothing fires.
            if self.queue.len() > effective.max_rebuilding_trigger_queue_size {
                if !self.throttled {
                    self.throttled = true;
                    self.stats.set_throttled(true);
                    warn!(
                        node = self.node,
                        queued = self.queue.len(),
                        limit = effective.max_rebuilding_trigger_queue_size,
                        "rebuilding supervisor throttled"
                    );
                }
                // Keep the queue armed one grace period out rather than
                // spinning on already-due deadlines.
                let now = Instant::now();
                let grace = effective.self_initiated_rebuilding_grace_period;
                for shard in self.queue.due(now) {
                    if let Some(trigger) = self.queue.get_mut(shard) {
                        trigger.fire_at = now + grace;
                    }
                }
                return;
            } else if self.throttled {
                self.throttled = false;
                self.stats.set_throttled(false);
                info!(node = self.node, "rebuilding supervisor unthrottled");
            }
        }

        let now = Instant::now();
        let due = self.queue.due(now);
        let mut skip_nodes: Vec<NodeIndex> = Vec::new();
        for shard in due {
            self.drain_inputs();
            if skip_nodes.contains(&shard.node) || !self.queue.contains(shard) {
                continue;
            }
            self.evaluate_trigger(shard, &effective, leader, now, &mut skip_nodes)
                .await;
        }
    }

    async fn evaluate_trigger(
        &mut self,
        shard: ShardId,
        effective: &RebuildingSettings,
        leader: bool,
        now: Instant,
        skip_nodes: &mut Vec<NodeIndex>,
    ) {
        let grace = effective.self_initiated_rebuilding_grace_period;
        let (is_local, reason, ranges) = match self.queue.get_mut(shard) {
            Some(t) => (t.is_local(), t.reason, t.ranges.clone()),
            None => return,
        };

        // Gate 1: the node must still be in the configuration.
        if !self.view.contains(shard.node) {
            self.queue.remove_node(shard.node);
            skip_nodes.push(shard.node);
            self.stats.not_triggered_notinconfig();
            info!(node = self.node, %shard, "not triggered, node not in config");
            return;
        }

        // Gate 2: the node must still look dead, unless the failure was
        // observed locally.
        if !is_local && self.liveness.state(shard.node).is_alive() {
            self.queue.remove(shard);
            self.stats.not_triggered_nodealive();
            info!(node = self.node, %shard, "not triggered, node alive");
            return;
        }

        // Gate 3: only storage nodes are rebuild targets.
        let is_storage = self
            .view
            .node(shard.node)
            .map_or(false, |n| n.is_storage_node());
        if !is_storage {
            self.queue.remove_node(shard.node);
            skip_nodes.push(shard.node);
            self.stats.not_triggered_notstorage();
            info!(node = self.node, %shard, "not triggered, not a storage node");
            return;
        }

        // Gate 4: the event log may already show this rebuilding.
        if self.rebuilding_set.is_rebuilding(shard) {
            self.queue.remove(shard);
            self.stats.not_triggered_started();
            info!(node = self.node, %shard, "not triggered, rebuilding already started");
            return;
        }

        // Only the leader publishes; a node may always publish rebuilds of
        // its own locally failed shards. Everyone else re-arms silently.
        let may_fire = leader || (is_local && shard.node == self.node);
        if !may_fire || !effective.enable_self_initiated_rebuilding {
            if let Some(trigger) = self.queue.get_mut(shard) {
                trigger.fire_at = now + grace;
            }
            return;
        }

        // Gate 5: cluster-wide concurrency threshold, counted in nodes with
        // a full (non-time-ranged) rebuilding, ignoring nodes outside the
        // configuration.
        let rebuilding_nodes = self.rebuilding_set.nodes_with_full_rebuilding(&self.view);
        let total = self.view.num_storage_nodes();
        if total > 0
            && rebuilding_nodes * 100 >= effective.max_node_rebuilding_percentage as usize * total
        {
            if let Some(trigger) = self.queue.get_mut(shard) {
                trigger.fire_at = now + grace;
                trigger.attempts += 1;
            }
            self.stats.scheduled();
            info!(
                node = self.node,
                %shard,
                rebuilding_nodes,
                total,
                "rebuilding deferred by concurrency threshold"
            );
            return;
        }

        // Fire.
        let record = EventRecord::shard_needs_rebuild(
            shard,
            self.node,
            reason,
            Some(self.rebuilding_set.version()),
            ranges,
        );
        match self
            .client
            .append_record(&record, Some(self.rebuilding_set.version()))
            .await
        {
            Ok(lsn) => {
                self.queue.remove(shard);
                self.stats.triggered();
                info!(node = self.node, %shard, lsn, %reason, "rebuilding triggered");
            }
            Err(StrandError::ConditionalVersionMismatch { expected, found }) => {
                // The log moved under us; re-evaluate after replaying it.
                if let Some(trigger) = self.queue.get_mut(shard) {
                    trigger.fire_at = now + grace;
                    trigger.attempts += 1;
                }
                debug!(node = self.node, %shard, expected, found, "append version mismatch, re-evaluating");
            }
            Err(err) => {
                if let Some(trigger) = self.queue.get_mut(shard) {
                    trigger.fire_at = now + grace;
                    trigger.attempts += 1;
                }
                warn!(node = self.node, %shard, error = %err, "rebuilding append failed, re-scheduled");
            }
        }
    }
}
