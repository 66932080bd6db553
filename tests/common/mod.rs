//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use strand::admin::RuntimeOverrides;
use strand::cluster::{ClusterView, ClusterViewBuilder, NodeState};
use strand::config::{EventLogSettings, LogAttributes, LogsConfig, RebuildingSettings, Settings};
use strand::eventlog::{
    EventLogClient, EventLogEntry, EventRecord, InMemoryEventLog, RebuildReason, TimeRanges,
};
use strand::rebuilding::{RebuildingSupervisor, SupervisorHandle};
use strand::stats::SupervisorStatsSnapshot;
use strand::types::{LogId, NodeIndex, ShardId, ShardIndex};

/// Grace period used by simulated clusters.
pub const SIM_GRACE: Duration = Duration::from_millis(40);

/// Settings tuned for fast simulated clusters.
pub fn sim_settings() -> Settings {
    Settings {
        rebuilding: RebuildingSettings {
            self_initiated_rebuilding_grace_period: SIM_GRACE,
            event_log_grace_period: Duration::from_millis(1),
            min_gossips_for_stable_state: 0,
            ..Default::default()
        },
        event_log: EventLogSettings {
            append_timeout: Duration::from_millis(100),
            append_backoff_initial: Duration::from_millis(1),
            append_backoff_max: Duration::from_millis(5),
            append_max_attempts: 1,
        },
    }
}

/// Build a flat (unlocated) cluster of `nodes` storage nodes.
pub fn flat_view(nodes: usize, shards: ShardIndex) -> Arc<ClusterView> {
    ClusterViewBuilder::new("sim")
        .add_nodes(nodes, shards, None, nodes)
        .unwrap()
        .build()
}

/// A log config with `count` logs of the given attributes.
pub fn logs_of(count: u64, attrs: LogAttributes) -> LogsConfig {
    let mut logs = LogsConfig::new();
    for id in 1..=count {
        logs.insert(LogId(id), attrs.clone());
    }
    logs
}

/// One simulated node: a running supervisor plus its control handles.
pub struct SimNode {
    pub handle: SupervisorHandle,
    pub overrides: Arc<RuntimeOverrides>,
    task: JoinHandle<()>,
}

/// A simulated cluster: one supervisor per node over a shared in-memory
/// event log, with scripted liveness.
pub struct SimCluster {
    pub log: InMemoryEventLog,
    pub view: Arc<ClusterView>,
    nodes: BTreeMap<NodeIndex, SimNode>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SimCluster {
    /// Start supervisors for `started` nodes of `view` and declare every
    /// started pair mutually alive and every non-started node dead.
    pub async fn start(
        view: Arc<ClusterView>,
        settings: Settings,
        started: &[NodeIndex],
    ) -> Self {
        init_tracing();
        let log = InMemoryEventLog::new();
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut nodes = BTreeMap::new();

        for &index in started {
            let overrides = Arc::new(RuntimeOverrides::new());
            let (supervisor, handle) = RebuildingSupervisor::new(
                index,
                Arc::clone(&view),
                settings.clone(),
                Arc::clone(&overrides),
                Arc::new(log.handle(index)),
            );
            let task = tokio::spawn(supervisor.run(shutdown_tx.subscribe()));
            nodes.insert(index, SimNode {
                handle,
                overrides,
                task,
            });
        }

        let cluster = Self {
            log,
            view,
            nodes,
            shutdown_tx,
        };

        // Seed the liveness views.
        let started: Vec<NodeIndex> = cluster.nodes.keys().copied().collect();
        for node in cluster.view.nodes().map(|n| n.index) {
            let state = if started.contains(&node) {
                NodeState::Alive
            } else {
                NodeState::Dead
            };
            cluster.broadcast_state(node, state);
        }
        // Let the supervisors read the (possibly empty) tail.
        tokio::time::sleep(Duration::from_millis(20)).await;
        cluster
    }

    pub fn node(&self, index: NodeIndex) -> &SimNode {
        &self.nodes[&index]
    }

    pub fn stats(&self, index: NodeIndex) -> SupervisorStatsSnapshot {
        self.nodes[&index].handle.stats().snapshot()
    }

    /// Tell every running supervisor (except `node` itself) that `node`
    /// changed state.
    pub fn broadcast_state(&self, node: NodeIndex, state: NodeState) {
        for (&index, sim) in &self.nodes {
            if index != node {
                sim.handle.node_state(node, state);
            }
        }
    }

    /// Kill a node: stop its supervisor, disconnect it from the event log,
    /// and let the failure detector report it dead.
    pub fn kill(&mut self, node: NodeIndex) {
        if let Some(sim) = self.nodes.remove(&node) {
            sim.task.abort();
        }
        self.log.set_connected(node, false);
        self.broadcast_state(node, NodeState::Dead);
    }

    /// Report a (possibly never-started) node as alive again. Liveness is
    /// delivered before the event-log reconnection so that supervisors
    /// cancel triggers before they can observe the healed log.
    pub fn revive(&self, node: NodeIndex) {
        self.broadcast_state(node, NodeState::Alive);
        self.log.set_connected(node, true);
    }

    /// Isolate `node` into its own partition: it loses the event log and
    /// sees everyone else dead; everyone else sees it dead.
    pub fn isolate(&self, node: NodeIndex) {
        self.log.set_connected(node, false);
        self.broadcast_state(node, NodeState::Dead);
        if let Some(sim) = self.nodes.get(&node) {
            for peer in self.view.nodes().map(|n| n.index) {
                if peer != node {
                    sim.handle.node_state(peer, NodeState::Dead);
                }
            }
        }
    }

    /// Heal an isolation created by [`Self::isolate`]. Liveness first, then
    /// the event-log reconnection, mirroring [`Self::revive`].
    pub fn heal(&self, node: NodeIndex) {
        self.broadcast_state(node, NodeState::Alive);
        if let Some(sim) = self.nodes.get(&node) {
            for peer in self.view.nodes().map(|n| n.index) {
                if peer != node && self.nodes.contains_key(&peer) {
                    sim.handle.node_state(peer, NodeState::Alive);
                }
            }
        }
        self.log.set_connected(node, true);
    }

    /// An event-log client for out-of-band appends (admin tooling).
    pub fn admin_client(&self) -> EventLogClient {
        EventLogClient::new(
            Arc::new(self.log.handle(u16::MAX)),
            EventLogSettings::default(),
        )
    }

    /// Append a rebuild request as an external admin would.
    pub async fn request_rebuild(
        &self,
        shard: ShardId,
        ranges: Option<TimeRanges>,
    ) {
        let record = EventRecord::shard_needs_rebuild(
            shard,
            u16::MAX,
            RebuildReason::Unknown,
            None,
            ranges,
        );
        self.admin_client()
            .append_record(&record, None)
            .await
            .expect("admin append");
    }

    /// All `SHARD_NEEDS_REBUILD` shards currently in the log, in order.
    pub fn rebuild_requests(&self) -> Vec<ShardId> {
        self.decoded()
            .into_iter()
            .filter_map(|(_, record)| match record {
                EventRecord::ShardNeedsRebuild { shard, .. } => Some(shard),
                _ => None,
            })
            .collect()
    }

    pub fn decoded(&self) -> Vec<(u64, EventRecord)> {
        self.log
            .entries()
            .iter()
            .map(|entry: &EventLogEntry| {
                let (_, record) = EventLogClient::decode(entry).expect("decodable entry");
                (entry.lsn, record)
            })
            .collect()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for (_, sim) in self.nodes {
            let _ = tokio::time::timeout(Duration::from_secs(1), sim.task).await;
        }
    }
}

/// Install a fmt subscriber honouring `RUST_LOG`, once per process.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `predicate` until it holds or the timeout expires.
pub async fn wait_until(description: &str, predicate: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if predicate() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {description}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Sleep long enough for several grace periods to elapse.
pub async fn settle() {
    tokio::time::sleep(SIM_GRACE * 5).await;
}
