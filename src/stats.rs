//! Supervisor observability counters.
//!
//! Counter names match the admin stats surface one-for-one; integration
//! tests assert on snapshots of this struct. Values are mirrored to the
//! `metrics` facade for whatever exporter the embedding process installs.

use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of the rebuilding supervisor.
#[derive(Debug, Default)]
pub struct SupervisorStats {
    shard_rebuilding_triggered: AtomicU64,
    shard_rebuilding_scheduled: AtomicU64,
    shard_rebuilding_not_triggered_started: AtomicU64,
    shard_rebuilding_not_triggered_nodealive: AtomicU64,
    node_rebuilding_not_triggered_notinconfig: AtomicU64,
    node_rebuilding_not_triggered_notstorage: AtomicU64,
    rebuilding_supervisor_throttled: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStatsSnapshot {
    pub shard_rebuilding_triggered: u64,
    pub shard_rebuilding_scheduled: u64,
    pub shard_rebuilding_not_triggered_started: u64,
    pub shard_rebuilding_not_triggered_nodealive: u64,
    pub node_rebuilding_not_triggered_notinconfig: u64,
    pub node_rebuilding_not_triggered_notstorage: u64,
    pub rebuilding_supervisor_throttled: u64,
}

impl SupervisorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn triggered(&self) {
        self.shard_rebuilding_triggered.fetch_add(1, Ordering::Relaxed);
        counter!("shard_rebuilding_triggered", 1);
    }

    pub fn scheduled(&self) {
        self.shard_rebuilding_scheduled.fetch_add(1, Ordering::Relaxed);
        counter!("shard_rebuilding_scheduled", 1);
    }

    pub fn not_triggered_started(&self) {
        self.shard_rebuilding_not_triggered_started
            .fetch_add(1, Ordering::Relaxed);
        counter!("shard_rebuilding_not_triggered_started", 1);
    }

    pub fn not_triggered_nodealive(&self) {
        self.shard_rebuilding_not_triggered_nodealive
            .fetch_add(1, Ordering::Relaxed);
        counter!("shard_rebuilding_not_triggered_nodealive", 1);
    }

    pub fn not_triggered_notinconfig(&self) {
        self.node_rebuilding_not_triggered_notinconfig
            .fetch_add(1, Ordering::Relaxed);
        counter!("node_rebuilding_not_triggered_notinconfig", 1);
    }

    pub fn not_triggered_notstorage(&self) {
        self.node_rebuilding_not_triggered_notstorage
            .fetch_add(1, Ordering::Relaxed);
        counter!("node_rebuilding_not_triggered_notstorage", 1);
    }

    /// Set the throttled flag (a 0/1 gauge, not a counter).
    pub fn set_throttled(&self, throttled: bool) {
        self.rebuilding_supervisor_throttled
            .store(throttled as u64, Ordering::Relaxed);
        gauge!("rebuilding_supervisor_throttled", throttled as u8 as f64);
    }

    pub fn is_throttled(&self) -> bool {
        self.rebuilding_supervisor_throttled.load(Ordering::Relaxed) != 0
    }

    pub fn snapshot(&self) -> SupervisorStatsSnapshot {
        SupervisorStatsSnapshot {
            shard_rebuilding_triggered: self.shard_rebuilding_triggered.load(Ordering::Relaxed),
            shard_rebuilding_scheduled: self.shard_rebuilding_scheduled.load(Ordering::Relaxed),
            shard_rebuilding_not_triggered_started: self
                .shard_rebuilding_not_triggered_started
                .load(Ordering::Relaxed),
            shard_rebuilding_not_triggered_nodealive: self
                .shard_rebuilding_not_triggered_nodealive
                .load(Ordering::Relaxed),
            node_rebuilding_not_triggered_notinconfig: self
                .node_rebuilding_not_triggered_notinconfig
                .load(Ordering::Relaxed),
            node_rebuilding_not_triggered_notstorage: self
                .node_rebuilding_not_triggered_notstorage
                .load(Ordering::Relaxed),
            rebuilding_supervisor_throttled: self
                .rebuilding_supervisor_throttled
                .load(Ordering::Relaxed),
        }
    }
}
