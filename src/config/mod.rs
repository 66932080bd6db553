//! Configuration for the strand control plane.
//!
//! Settings are plain serde structs with defaults tuned for production;
//! integration tests shrink the grace periods to milliseconds. Runtime
//! overrides (admin `set` commands) are layered on top by
//! [`crate::admin::RuntimeOverrides`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{Result, StrandError};
use crate::replication::ReplicationProperty;
use crate::types::LogId;

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Rebuilding-supervisor settings.
    pub rebuilding: RebuildingSettings,
    /// Event-log client settings.
    pub event_log: EventLogSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        self.rebuilding.validate()?;
        self.event_log.validate()
    }
}

/// Settings of the rebuilding supervisor and log enumerator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildingSettings {
    /// Master gate: whether this cluster fires its own rebuild triggers.
    pub enable_self_initiated_rebuilding: bool,
    /// Skip data logs in the enumerator; only metadata logs are re-read.
    pub disable_data_log_rebuilding: bool,
    /// How long a failure must persist before a trigger fires.
    pub self_initiated_rebuilding_grace_period: Duration,
    /// Upper bound on the share of storage nodes rebuilding at once, in
    /// percent of the cluster.
    pub max_node_rebuilding_percentage: u8,
    /// Trigger-queue size above which the supervisor throttles itself.
    pub max_rebuilding_trigger_queue_size: usize,
    /// Stability window for event-log tail reads.
    pub event_log_grace_period: Duration,
    /// Route logs to local shards with the legacy modulo mapping.
    pub use_legacy_log_to_shard_mapping_in_rebuilding: bool,
    /// Gossip count below which a reviving node is still suspect.
    pub min_gossips_for_stable_state: u64,
    /// Also enumerate internal logs for rebuilding.
    pub rebuild_internal_logs: bool,
    /// Also enumerate metadata logs (requires a storage task).
    pub rebuild_metadata_logs: bool,
}

impl Default for RebuildingSettings {
    fn default() -> Self {
        Self {
            enable_self_initiated_rebuilding: true,
            disable_data_log_rebuilding: false,
            self_initiated_rebuilding_grace_period: Duration::from_secs(20 * 60),
            max_node_rebuilding_percentage: 35,
            max_rebuilding_trigger_queue_size: 200,
            event_log_grace_period: Duration::from_millis(100),
            use_legacy_log_to_shard_mapping_in_rebuilding: true,
            min_gossips_for_stable_state: 3,
            rebuild_internal_logs: false,
            rebuild_metadata_logs: true,
        }
    }
}

impl RebuildingSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_node_rebuilding_percentage > 100 {
            return Err(StrandError::InvalidConfig {
                field: "rebuilding.max_node_rebuilding_percentage".into(),
                reason: "must be within 0..=100".into(),
            });
        }
        if self.max_rebuilding_trigger_queue_size == 0 {
            return Err(StrandError::InvalidConfig {
                field: "rebuilding.max_rebuilding_trigger_queue_size".into(),
                reason: "must be non-zero".into(),
            });
        }
        Ok(())
    }
}

/// Event-log client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogSettings {
    /// Per-attempt append timeout.
    pub append_timeout: Duration,
    /// First retry delay; doubles per attempt with jitter.
    pub append_backoff_initial: Duration,
    /// Retry delay ceiling.
    pub append_backoff_max: Duration,
    /// Append attempts before the error surfaces to the caller.
    pub append_max_attempts: u32,
}

impl Default for EventLogSettings {
    fn default() -> Self {
        Self {
            append_timeout: Duration::from_secs(30),
            append_backoff_initial: Duration::from_millis(250),
            append_backoff_max: Duration::from_secs(10),
            append_max_attempts: 3,
        }
    }
}

impl EventLogSettings {
    pub fn validate(&self) -> Result<()> {
        if self.append_max_attempts == 0 {
            return Err(StrandError::InvalidConfig {
                field: "event_log.append_max_attempts".into(),
                reason: "must be non-zero".into(),
            });
        }
        Ok(())
    }
}

/// Per-log attributes relevant to placement and rebuilding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogAttributes {
    pub replication: ReplicationProperty,
    /// Desired nodeset size; `None` means all eligible shards.
    pub nodeset_size: Option<usize>,
    /// Retention window; `None` means infinite retention.
    pub backlog: Option<Duration>,
    /// Internal logs (event log, metadata logs) are skipped by the
    /// enumerator unless configured otherwise.
    pub internal: bool,
}

impl LogAttributes {
    pub fn new(replication: ReplicationProperty) -> Self {
        Self {
            replication,
            nodeset_size: None,
            backlog: None,
            internal: false,
        }
    }

    pub fn nodeset_size(mut self, size: usize) -> Self {
        self.nodeset_size = Some(size);
        self
    }

    pub fn backlog(mut self, backlog: Duration) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}

/// The set of configured logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogsConfig {
    logs: BTreeMap<LogId, LogAttributes>,
}

impl LogsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, log_id: LogId, attrs: LogAttributes) {
        self.logs.insert(log_id, attrs);
    }

    pub fn get(&self, log_id: LogId) -> Option<&LogAttributes> {
        self.logs.get(&log_id)
    }

    pub fn require(&self, log_id: LogId) -> Result<&LogAttributes> {
        self.get(log_id).ok_or(StrandError::LogNotFound(log_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (LogId, &LogAttributes)> {
        self.logs.iter().map(|(&id, a)| (id, a))
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocationScope;

    #[test]
    fn test_defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_percentage_bounds() {
        let mut settings = RebuildingSettings::default();
        settings.max_node_rebuilding_percentage = 101;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_logs_config_lookup() {
        let mut logs = LogsConfig::new();
        logs.insert(
            LogId(1),
            LogAttributes::new(ReplicationProperty::with_scope_factor(
                LocationScope::Rack,
                3,
            ))
            .nodeset_size(10),
        );
        assert_eq!(logs.require(LogId(1)).unwrap().nodeset_size, Some(10));
        assert!(logs.require(LogId(2)).is_err());
    }

    #[test]
    fn test_settings_serde_roundtrip() {
        let settings = Settings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.rebuilding.max_rebuilding_trigger_queue_size,
            settings.rebuilding.max_rebuilding_trigger_queue_size
        );
    }
}
