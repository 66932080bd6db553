//! Enumeration of the logs affected by a failed shard.
//!
//! For one shard, produces the set of logs whose records may reside there
//! and the earliest timestamp each must be re-read from. Data logs come
//! from the logs configuration; metadata logs live only in the local store
//! and are listed by an asynchronous storage task that is retried
//! indefinitely on failure, at least ten seconds apart. Enumeration runs on
//! the shard's worker and the result is delivered exactly once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::{LogsConfig, RebuildingSettings};
use crate::error::Result;
use crate::placement::LogToShardMapping;
use crate::types::{LogId, ShardIndex};
use crate::worker::WorkerPool;

/// Storage-task seam: list the metadata logs present on a shard.
#[async_trait]
pub trait MetadataLogStorage: Send + Sync {
    async fn enumerate_metadata_logs(&self, shard: ShardIndex) -> Result<Vec<LogId>>;
}

/// The outcome of one enumeration pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumerationResult {
    /// Earliest timestamp to re-read per log; `None` means from the
    /// beginning of time.
    pub next_timestamps: BTreeMap<LogId, Option<DateTime<Utc>>>,
    /// Largest backlog among skipped data logs. The `SHARD_IS_REBUILT`
    /// marker must be delayed past this duration so that readers keep
    /// counting the shard as recovering for f-majority purposes.
    pub max_backlog: Option<Duration>,
    pub internal_skipped: u32,
    pub data_skipped: u32,
}

/// Enumerates the logs to rebuild for one shard.
#[derive(Debug, Clone)]
pub struct LogEnumerator {
    shard: ShardIndex,
    num_shards: ShardIndex,
    logs: LogsConfig,
    settings: RebuildingSettings,
    /// Lower bound from a time-ranged rebuild, if any.
    min_timestamp: Option<DateTime<Utc>>,
    retry_backoff_initial: Duration,
    retry_backoff_cap: Duration,
}

impl LogEnumerator {
    pub fn new(
        shard: ShardIndex,
        num_shards: ShardIndex,
        logs: LogsConfig,
        settings: RebuildingSettings,
    ) -> Self {
        Self {
            shard,
            num_shards,
            logs,
            settings,
            min_timestamp: None,
            // Retries never come closer than ten seconds apart.
            retry_backoff_initial: Duration::from_secs(10),
            retry_backoff_cap: Duration::from_secs(10),
        }
    }

    pub fn min_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.min_timestamp = Some(ts);
        self
    }

    /// Shrink the storage-task retry backoff (tests).
    pub fn retry_backoff(mut self, initial: Duration, cap: Duration) -> Self {
        self.retry_backoff_initial = initial;
        self.retry_backoff_cap = cap;
        self
    }

    /// Run to completion, retrying the metadata-log storage task forever.
    pub async fn enumerate(self, storage: Arc<dyn MetadataLogStorage>) -> EnumerationResult {
        let now = Utc::now();
        let mut result = EnumerationResult::default();

        for (log_id, attrs) in self.logs.iter() {
            if attrs.internal && !self.settings.rebuild_internal_logs {
                result.internal_skipped += 1;
                continue;
            }

            if self.settings.disable_data_log_rebuilding && !attrs.internal {
                if let Some(backlog) = attrs.backlog {
                    // Skipped, but the shard may not report rebuilt until the
                    // longest-lived skipped log has aged out.
                    if result.max_backlog.map_or(true, |b| backlog > b) {
                        result.max_backlog = Some(backlog);
                    }
                    result.data_skipped += 1;
                    continue;
                }
            }

            // Aim just past the retained range so the first read batch finds
            // records instead of stopping at the first trim point.
            let mut next_ts = attrs
                .backlog
                .and_then(|b| chrono::Duration::from_std(b).ok())
                .map(|b| now - b);
            match (next_ts, self.min_timestamp) {
                (Some(ts), Some(min)) if min > ts => next_ts = Some(min),
                (None, Some(min)) => next_ts = Some(min),
                _ => {}
            }

            if !self.settings.use_legacy_log_to_shard_mapping_in_rebuilding
                || LogToShardMapping::Legacy.shard_for(log_id, self.num_shards) == self.shard
            {
                result.next_timestamps.insert(log_id, next_ts);
            }
        }

        info!(
            shard = self.shard,
            internal_skipped = result.internal_skipped,
            data_skipped = result.data_skipped,
            queued = result.next_timestamps.len(),
            "log enumeration finished configured logs"
        );

        if self.settings.rebuild_metadata_logs {
            let metadata_logs = self.enumerate_metadata_logs(storage).await;
            for log_id in metadata_logs {
                result.next_timestamps.insert(log_id, self.min_timestamp);
            }
        }
        result
    }

    /// Run on the shard's worker; the receiver fires exactly once.
    ///
    /// Routing through the pool keeps all work for one shard on one worker,
    /// so an enumeration never runs concurrently with other operations on
    /// the same shard.
    pub fn spawn(
        self,
        pool: &WorkerPool,
        storage: Arc<dyn MetadataLogStorage>,
    ) -> oneshot::Receiver<EnumerationResult> {
        let (tx, rx) = oneshot::channel();
        let shard = self.shard;
        let _ = pool.post(shard, async move {
            let _ = tx.send(self.enumerate(storage).await);
        });
        rx
    }

    async fn enumerate_metadata_logs(&self, storage: Arc<dyn MetadataLogStorage>) -> Vec<LogId> {
        let mut backoff = self.retry_backoff_initial;
        loop {
            match storage.enumerate_metadata_logs(self.shard).await {
                Ok(logs) => return logs,
                Err(err) => {
                    warn!(
                        shard = self.shard,
                        error = %err,
                        "metadata log enumeration failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.retry_backoff_cap);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocationScope;
    use crate::config::LogAttributes;
    use crate::error::StrandError;
    use crate::replication::ReplicationProperty;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyStorage {
        failures_left: AtomicU32,
        logs: Vec<LogId>,
    }

    #[async_trait]
    impl MetadataLogStorage for FlakyStorage {
        async fn enumerate_metadata_logs(&self, _shard: ShardIndex) -> Result<Vec<LogId>> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StrandError::StorageTaskDropped);
            }
            Ok(self.logs.clone())
        }
    }

    fn logs_config() -> LogsConfig {
        let rp = || ReplicationProperty::with_scope_factor(LocationScope::Rack, 2);
        let mut logs = LogsConfig::new();
        logs.insert(LogId(1), LogAttributes::new(rp()));
        logs.insert(
            LogId(2),
            LogAttributes::new(rp()).backlog(Duration::from_secs(3600)),
        );
        logs.insert(
            LogId(3),
            LogAttributes::new(rp()).backlog(Duration::from_secs(7200)),
        );
        logs.insert(LogId(4), LogAttributes::new(rp()).internal());
        logs
    }

    fn settings() -> RebuildingSettings {
        RebuildingSettings {
            use_legacy_log_to_shard_mapping_in_rebuilding: false,
            rebuild_metadata_logs: false,
            ..Default::default()
        }
    }

    fn storage(failures: u32) -> Arc<FlakyStorage> {
        Arc::new(FlakyStorage {
            failures_left: AtomicU32::new(failures),
            logs: vec![LogId(900), LogId(901)],
        })
    }

    #[tokio::test]
    async fn test_internal_logs_skipped_by_default() {
        let enumerator = LogEnumerator::new(0, 1, logs_config(), settings());
        let result = enumerator.enumerate(storage(0)).await;
        assert_eq!(result.internal_skipped, 1);
        assert!(!result.next_timestamps.contains_key(&LogId(4)));
        assert_eq!(result.next_timestamps.len(), 3);
        // Infinite retention reads from the beginning of time.
        assert_eq!(result.next_timestamps[&LogId(1)], None);
        assert!(result.next_timestamps[&LogId(2)].is_some());
    }

    #[tokio::test]
    async fn test_disabled_data_rebuilding_tracks_max_backlog() {
        let mut s = settings();
        s.disable_data_log_rebuilding = true;
        let enumerator = LogEnumerator::new(0, 1, logs_config(), s);
        let result = enumerator.enumerate(storage(0)).await;

        assert_eq!(result.data_skipped, 2);
        assert_eq!(result.max_backlog, Some(Duration::from_secs(7200)));
        // The infinite-retention log is still enumerated.
        assert!(result.next_timestamps.contains_key(&LogId(1)));
        assert!(!result.next_timestamps.contains_key(&LogId(2)));
    }

    #[tokio::test]
    async fn test_legacy_mapping_filters_by_shard() {
        let mut s = settings();
        s.use_legacy_log_to_shard_mapping_in_rebuilding = true;
        let enumerator = LogEnumerator::new(1, 2, logs_config(), s);
        let result = enumerator.enumerate(storage(0)).await;
        // Only odd log ids map to shard 1 of 2.
        assert!(result.next_timestamps.contains_key(&LogId(1)));
        assert!(result.next_timestamps.contains_key(&LogId(3)));
        assert!(!result.next_timestamps.contains_key(&LogId(2)));
    }

    #[tokio::test]
    async fn test_metadata_logs_retry_until_success() {
        let mut s = settings();
        s.rebuild_metadata_logs = true;
        let enumerator = LogEnumerator::new(0, 1, logs_config(), s)
            .retry_backoff(Duration::from_millis(1), Duration::from_millis(4));
        let result = enumerator.enumerate(storage(3)).await;
        assert!(result.next_timestamps.contains_key(&LogId(900)));
        assert!(result.next_timestamps.contains_key(&LogId(901)));
        assert_eq!(result.next_timestamps[&LogId(900)], None);
    }

    #[tokio::test]
    async fn test_min_timestamp_floors_next_reads() {
        let min = Utc::now();
        let enumerator = LogEnumerator::new(0, 1, logs_config(), settings()).min_timestamp(min);
        let result = enumerator.enumerate(storage(0)).await;
        // Backlogged logs would start in the past, the floor wins.
        assert_eq!(result.next_timestamps[&LogId(2)], Some(min));
        assert_eq!(result.next_timestamps[&LogId(1)], Some(min));
    }

    #[tokio::test]
    async fn test_spawn_delivers_once_via_shard_worker() {
        let pool = WorkerPool::new(2);
        let enumerator = LogEnumerator::new(0, 1, logs_config(), settings());
        let rx = enumerator.spawn(&pool, storage(0));
        let result = rx.await.unwrap();
        assert_eq!(result.next_timestamps.len(), 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_same_shard_enumerations_run_in_order() {
        // Two enumerations for the same shard share a worker; the first
        // completes before the second starts.
        let pool = WorkerPool::new(4);
        let first = LogEnumerator::new(3, 4, logs_config(), settings()).spawn(&pool, storage(0));
        let second = LogEnumerator::new(3, 4, logs_config(), settings()).spawn(&pool, storage(0));
        assert!(first.await.is_ok());
        assert!(second.await.is_ok());
        pool.shutdown().await;
    }
}
