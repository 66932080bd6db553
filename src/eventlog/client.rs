//! Event-log access.
//!
//! The replicated state machine behind the event log lives outside this
//! crate; [`EventLogStore`] is the seam. [`InMemoryEventLog`] is the local
//! backend used by tests and single-process deployments: its per-node
//! handles can be disconnected to model network partitions (appends and
//! tail reads from a disconnected handle time out, and reconnection replays
//! the backlog in order, keeping tail views prefix-consistent).
//!
//! [`EventLogClient`] layers the wire codec and a jittered exponential
//! retry policy on top of a store handle.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::EventLogSettings;
use crate::error::{Result, StrandError};
use crate::eventlog::record::{DeltaHeader, EventRecord};
use crate::types::{Lsn, NodeIndex};

/// One appended delta.
#[derive(Debug, Clone)]
pub struct EventLogEntry {
    pub lsn: Lsn,
    pub payload: Arc<Vec<u8>>,
}

/// Client-side view of the replicated event log.
#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// Append a delta, optionally conditioned on the current log version.
    async fn append(&self, payload: Vec<u8>, conditional_version: Option<Lsn>) -> Result<Lsn>;

    /// The LSN of the last committed delta.
    async fn tail_lsn(&self) -> Result<Lsn>;

    /// Read committed deltas with `lsn > from`, in order.
    async fn read_from(&self, from: Lsn) -> Result<Vec<EventLogEntry>>;

    /// Subscribe to the committed tail. Entries arrive in LSN order,
    /// starting from the beginning of the log.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<EventLogEntry>;
}

struct Subscriber {
    node: NodeIndex,
    cursor: usize,
    tx: mpsc::UnboundedSender<EventLogEntry>,
}

#[derive(Default)]
struct Core {
    entries: Vec<EventLogEntry>,
    version: Lsn,
    subscribers: Vec<Subscriber>,
    disconnected: std::collections::HashSet<NodeIndex>,
}

impl Core {
    fn flush(&mut self) {
        let entries = &self.entries;
        let disconnected = &self.disconnected;
        self.subscribers.retain_mut(|sub| {
            if disconnected.contains(&sub.node) {
                return true;
            }
            while sub.cursor < entries.len() {
                if sub.tx.send(entries[sub.cursor].clone()).is_err() {
                    return false;
                }
                sub.cursor += 1;
            }
            true
        });
    }
}

/// Shared in-memory event log with per-node handles.
#[derive(Clone, Default)]
pub struct InMemoryEventLog {
    core: Arc<Mutex<Core>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store handle owned by `node`.
    pub fn handle(&self, node: NodeIndex) -> InMemoryEventLogHandle {
        InMemoryEventLogHandle {
            core: Arc::clone(&self.core),
            node,
        }
    }

    /// Connect or disconnect a node. Disconnected nodes cannot append or
    /// read; on reconnection their subscribers catch up from where they
    /// stopped.
    pub fn set_connected(&self, node: NodeIndex, connected: bool) {
        let mut core = self.core.lock();
        if connected {
            core.disconnected.remove(&node);
            core.flush();
        } else {
            core.disconnected.insert(node);
        }
    }

    /// Current tail version, bypassing connectivity (test observability).
    pub fn version(&self) -> Lsn {
        self.core.lock().version
    }

    /// All committed entries (test observability).
    pub fn entries(&self) -> Vec<EventLogEntry> {
        self.core.lock().entries.clone()
    }
}

/// A node's handle onto the shared in-memory log.
#[derive(Clone)]
pub struct InMemoryEventLogHandle {
    core: Arc<Mutex<Core>>,
    node: NodeIndex,
}

/// Simulated round-trip delay before a partitioned request times out.
const PARTITION_TIMEOUT: Duration = Duration::from_millis(20);

impl InMemoryEventLogHandle {
    fn is_connected(&self) -> bool {
        !self.core.lock().disconnected.contains(&self.node)
    }
}

#[async_trait]
impl EventLogStore for InMemoryEventLogHandle {
    async fn append(&self, payload: Vec<u8>, conditional_version: Option<Lsn>) -> Result<Lsn> {
        if !self.is_connected() {
            tokio::time::sleep(PARTITION_TIMEOUT).await;
            return Err(StrandError::Timeout(PARTITION_TIMEOUT));
        }
        let mut core = self.core.lock();
        if let Some(expected) = conditional_version {
            if expected != core.version {
                return Err(StrandError::ConditionalVersionMismatch {
                    expected,
                    found: core.version,
                });
            }
        }
        let lsn = core.version + 1;
        core.version = lsn;
        core.entries.push(EventLogEntry {
            lsn,
            payload: Arc::new(payload),
        });
        core.flush();
        Ok(lsn)
    }

    async fn tail_lsn(&self) -> Result<Lsn> {
        if !self.is_connected() {
            tokio::time::sleep(PARTITION_TIMEOUT).await;
            return Err(StrandError::Timeout(PARTITION_TIMEOUT));
        }
        Ok(self.core.lock().version)
    }

    async fn read_from(&self, from: Lsn) -> Result<Vec<EventLogEntry>> {
        if !self.is_connected() {
            tokio::time::sleep(PARTITION_TIMEOUT).await;
            return Err(StrandError::Timeout(PARTITION_TIMEOUT));
        }
        let core = self.core.lock();
        Ok(core
            .entries
            .iter()
            .filter(|e| e.lsn > from)
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<EventLogEntry> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut core = self.core.lock();
        core.subscribers.push(Subscriber {
            node: self.node,
            cursor: 0,
            tx,
        });
        core.flush();
        rx
    }
}

/// Event-log client: codec plus retry policy over a store handle.
pub struct EventLogClient {
    store: Arc<dyn EventLogStore>,
    settings: EventLogSettings,
}

impl EventLogClient {
    pub fn new(store: Arc<dyn EventLogStore>, settings: EventLogSettings) -> Self {
        Self { store, settings }
    }

    pub fn store(&self) -> &Arc<dyn EventLogStore> {
        &self.store
    }

    /// Append one record, retrying transient failures with jittered
    /// exponential backoff.
    ///
    /// Conditional-version mismatches are returned immediately: the caller
    /// must refresh its view of the log before retrying.
    pub async fn append_record(
        &self,
        record: &EventRecord,
        conditional_version: Option<Lsn>,
    ) -> Result<Lsn> {
        let payload = record.encode();
        let mut delay = self.settings.append_backoff_initial;
        let mut last_err = StrandError::EventLogAppend("no attempts made".into());
        for attempt in 0..self.settings.append_max_attempts {
            let result = tokio::time::timeout(
                self.settings.append_timeout,
                self.store.append(payload.clone(), conditional_version),
            )
            .await
            .unwrap_or(Err(StrandError::Timeout(self.settings.append_timeout)));
            match result {
                Ok(lsn) => return Ok(lsn),
                Err(err @ StrandError::ConditionalVersionMismatch { .. }) => return Err(err),
                Err(err) if err.is_retryable() => {
                    debug!(attempt, error = %err, "event log append failed, backing off");
                    last_err = err;
                    tokio::time::sleep(jittered(delay)).await;
                    delay = (delay * 2).min(self.settings.append_backoff_max);
                }
                Err(err) => {
                    warn!(error = %err, "event log append failed");
                    return Err(err);
                }
            }
        }
        Err(last_err)
    }

    pub async fn tail_lsn(&self) -> Result<Lsn> {
        self.store.tail_lsn().await
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EventLogEntry> {
        self.store.subscribe()
    }

    /// Decode one entry's payload.
    pub fn decode(entry: &EventLogEntry) -> Result<(DeltaHeader, EventRecord)> {
        EventRecord::decode(&entry.payload)
    }
}

fn jittered(delay: Duration) -> Duration {
    let factor = 0.5 + rand::thread_rng().gen::<f64>() * 0.5;
    delay.mul_f64(factor)
}
