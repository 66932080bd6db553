//! strand - placement and recovery control plane for a distributed
//! append-only log store.
//!
//! Log records are replicated across a cluster of storage nodes grouped
//! into failure domains (racks, datacenters, regions). This crate houses
//! the two control-plane subsystems that decide *where* data may live and
//! *when* it must be reconstructed:
//!
//! - **Nodeset selection**: deterministic, weight-aware choice of the
//!   shards eligible to hold a log's records, honouring failure-domain
//!   diversity, capacity weights, exclusion filters, and (for the
//!   consistent-hashing variant) stability under cluster churn.
//! - **Rebuilding supervision**: a leader-elected control loop that turns
//!   failure-detector signals and local shard failures into
//!   `SHARD_NEEDS_REBUILD` deltas on the replicated event log, with grace
//!   debouncing, concurrency thresholds, and a trigger-queue throttle.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         strand                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Placement: domain tree | weight-aware | ring | cross-domain│
//! ├─────────────────────────────────────────────────────────────┤
//! │  Metadata: epoch metadata | config digests                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Rebuilding: supervisor | trigger queue | log enumerator    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Event log: wire codec | client | rebuilding set            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The record storage engine, the gossip failure detector, the event-log
//! state machine, and the RPC layer are external collaborators reached
//! through traits ([`rebuilding::MetadataLogStorage`],
//! [`eventlog::EventLogStore`]) and channels.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use strand::admin::RuntimeOverrides;
//! use strand::cluster::ClusterViewBuilder;
//! use strand::config::Settings;
//! use strand::eventlog::InMemoryEventLog;
//! use strand::rebuilding::RebuildingSupervisor;
//!
//! #[tokio::main]
//! async fn main() -> strand::Result<()> {
//!     let view = ClusterViewBuilder::new("demo")
//!         .add_nodes(5, 2, Some("region0.datacenter1.01.a.a"), 5)?
//!         .build();
//!     let log = InMemoryEventLog::new();
//!     let (supervisor, _handle) = RebuildingSupervisor::new(
//!         0,
//!         view,
//!         Settings::default(),
//!         Arc::new(RuntimeOverrides::new()),
//!         Arc::new(log.handle(0)),
//!     );
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
//!     supervisor.run(shutdown_rx).await;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod cluster;
pub mod config;
pub mod error;
pub mod eventlog;
pub mod hashing;
pub mod metadata;
pub mod placement;
pub mod rebuilding;
pub mod replication;
pub mod stats;
pub mod types;
pub mod worker;

// Re-exports
pub use error::{Result, StrandError};
pub use types::{Epoch, LogId, Lsn, NodeIndex, ShardId, ShardIndex, StorageSet};
