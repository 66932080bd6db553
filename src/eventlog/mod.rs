//! The replicated control log: wire format, client, and the materialized
//! rebuilding state derived from its tail.

mod client;
mod rebuilding_set;
mod record;

pub use client::{
    EventLogClient, EventLogEntry, EventLogStore, InMemoryEventLog, InMemoryEventLogHandle,
};
pub use rebuilding_set::{RebuildingSet, ShardRebuildingState};
pub use record::{
    record_flags, DeltaHeader, EventRecord, RebuildReason, TimeRange, TimeRanges,
    DELTA_HEADER_SIZE, DELTA_VERSION,
};
