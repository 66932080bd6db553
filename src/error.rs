//! Error types for the strand control plane.
//!
//! This module provides a unified error type [`StrandError`] for all strand
//! operations, along with a convenient [`Result`] type alias.
//!
//! Placement infeasibility is *not* an error: selectors report it through
//! [`crate::placement::Decision::Failed`]. Errors here are for malformed
//! inputs, event-log transport failures, and configuration problems.

use std::io;
use thiserror::Error;

use crate::types::{LogId, NodeIndex, ShardId};

/// Main error type for strand operations.
#[derive(Error, Debug)]
pub enum StrandError {
    // Configuration errors
    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Unknown setting: {0}")]
    UnknownSetting(String),

    #[error("Invalid location path: {0}")]
    InvalidLocation(String),

    #[error("Invalid replication property: {0}")]
    InvalidReplication(String),

    // Metadata errors
    #[error("Log not found: {0}")]
    LogNotFound(LogId),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeIndex),

    #[error("Shard not found: {0}")]
    ShardNotFound(ShardId),

    #[error("Invalid storage set: {0}")]
    InvalidStorageSet(String),

    // Event-log errors
    #[error("Event log append failed: {0}")]
    EventLogAppend(String),

    #[error("Event log version mismatch: expected {expected}, found {found}")]
    ConditionalVersionMismatch { expected: u64, found: u64 },

    #[error("Event log record malformed: {0}")]
    MalformedRecord(String),

    #[error("Unsupported delta version: {0}")]
    UnsupportedDeltaVersion(u16),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Not connected to the event log")]
    NotConnected,

    // Storage-task errors
    #[error("Storage task failed: {0}")]
    StorageTask(String),

    #[error("Storage task dropped")]
    StorageTaskDropped,

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrandError {
    /// Check if the operation that produced this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StrandError::Timeout(_)
                | StrandError::NotConnected
                | StrandError::ConditionalVersionMismatch { .. }
                | StrandError::StorageTask(_)
                | StrandError::StorageTaskDropped
        )
    }
}

impl From<bincode::Error> for StrandError {
    fn from(e: bincode::Error) -> Self {
        StrandError::Serialization(e.to_string())
    }
}

/// Result type alias for strand operations.
pub type Result<T> = std::result::Result<T, StrandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StrandError::Timeout(std::time::Duration::from_secs(1)).is_retryable());
        assert!(StrandError::ConditionalVersionMismatch { expected: 1, found: 2 }.is_retryable());
        assert!(!StrandError::LogNotFound(LogId(1)).is_retryable());
        assert!(!StrandError::UnknownSetting("nope".into()).is_retryable());
    }
}
