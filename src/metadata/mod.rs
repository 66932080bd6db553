//! Per-log epoch metadata: the durable record binding a nodeset and
//! replication property to a range of epochs.

mod epoch;

pub use epoch::{metadata_flags, EpochMetadata};
