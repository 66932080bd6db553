//! Rebuilding supervision: trigger bookkeeping, the leader-elected
//! supervisor control loop, and per-shard log enumeration.

mod enumerator;
mod supervisor;
mod trigger;

pub use enumerator::{EnumerationResult, LogEnumerator, MetadataLogStorage};
pub use supervisor::{RebuildingSupervisor, SupervisorEvent, SupervisorHandle};
pub use trigger::{RebuildingTrigger, TriggerQueue};
