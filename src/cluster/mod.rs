//! Cluster model: configuration snapshots, failure-domain locations, and
//! node liveness.

mod liveness;
mod location;
mod view;

pub use liveness::{LivenessRecord, LivenessTracker, LivenessTransition, NodeState};
pub use location::{Location, LocationScope};
pub use view::{ClusterView, ClusterViewBuilder, NodeDescriptor, StorageState};
