//! Failure-domain locations.
//!
//! A node's location is an ordered path of scope labels from region down to
//! rack, written `region.datacenter.cluster.row.rack`. A shard belongs to
//! exactly one domain at each scope; a domain is identified by the prefix of
//! the location path up to that scope.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, StrandError};

/// Location scopes, coarsest first.
///
/// `Node` is the implicit finest scope (each node is its own domain) and
/// `Root` the implicit coarsest (the whole cluster); neither appears in a
/// location path.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LocationScope {
    Root,
    Region,
    DataCenter,
    Cluster,
    Row,
    Rack,
    Node,
}

impl LocationScope {
    /// Scopes that appear in a location path, coarsest first.
    pub const PATH_SCOPES: [LocationScope; 5] = [
        LocationScope::Region,
        LocationScope::DataCenter,
        LocationScope::Cluster,
        LocationScope::Row,
        LocationScope::Rack,
    ];

    /// True if `self` is strictly coarser than `other`.
    pub fn is_coarser_than(&self, other: LocationScope) -> bool {
        self < &other
    }

    /// Number of path labels covered by a domain at this scope.
    fn path_depth(&self) -> usize {
        match self {
            LocationScope::Root => 0,
            LocationScope::Region => 1,
            LocationScope::DataCenter => 2,
            LocationScope::Cluster => 3,
            LocationScope::Row => 4,
            LocationScope::Rack | LocationScope::Node => 5,
        }
    }
}

impl fmt::Display for LocationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LocationScope::Root => "root",
            LocationScope::Region => "region",
            LocationScope::DataCenter => "datacenter",
            LocationScope::Cluster => "cluster",
            LocationScope::Row => "row",
            LocationScope::Rack => "rack",
            LocationScope::Node => "node",
        };
        f.write_str(name)
    }
}

/// A node's position in the failure-domain hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    labels: Vec<String>,
}

impl Location {
    /// Parse a dotted location path, e.g. `region0.datacenter1.01.a.a`.
    pub fn parse(path: &str) -> Result<Self> {
        let labels: Vec<String> = path.split('.').map(str::to_owned).collect();
        if labels.len() != LocationScope::PATH_SCOPES.len()
            || labels.iter().any(|l| l.is_empty())
        {
            return Err(StrandError::InvalidLocation(path.to_owned()));
        }
        Ok(Self { labels })
    }

    /// The domain this location belongs to at `scope`: the path prefix up to
    /// and including that scope's label.
    ///
    /// At `Rack` (and `Node`) this is the full path; at `Root` it is empty,
    /// placing every node in one domain.
    pub fn domain(&self, scope: LocationScope) -> String {
        self.labels[..scope.path_depth()].join(".")
    }

    /// Whether two locations share a domain at `scope`.
    pub fn shares_domain(&self, other: &Location, scope: LocationScope) -> bool {
        let depth = scope.path_depth();
        self.labels[..depth] == other.labels[..depth]
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.labels.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let loc = Location::parse("region0.datacenter1.01.a.a").unwrap();
        assert_eq!(loc.to_string(), "region0.datacenter1.01.a.a");
    }

    #[test]
    fn test_parse_rejects_short_and_empty() {
        assert!(Location::parse("region0.dc1").is_err());
        assert!(Location::parse("").is_err());
        assert!(Location::parse("a..c.d.e").is_err());
    }

    #[test]
    fn test_domain_prefixes() {
        let loc = Location::parse("region0.datacenter1.01.a.b").unwrap();
        assert_eq!(loc.domain(LocationScope::Region), "region0");
        assert_eq!(loc.domain(LocationScope::DataCenter), "region0.datacenter1");
        assert_eq!(loc.domain(LocationScope::Rack), "region0.datacenter1.01.a.b");
        assert_eq!(loc.domain(LocationScope::Root), "");
    }

    #[test]
    fn test_shares_domain() {
        let a = Location::parse("region0.datacenter1.01.a.a").unwrap();
        let b = Location::parse("region0.datacenter1.01.a.b").unwrap();
        assert!(a.shares_domain(&b, LocationScope::Row));
        assert!(a.shares_domain(&b, LocationScope::Region));
        assert!(!a.shares_domain(&b, LocationScope::Rack));
    }

    #[test]
    fn test_scope_ordering() {
        assert!(LocationScope::Region.is_coarser_than(LocationScope::Rack));
        assert!(LocationScope::Rack.is_coarser_than(LocationScope::Node));
        assert!(!LocationScope::Node.is_coarser_than(LocationScope::Rack));
    }
}
