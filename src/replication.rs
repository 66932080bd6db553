//! Replication properties: per-scope replica requirements.
//!
//! A replication property maps location scopes to required replica counts.
//! Counts are monotone: a coarser scope never requires more replicas than a
//! finer one, and the count at `Node` scope is the total replication factor.
//! `{rack: 2, node: 3}` reads "3 copies, spread over at least 2 racks".

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::cluster::LocationScope;
use crate::error::{Result, StrandError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationProperty {
    // Keyed coarse-to-fine; LocationScope's derive order matches.
    counts: BTreeMap<LocationScope, usize>,
}

impl ReplicationProperty {
    /// Plain node-scope replication: `factor` copies on distinct nodes.
    pub fn with_factor(factor: usize) -> Self {
        let mut counts = BTreeMap::new();
        counts.insert(LocationScope::Node, factor.max(1));
        Self { counts }
    }

    /// Synchronous cross-domain replication: `factor` copies spanning at
    /// least two distinct domains at `scope` (one when `factor` is 1).
    pub fn with_scope_factor(scope: LocationScope, factor: usize) -> Self {
        let factor = factor.max(1);
        let mut counts = BTreeMap::new();
        counts.insert(scope, factor.min(2));
        counts.insert(LocationScope::Node, factor);
        Self { counts }
    }

    /// Build from explicit `(scope, count)` pairs, validating monotonicity.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (LocationScope, usize)>,
    ) -> Result<Self> {
        let counts: BTreeMap<LocationScope, usize> = entries.into_iter().collect();
        if counts.is_empty() {
            return Err(StrandError::InvalidReplication("no scopes given".into()));
        }
        let mut prev = 0usize;
        for (scope, &count) in &counts {
            if count == 0 {
                return Err(StrandError::InvalidReplication(format!(
                    "zero replicas at scope {scope}"
                )));
            }
            if count < prev {
                return Err(StrandError::InvalidReplication(format!(
                    "count at {scope} is below a coarser scope's count"
                )));
            }
            prev = count;
        }
        Ok(Self { counts })
    }

    /// Total replication factor: the count at the finest constrained scope.
    pub fn replication_factor(&self) -> usize {
        self.counts.values().copied().max().unwrap_or(1)
    }

    /// Required number of distinct domains at `scope` (1 when unconstrained
    /// at that scope and everything coarser).
    pub fn at(&self, scope: LocationScope) -> usize {
        self.counts
            .range(..=scope)
            .map(|(_, &c)| c)
            .max()
            .unwrap_or(1)
    }

    /// Explicitly constrained scopes, coarse to fine.
    pub fn entries(&self) -> impl Iterator<Item = (LocationScope, usize)> + '_ {
        self.counts.iter().map(|(&s, &c)| (s, c))
    }

    /// The finest constrained scope above `Node`, if any. This is the scope
    /// the selectors partition the cluster at.
    pub fn placement_scope(&self) -> Option<(LocationScope, usize)> {
        self.counts
            .range(..LocationScope::Node)
            .next_back()
            .map(|(&s, &c)| (s, c))
    }
}

impl fmt::Display for ReplicationProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (scope, count) in &self.counts {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{scope}:{count}")?;
            first = false;
        }
        Ok(())
    }
}
