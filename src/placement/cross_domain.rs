//! Cross-domain nodeset selection: equal shares per failure domain.
//!
//! Every selected domain contributes the same number of shards. With
//! unequal domain sizes (typically after exclusions) the selector picks the
//! `k domains × n shards` configuration whose total lands closest to the
//! requested size while still meeting the replication property, preferring
//! the larger total and then the larger domain count on ties. Without a
//! location-scoped replication requirement it degrades to a flat seeded
//! draw of exactly the requested size.

use crate::cluster::ClusterView;
use crate::config::LogAttributes;
use crate::error::{Result, StrandError};
use crate::metadata::EpochMetadata;
use crate::placement::{
    draw_seed, finish, weighted_sample, Decision, DomainTree, LogToShardMapping,
    NodesetSelector, SelectorOptions,
};
use crate::replication::ReplicationProperty;
use crate::types::{LogId, StorageSet};

const SELECTOR_SALT: u64 = 0x63_72_6f_73_73; // "cross"

#[derive(Debug, Clone)]
pub struct CrossDomainSelector {
    mapping: LogToShardMapping,
}

/// A candidate configuration: `domains` domains of `per_domain` shards each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Shares {
    per_domain: usize,
    domains: usize,
}

impl Shares {
    fn total(&self) -> usize {
        self.per_domain * self.domains
    }
}

enum CrossDomainPlan {
    /// Seeded uniform draw of exactly `target` shards.
    Flat { target: usize },
    /// Equal shares from every domain at `scope` that can supply them.
    Domains {
        scope: crate::cluster::LocationScope,
        shares: Shares,
    },
}

impl CrossDomainSelector {
    pub fn new(mapping: LogToShardMapping) -> Self {
        Self { mapping }
    }

    /// Pick the best equal-share configuration for domain supplies
    /// `counts`, a requested total `target`, and the replication property.
    fn best_shares(
        counts: &[usize],
        target: usize,
        replication: &ReplicationProperty,
        r_scope: usize,
    ) -> Option<Shares> {
        let r_node = replication.replication_factor();
        let max_supply = counts.iter().copied().max().unwrap_or(0);
        let mut best: Option<Shares> = None;
        for per_domain in 1..=max_supply {
            let domains = counts.iter().filter(|&&c| c >= per_domain).count();
            if domains < r_scope {
                continue;
            }
            let candidate = Shares {
                per_domain,
                domains,
            };
            if candidate.total() < r_node {
                continue;
            }
            best = Some(match best {
                None => candidate,
                Some(current) => {
                    let d_new = candidate.total().abs_diff(target);
                    let d_cur = current.total().abs_diff(target);
                    if (d_new, std::cmp::Reverse((candidate.total(), candidate.domains)))
                        < (d_cur, std::cmp::Reverse((current.total(), current.domains)))
                    {
                        candidate
                    } else {
                        current
                    }
                }
            });
        }
        best
    }

    fn plan(
        &self,
        log_id: LogId,
        attrs: &LogAttributes,
        view: &ClusterView,
        options: &SelectorOptions,
    ) -> Option<(DomainTree, CrossDomainPlan)> {
        let tree = DomainTree::build(view, log_id, self.mapping, options);
        let replication = &attrs.replication;
        let r_node = replication.replication_factor();

        match replication.placement_scope() {
            None => {
                // Flat draw of exactly the requested size; unlike the
                // domain path the target is not shrunk to the supply.
                let target = attrs.nodeset_size.unwrap_or(tree.len()).max(r_node);
                if tree.len() < target {
                    return None;
                }
                Some((tree, CrossDomainPlan::Flat { target }))
            }
            Some((scope, r_scope)) => {
                let counts: Vec<usize> = tree
                    .domains_at(scope)
                    .iter()
                    .map(|d| d.shards.len())
                    .collect();
                let target = attrs.nodeset_size.unwrap_or(tree.len());
                let shares = Self::best_shares(&counts, target, replication, r_scope)?;
                Some((tree, CrossDomainPlan::Domains { scope, shares }))
            }
        }
    }

    fn compute(
        &self,
        log_id: LogId,
        attrs: &LogAttributes,
        view: &ClusterView,
        options: &SelectorOptions,
    ) -> Option<StorageSet> {
        let (tree, plan) = self.plan(log_id, attrs, view, options)?;
        match plan {
            CrossDomainPlan::Flat { target } => {
                Some(tree.weighted_draw(target, draw_seed(log_id, "", SELECTOR_SALT)))
            }
            CrossDomainPlan::Domains { scope, shares } => {
                let mut set = Vec::with_capacity(shares.total());
                for domain in tree.domains_at(scope) {
                    if domain.shards.len() < shares.per_domain {
                        continue;
                    }
                    let seed = draw_seed(log_id, &domain.path, SELECTOR_SALT);
                    set.extend(weighted_sample(&domain.shards, shares.per_domain, seed));
                }
                Some(set)
            }
        }
    }
}

impl NodesetSelector for CrossDomainSelector {
    fn get_storage_set(
        &self,
        log_id: LogId,
        attrs: &LogAttributes,
        view: &ClusterView,
        prev: Option<&EpochMetadata>,
        options: &SelectorOptions,
    ) -> Result<(Decision, Option<StorageSet>)> {
        match self.compute(log_id, attrs, view, options) {
            Some(set) => Ok(finish(set, log_id, attrs, view, prev)),
            None => Ok((Decision::Failed, None)),
        }
    }

    fn get_storage_set_size(
        &self,
        log_id: LogId,
        attrs: &LogAttributes,
        view: &ClusterView,
        options: &SelectorOptions,
    ) -> Result<usize> {
        let infeasible =
            || StrandError::InvalidStorageSet(format!("no feasible nodeset for {log_id}"));
        let (_, plan) = self
            .plan(log_id, attrs, view, options)
            .ok_or_else(infeasible)?;
        Ok(match plan {
            CrossDomainPlan::Flat { target } => target,
            CrossDomainPlan::Domains { shares, .. } => shares.total(),
        })
    }
}
