//! Nodeset selection.
//!
//! Selectors are pure functions of `(log, cluster view, options)`: given a
//! log's replication requirements they deterministically choose the subset
//! of shards (the nodeset) that may hold the log's records. Three variants
//! share one capability and one factory:
//!
//! - [`SelectorType::WeightAware`] / `WeightAwareV2`: weighted uniform
//!   placement with failure-domain diversity,
//! - [`SelectorType::ConsistentHashing`] / `ConsistentHashingV2`: ring
//!   placement that minimizes churn on membership change,
//! - [`SelectorType::CrossDomain`]: equal shares per failure domain.
//!
//! All randomness is seeded from `(log id, domain path, selector salt)`, so
//! identical inputs produce identical nodesets across processes.

mod consistent_hash;
mod cross_domain;
mod domain_tree;
mod weight_aware;

pub use consistent_hash::ConsistentHashingSelector;
pub use cross_domain::CrossDomainSelector;
pub use domain_tree::{Domain, DomainTree};
pub use weight_aware::WeightAwareSelector;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::cluster::ClusterView;
use crate::config::LogAttributes;
use crate::error::Result;
use crate::hashing;
use crate::metadata::EpochMetadata;
use crate::replication::ReplicationProperty;
use crate::types::{LogId, NodeIndex, ShardId, ShardIndex, StorageSet};

/// Outcome of a selector invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Current epoch metadata still satisfies policy; nothing to publish.
    Keep,
    /// A new nodeset was produced; the caller must publish epoch metadata.
    NeedsChange,
    /// Constraints are unsatisfiable with the current configuration.
    Failed,
}

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct SelectorOptions {
    /// Nodes that must not appear in the result.
    pub exclude_nodes: BTreeSet<NodeIndex>,
}

/// Which selector to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorType {
    WeightAware,
    WeightAwareV2,
    ConsistentHashing,
    ConsistentHashingV2,
    CrossDomain,
}

/// The selector capability.
pub trait NodesetSelector: Send + Sync {
    /// Compute the storage set for `log_id`.
    ///
    /// Returns `(Keep, None)` when `prev` already matches the fresh
    /// computation, `(NeedsChange, Some(set))` with a sorted, deduplicated
    /// nodeset otherwise, and `(Failed, None)` when the constraints cannot
    /// be met.
    fn get_storage_set(
        &self,
        log_id: LogId,
        attrs: &LogAttributes,
        view: &ClusterView,
        prev: Option<&EpochMetadata>,
        options: &SelectorOptions,
    ) -> Result<(Decision, Option<StorageSet>)>;

    /// Predict the exact size a `NeedsChange` result would have.
    fn get_storage_set_size(
        &self,
        log_id: LogId,
        attrs: &LogAttributes,
        view: &ClusterView,
        options: &SelectorOptions,
    ) -> Result<usize>;
}

/// Map a selector type to its implementation.
pub fn create_selector(
    kind: SelectorType,
    mapping: LogToShardMapping,
) -> Box<dyn NodesetSelector> {
    match kind {
        SelectorType::WeightAware => Box::new(WeightAwareSelector::new(false, mapping)),
        SelectorType::WeightAwareV2 => Box::new(WeightAwareSelector::new(true, mapping)),
        SelectorType::ConsistentHashing => {
            Box::new(ConsistentHashingSelector::new(false, mapping))
        }
        SelectorType::ConsistentHashingV2 => {
            Box::new(ConsistentHashingSelector::new(true, mapping))
        }
        SelectorType::CrossDomain => Box::new(CrossDomainSelector::new(mapping)),
    }
}

/// Strategy mapping a log to the one shard it occupies on each node.
///
/// Both mappings are honoured during the migration away from the modulo
/// scheme; the flag `use_legacy_log_to_shard_mapping_in_rebuilding` picks
/// one explicitly rather than changing defaults silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogToShardMapping {
    /// `log_id % num_shards`.
    Legacy,
    /// `mix64(log_id) % num_shards`.
    Uniform,
}

impl LogToShardMapping {
    pub fn from_legacy_flag(use_legacy: bool) -> Self {
        if use_legacy {
            LogToShardMapping::Legacy
        } else {
            LogToShardMapping::Uniform
        }
    }

    pub fn shard_for(&self, log_id: LogId, num_shards: ShardIndex) -> ShardIndex {
        debug_assert!(num_shards > 0);
        let num = num_shards.max(1) as u64;
        match self {
            LogToShardMapping::Legacy => (log_id.0 % num) as ShardIndex,
            LogToShardMapping::Uniform => (hashing::mix64(log_id.0) % num) as ShardIndex,
        }
    }
}

/// An eligible shard with its placement weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EligibleShard {
    pub shard: ShardId,
    pub weight: f64,
}

/// Deterministic seed for a `(log, domain)` draw.
pub(crate) fn draw_seed(log_id: LogId, domain: &str, salt: u64) -> u64 {
    hashing::hash_chain(&[log_id.0, hashing::hash_bytes(domain.as_bytes()), salt])
}

/// Weighted sampling without replacement.
///
/// Deterministic for a given `(pool order, seed)`; the pool is in shard
/// order by construction, so identical inputs give identical draws.
pub(crate) fn weighted_sample(pool: &[EligibleShard], k: usize, seed: u64) -> Vec<ShardId> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut remaining: Vec<EligibleShard> = pool.to_vec();
    let mut picked = Vec::with_capacity(k.min(remaining.len()));
    while picked.len() < k && !remaining.is_empty() {
        let total: f64 = remaining.iter().map(|s| s.weight).sum();
        let chosen = if total <= 0.0 {
            rng.gen_range(0..remaining.len())
        } else {
            let mut x = rng.gen::<f64>() * total;
            let mut idx = remaining.len() - 1;
            for (i, s) in remaining.iter().enumerate() {
                if x < s.weight {
                    idx = i;
                    break;
                }
                x -= s.weight;
            }
            idx
        };
        picked.push(remaining.swap_remove(chosen).shard);
    }
    picked
}

/// Distribute `total` picks over domains.
///
/// Every domain starts at its minimum; the remainder goes out by largest
/// remainder proportional to domain weight, or (for equal-share rounding)
/// round-robin to the least-filled domain. Supply caps are always honoured;
/// callers guarantee `Σ minima <= total <= Σ caps`.
pub(crate) fn apportion(
    minima: &[usize],
    caps: &[usize],
    weights: &[f64],
    total: usize,
    equal_shares: bool,
) -> Vec<usize> {
    debug_assert_eq!(minima.len(), caps.len());
    let mut quotas: Vec<usize> = minima.to_vec();
    let assigned: usize = quotas.iter().sum();
    if assigned >= total {
        return quotas;
    }
    let mut remainder = total - assigned;

    if equal_shares {
        // Raise the least-filled domain first; ties go to the lower index.
        while remainder > 0 {
            let mut best: Option<usize> = None;
            for (i, &q) in quotas.iter().enumerate() {
                if q < caps[i] && best.map_or(true, |b| q < quotas[b]) {
                    best = Some(i);
                }
            }
            match best {
                Some(i) => {
                    quotas[i] += 1;
                    remainder -= 1;
                }
                None => break,
            }
        }
    } else {
        while remainder > 0 {
            let open: Vec<usize> = (0..quotas.len()).filter(|&i| quotas[i] < caps[i]).collect();
            if open.is_empty() {
                break;
            }
            let weight_total: f64 = open.iter().map(|&i| weights[i]).sum();
            let mut shares: Vec<(usize, usize, f64)> = open
                .iter()
                .map(|&i| {
                    let ideal = if weight_total > 0.0 {
                        remainder as f64 * weights[i] / weight_total
                    } else {
                        remainder as f64 / open.len() as f64
                    };
                    let headroom = caps[i] - quotas[i];
                    let whole = (ideal.floor() as usize).min(headroom);
                    (i, whole, ideal - whole as f64)
                })
                .collect();

            let granted: usize = shares.iter().map(|&(_, w, _)| w).sum();
            for &(i, w, _) in &shares {
                quotas[i] += w;
            }
            remainder -= granted;
            if remainder == 0 {
                break;
            }

            // Hand out the leftovers by largest fractional remainder.
            shares.sort_by(|a, b| {
                b.2.partial_cmp(&a.2)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.0.cmp(&b.0))
            });
            let mut progressed = false;
            for &(i, _, _) in &shares {
                if remainder == 0 {
                    break;
                }
                if quotas[i] < caps[i] {
                    quotas[i] += 1;
                    remainder -= 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }
    quotas
}

/// Shared quota planning for the weight-aware and consistent-hashing
/// selectors.
///
/// Returns `None` when the constraints are unsatisfiable, otherwise the
/// domains at the placement scope together with their per-domain quotas.
pub(crate) struct QuotaPlan {
    pub domains: Vec<Domain>,
    pub quotas: Vec<usize>,
    pub total: usize,
}

pub(crate) fn plan_quotas(
    tree: &DomainTree,
    requested: Option<usize>,
    replication: &ReplicationProperty,
    equal_shares: bool,
) -> Option<QuotaPlan> {
    let r_node = replication.replication_factor();
    let total_eligible = tree.len();
    if total_eligible < r_node {
        return None;
    }

    match replication.placement_scope() {
        None => {
            // Flat placement: one domain holding everything.
            let domain = tree.as_single_domain();
            let target = requested
                .unwrap_or(total_eligible)
                .max(r_node)
                .min(total_eligible);
            Some(QuotaPlan {
                domains: vec![domain],
                quotas: vec![target],
                total: target,
            })
        }
        Some((scope, r_scope)) => {
            let domains = tree.domains_at(scope);
            if domains.len() < r_scope {
                return None;
            }
            // Each domain must be able to host its share of a copyset that
            // concentrates in only `r_scope` domains.
            let min_per_domain = (r_node + r_scope - 1) / r_scope;
            let minima: Vec<usize> = domains
                .iter()
                .map(|d| d.shards.len().min(min_per_domain))
                .collect();
            let caps: Vec<usize> = domains.iter().map(|d| d.shards.len()).collect();
            let weights: Vec<f64> = domains.iter().map(|d| d.weight).collect();
            let base: usize = minima.iter().sum();

            let target = requested
                .unwrap_or(total_eligible)
                .max(base)
                .max(r_node)
                .min(total_eligible);
            let quotas = apportion(&minima, &caps, &weights, target, equal_shares);
            let total: usize = quotas.iter().sum();
            if total < r_node {
                return None;
            }
            Some(QuotaPlan {
                domains,
                quotas,
                total,
            })
        }
    }
}

/// Shared epilogue: sort, compare against previous metadata, decide.
pub(crate) fn finish(
    mut set: StorageSet,
    log_id: LogId,
    attrs: &LogAttributes,
    view: &ClusterView,
    prev: Option<&EpochMetadata>,
) -> (Decision, Option<StorageSet>) {
    set.sort_unstable();
    set.dedup();
    if !view.is_valid_storage_set(&set, &attrs.replication) {
        tracing::debug!(%log_id, "computed nodeset fails validation");
        return (Decision::Failed, None);
    }
    if let Some(prev) = prev {
        if prev.storage_set == set
            && prev
                .nodes_config_hash
                .map_or(true, |h| h == view.storage_config_hash())
        {
            return (Decision::Keep, None);
        }
    }
    (Decision::NeedsChange, Some(set))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: u16) -> Vec<EligibleShard> {
        (0..n)
            .map(|i| EligibleShard {
                shard: ShardId::new(i, 0),
                weight: 1.0,
            })
            .collect()
    }

    #[test]
    fn test_weighted_sample_deterministic() {
        let pool = pool(20);
        let a = weighted_sample(&pool, 5, 42);
        let b = weighted_sample(&pool, 5, 42);
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        let c = weighted_sample(&pool, 5, 43);
        assert_ne!(a, c);
    }

    #[test]
    fn test_weighted_sample_no_duplicates() {
        let pool = pool(10);
        let picked = weighted_sample(&pool, 10, 7);
        let mut sorted = picked.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 10);
    }

    #[test]
    fn test_weighted_sample_respects_weights() {
        // A zero-weight shard is only picked once everything else is taken.
        let mut pool = pool(3);
        pool[1].weight = 0.0;
        let picked = weighted_sample(&pool, 2, 1);
        assert!(!picked.contains(&ShardId::new(1, 0)));
    }

    #[test]
    fn test_apportion_weighted() {
        let quotas = apportion(&[1, 2, 2, 2, 2], &[1, 5, 2, 6, 5], &[1.0, 5.0, 2.0, 6.0, 5.0], 14, false);
        assert_eq!(quotas.iter().sum::<usize>(), 14);
        assert_eq!(quotas[0], 1);
        assert_eq!(quotas[2], 2);
        for &q in &quotas[1..] {
            assert!(q <= 6);
        }
    }

    #[test]
    fn test_apportion_equal_shares() {
        let quotas = apportion(&[1, 2, 2, 2, 2], &[1, 5, 2, 6, 5], &[1.0, 5.0, 2.0, 6.0, 5.0], 14, true);
        assert_eq!(quotas.iter().sum::<usize>(), 14);
        // Equal rounding keeps the unconstrained domains within one of each
        // other.
        let unconstrained = [quotas[1], quotas[3], quotas[4]];
        let max = unconstrained.iter().max().unwrap();
        let min = unconstrained.iter().min().unwrap();
        assert!(max - min <= 1);
    }

    #[test]
    fn test_apportion_minima_exceed_total() {
        let quotas = apportion(&[2, 2], &[3, 3], &[1.0, 1.0], 3, false);
        assert_eq!(quotas, vec![2, 2]);
    }

    #[test]
    fn test_log_to_shard_mappings() {
        assert_eq!(LogToShardMapping::Legacy.shard_for(LogId(7), 3), 1);
        let uniform = LogToShardMapping::Uniform.shard_for(LogId(7), 3);
        assert!(uniform < 3);
        assert_eq!(
            uniform,
            LogToShardMapping::Uniform.shard_for(LogId(7), 3),
        );
    }
}
