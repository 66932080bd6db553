//! The failure-domain tree.
//!
//! Built once per selector invocation over the eligible shards of a cluster
//! view. Internal nodes are location prefixes at successively finer scopes;
//! leaves are individual shards. Every tree node carries the cumulative
//! weight of the shards below it (excluded and non-writable nodes contribute
//! nothing because they are filtered out before the build).

use std::collections::BTreeMap;

use crate::cluster::{ClusterView, LocationScope};
use crate::placement::{weighted_sample, EligibleShard, LogToShardMapping, SelectorOptions};
use crate::types::{LogId, ShardId};

/// A failure domain at some scope: a location prefix plus the eligible
/// shards underneath it, in shard order.
#[derive(Debug, Clone)]
pub struct Domain {
    pub path: String,
    pub scope: LocationScope,
    pub shards: Vec<EligibleShard>,
    pub weight: f64,
}

#[derive(Debug, Default)]
struct TreeNode {
    weight: f64,
    children: BTreeMap<String, TreeNode>,
    leaves: Vec<EligibleShard>,
}

impl TreeNode {
    fn collect_leaves(&self, out: &mut Vec<EligibleShard>) {
        out.extend(self.leaves.iter().copied());
        for child in self.children.values() {
            child.collect_leaves(out);
        }
    }
}

/// The tree itself.
///
/// Nodes without a configured location hang directly off the root under a
/// synthetic `#N<index>` label and act as their own domain at every scope.
#[derive(Debug)]
pub struct DomainTree {
    root: TreeNode,
    eligible: usize,
}

impl DomainTree {
    /// Build the tree for one log over the eligible shards of `view`.
    ///
    /// A node is eligible when it is a writable storage node with positive
    /// weight, not flagged `exclude_from_nodesets`, and not excluded by the
    /// options; it contributes the one shard the log maps to.
    pub fn build(
        view: &ClusterView,
        log_id: LogId,
        mapping: LogToShardMapping,
        options: &SelectorOptions,
    ) -> Self {
        let mut root = TreeNode::default();
        let mut eligible = 0;
        for node in view.nodes() {
            if !node.is_nodeset_candidate() || options.exclude_nodes.contains(&node.index) {
                continue;
            }
            let shard = ShardId::new(node.index, mapping.shard_for(log_id, node.num_shards));
            let leaf = EligibleShard {
                shard,
                weight: node.storage_weight,
            };
            eligible += 1;
            root.weight += leaf.weight;

            let mut cursor = &mut root;
            match &node.location {
                Some(location) => {
                    for scope in LocationScope::PATH_SCOPES {
                        let label = location.domain(scope);
                        cursor = cursor.children.entry(label).or_default();
                        cursor.weight += leaf.weight;
                    }
                }
                None => {
                    cursor = cursor
                        .children
                        .entry(format!("#N{}", node.index))
                        .or_default();
                    cursor.weight += leaf.weight;
                }
            }
            cursor.leaves.push(leaf);
        }
        Self { root, eligible }
    }

    /// Number of eligible shards in the tree.
    pub fn len(&self) -> usize {
        self.eligible
    }

    pub fn is_empty(&self) -> bool {
        self.eligible == 0
    }

    /// Total eligible weight.
    pub fn total_weight(&self) -> f64 {
        self.root.weight
    }

    /// All eligible shards, in shard order.
    pub fn all_shards(&self) -> Vec<EligibleShard> {
        let mut out = Vec::with_capacity(self.eligible);
        self.root.collect_leaves(&mut out);
        out.sort_unstable_by_key(|s| s.shard);
        out
    }

    /// Enumerate the domains at `scope`, in path order.
    ///
    /// At `Node` scope every shard is its own singleton domain. Located and
    /// unlocated nodes never share a domain.
    pub fn domains_at(&self, scope: LocationScope) -> Vec<Domain> {
        if scope == LocationScope::Node {
            return self
                .all_shards()
                .into_iter()
                .map(|leaf| Domain {
                    path: format!("#N{}", leaf.shard.node),
                    scope,
                    shards: vec![leaf],
                    weight: leaf.weight,
                })
                .collect();
        }

        let depth = LocationScope::PATH_SCOPES
            .iter()
            .position(|&s| s == scope)
            .map(|p| p + 1)
            .unwrap_or(0);
        let mut out = Vec::new();
        collect_domains(&self.root, scope, depth, &mut out);
        out
    }

    /// Collapse the whole tree into one root-scope domain.
    pub fn as_single_domain(&self) -> Domain {
        Domain {
            path: String::new(),
            scope: LocationScope::Root,
            shards: self.all_shards(),
            weight: self.root.weight,
        }
    }

    /// Weighted random draw of `k` shards from the whole tree, without
    /// replacement, seeded deterministically.
    pub fn weighted_draw(&self, k: usize, seed: u64) -> Vec<ShardId> {
        weighted_sample(&self.all_shards(), k, seed)
    }
}

fn collect_domains(node: &TreeNode, scope: LocationScope, depth: usize, out: &mut Vec<Domain>) {
    for (label, child) in &node.children {
        if label.starts_with("#N") || depth <= 1 {
            // Synthetic domains (and root-scope requests) terminate here.
            let mut shards = Vec::new();
            child.collect_leaves(&mut shards);
            shards.sort_unstable_by_key(|s| s.shard);
            out.push(Domain {
                path: label.clone(),
                scope,
                shards,
                weight: child.weight,
            });
        } else {
            collect_domains(child, scope, depth - 1, out);
        }
    }
}
