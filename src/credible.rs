//! Credible levels by greedy reduction of the graph.
//!
//! # Algorithm
//! On a private copy, repeatedly remove the least probable element until
//! the copy holds a single tree (`2n - 1` clades):
//!
//! 1. select the element of lowest probability (ties: larger parent clade,
//!    then arena order)
//! 2. remove it together with everything the removal leaves dangling
//! 3. give every element removed this round the current remaining mass
//! 4. recompute CCPs and clade probabilities, then the remaining mass
//!
//! Elements surviving to the end get the final remaining mass. A tree lies
//! in the `α` credible set iff the largest level among its elements is at
//! most `α`.
//!
//! | Granularity | Probability of an element | Remaining mass |
//! |---|---|---|
//! | clade (normalized model only) | clade probability | ratio of root credibility sums |
//! | partition | `P(parent) · ccp` | product of lost root CCP mass |
//!
//! [`ProbabilityThresholds`] is the sampling-based alternative: levels follow
//! from where a tree's probability falls among those of sampled trees.

use crate::bitset::{LeafSet, lexicographic_cmp};
use crate::ccd::CcpModel;
use crate::clade::{CladeId, PartitionId};
use crate::config::CcdConfig;
use crate::error::{CcdError, Result};
use crate::graph::{CascadeMode, CcdGraph, Removal};
use crate::propagation::{clade_probabilities, normalize_ccps};
use crate::tree::{Tree, Vertex};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Which elements the greedy reduction removes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CredibleSetType {
    /// Remove whole clades; normalized model only.
    Clade,
    /// Remove single partitions.
    Partition,
}

/// Credible level of every clade and partition of a distribution.
///
/// Partitions are keyed by `(parent, first child)` where the first child
/// is the smaller one, ties broken lexicographically.
#[derive(Clone, Debug)]
pub struct CredibleLevels<B> {
    kind: CredibleSetType,
    num_leaves: usize,
    clades: HashMap<B, f64>,
    partitions: HashMap<(B, B), f64>,
}

impl<B: LeafSet> CredibleLevels<B> {
    pub fn kind(&self) -> CredibleSetType {
        self.kind
    }

    pub fn clade_level(&self, clade: &B) -> Option<f64> {
        self.clades.get(clade).copied()
    }

    /// Level of the partition of `parent` into `a` and `b`, in either order.
    pub fn partition_level(&self, parent: &B, a: &B, b: &B) -> Option<f64> {
        self.partitions.get(&partition_key(parent, a, b)).copied()
    }

    pub fn clade_levels(&self) -> &HashMap<B, f64> {
        &self.clades
    }

    pub fn partition_levels(&self) -> &HashMap<(B, B), f64> {
        &self.partitions
    }

    /// Smallest credible level whose set contains `tree`, `None` if one of
    /// its clades (or partitions) is not in the distribution.
    pub fn tree_level(&self, tree: &Tree) -> Result<Option<f64>> {
        tree.validate(self.num_leaves)?;
        let bits: Vec<B> = tree.clade_bits(self.num_leaves);
        let mut level = 0.0f64;

        for (vertex, clade) in tree.vertices().iter().zip(&bits) {
            let current = match (self.kind, vertex) {
                (CredibleSetType::Clade, _) => self.clade_level(clade),
                (CredibleSetType::Partition, Vertex::Internal { children, .. }) => {
                    self.partition_level(clade, &bits[children[0]], &bits[children[1]])
                }
                (CredibleSetType::Partition, Vertex::Leaf { .. }) => continue,
            };
            match current {
                Some(current) => level = level.max(current),
                None => return Ok(None),
            }
        }
        Ok(Some(level))
    }

    /// Whether `tree` lies in the `alpha` credible set.
    pub fn contains_tree(&self, tree: &Tree, alpha: f64) -> Result<bool> {
        Ok(self.tree_level(tree)?.is_some_and(|level| level <= alpha))
    }
}

/// A credible level as an integer percentage in `[0, 100]`.
///
/// Absent or non-positive levels map to 0.
///
/// # Example
/// ```
/// # use rust_tree_ccd::credible::level_percent;
/// assert_eq!(level_percent(Some(0.75)), 75);
/// assert_eq!(level_percent(Some(0.951)), 96);
/// assert_eq!(level_percent(None), 0);
/// ```
pub fn level_percent(level: Option<f64>) -> u32 {
    match level {
        Some(level) if level > 0.0 => (level * 100.0).ceil() as u32,
        _ => 0,
    }
}

/// Credible levels from the probabilities of sampled trees.
///
/// # Algorithm
/// 1. Draw `N` trees and record their probabilities, plus a sentinel 0
/// 2. Sort descending and keep `precision` evenly spaced thresholds
///    `t[i] = sorted[round((i + 1) · N / precision)]`
/// 3. A tree of probability `p > 0` has level `(k + 1) / len`, where `k` is
///    the first threshold below `p` (the last one if none is)
///
/// With `precision ≥ N` all `N + 1` values are kept.
#[derive(Clone, Debug, PartialEq)]
pub struct ProbabilityThresholds {
    thresholds: Vec<f64>,
}

impl ProbabilityThresholds {
    /// Builds thresholds from sampled tree probabilities.
    pub fn from_samples(mut samples: Vec<f64>, precision: usize) -> Self {
        let num_samples = samples.len();
        samples.push(0.0);
        samples.sort_by(|a, b| b.total_cmp(a));

        if precision >= num_samples || precision == 0 {
            if precision > num_samples {
                warn!(
                    precision,
                    num_samples, "fewer samples than thresholds, keeping every sample"
                );
            }
            return ProbabilityThresholds {
                thresholds: samples,
            };
        }
        let step = num_samples as f64 / precision as f64;
        let thresholds = (1..=precision)
            .map(|i| samples[((i as f64 * step).round() as usize).min(num_samples)])
            .collect();
        ProbabilityThresholds { thresholds }
    }

    /// Thresholds in descending order.
    pub fn thresholds(&self) -> &[f64] {
        &self.thresholds
    }

    /// Credible level of a tree with probability `probability`; `None` for
    /// trees outside the distribution.
    pub fn level(&self, probability: f64) -> Option<f64> {
        if probability <= 0.0 || self.thresholds.is_empty() {
            return None;
        }
        let len = self.thresholds.len();
        let below = self
            .thresholds
            .partition_point(|&t| t >= probability)
            .min(len - 1);
        Some((below + 1) as f64 / len as f64)
    }

    /// Mean threshold of each of `buckets` equally long runs, most probable first.
    pub fn mean_probabilities(&self, buckets: usize) -> Vec<f64> {
        let length = self.thresholds.len() / buckets.max(1);
        if length == 0 {
            return Vec::new();
        }
        self.thresholds
            .chunks_exact(length)
            .take(buckets)
            .map(|chunk| chunk.iter().sum::<f64>() / length as f64)
            .collect()
    }
}

fn partition_key<B: LeafSet>(parent: &B, a: &B, b: &B) -> (B, B) {
    let order = a
        .count_ones()
        .cmp(&b.count_ones())
        .then_with(|| lexicographic_cmp(a, b));
    let first = if order == Ordering::Greater { b } else { a };
    (parent.clone(), first.clone())
}

/// Computes credible levels for a prepared graph.
///
/// # Errors
/// [`CcdError::Unsupported`] for clade granularity under the frequency-ratio
/// model; errors of the cascading reduction and of CCP recomputation.
pub(crate) fn credible_levels<B: LeafSet>(
    graph: &CcdGraph<B>,
    model: CcpModel,
    config: &CcdConfig,
    kind: CredibleSetType,
) -> Result<CredibleLevels<B>> {
    if kind == CredibleSetType::Clade && model == CcpModel::FrequencyRatio {
        return Err(CcdError::Unsupported(
            "clade credible sets need the normalized model".to_string(),
        ));
    }

    let mut working = graph.clone();
    working.tidy_up();
    let mut reduction = Reduction {
        levels: CredibleLevels {
            kind,
            num_leaves: graph.num_leaves(),
            clades: HashMap::new(),
            partitions: HashMap::new(),
        },
        probabilities: clade_probabilities(&working, config)?,
        remaining: 1.0,
        rounds: 0,
        config,
    };

    match kind {
        CredibleSetType::Clade => reduction.by_clades(&mut working)?,
        CredibleSetType::Partition => reduction.by_partitions(&mut working)?,
    }

    // survivors
    for id in working.clade_ids().collect::<Vec<_>>() {
        reduction.record_clade(&working, id);
        for &pid in working.clade(id).partitions() {
            reduction.record_partition(&working, pid);
        }
    }
    debug!(
        kind = ?kind,
        rounds = reduction.rounds,
        remaining = reduction.remaining,
        "computed credible levels"
    );
    Ok(reduction.levels)
}

struct Reduction<'a, B> {
    levels: CredibleLevels<B>,
    probabilities: Vec<f64>,
    remaining: f64,
    rounds: usize,
    config: &'a CcdConfig,
}

impl<B: LeafSet> Reduction<'_, B> {
    fn record_clade(&mut self, graph: &CcdGraph<B>, id: CladeId) {
        let bits = graph.clade(id).bits().clone();
        self.levels.clades.insert(bits, self.remaining);
    }

    fn record_partition(&mut self, graph: &CcdGraph<B>, pid: PartitionId) {
        let partition = graph.partition(pid);
        let [first, _] = partition.children();
        let key = (
            graph.clade(partition.parent()).bits().clone(),
            graph.clade(first).bits().clone(),
        );
        self.levels.partitions.insert(key, self.remaining);
    }

    fn record_removal(&mut self, graph: &CcdGraph<B>, removal: &Removal) {
        for &id in &removal.clades {
            self.record_clade(graph, id);
        }
        for &pid in &removal.partitions {
            self.record_partition(graph, pid);
        }
    }

    /// Clade granularity; CCPs are renormalized from credibilities each round.
    fn by_clades(&mut self, working: &mut CcdGraph<B>) -> Result<()> {
        let target = 2 * working.num_leaves() - 1;
        let full_root_sum = {
            let mut full = working.clone();
            let sums = normalize_ccps(&mut full)?;
            sums[full.root().index()]
        };
        if full_root_sum <= 0.0 {
            return Err(CcdError::ZeroCredibility(
                working.clade(working.root()).bits().to_string(),
            ));
        }

        while working.num_clades() > target {
            let Some(next) = self.next_clade(working) else {
                warn!(clades = working.num_clades(), "no clade left to remove");
                break;
            };
            let removal = working.reduce(vec![next], CascadeMode::Strict)?;
            self.record_removal(working, &removal);
            self.rounds += 1;

            let sums = normalize_ccps(working)?;
            self.probabilities = clade_probabilities(working, self.config)?;
            self.remaining = sums[working.root().index()] / full_root_sum;
        }
        Ok(())
    }

    /// Least probable non-trivial clade; clades of probability 1 are kept.
    fn next_clade(&self, working: &CcdGraph<B>) -> Option<CladeId> {
        let mut best: Option<(CladeId, f64)> = None;
        for id in working.clade_ids() {
            let clade = working.clade(id);
            if clade.is_leaf() || working.is_root(id) {
                continue;
            }
            let p = self.probabilities[id.index()];
            if (p - 1.0).abs() < self.config.rounding_epsilon {
                continue;
            }
            let better = match best {
                None => true,
                Some((current, min)) => {
                    p < min || (p == min && clade.size() > working.clade(current).size())
                }
            };
            if better {
                best = Some((id, p));
            }
        }
        best.map(|(id, _)| id)
    }

    /// Partition granularity; CCPs are rescaled by the lost mass each round.
    fn by_partitions(&mut self, working: &mut CcdGraph<B>) -> Result<()> {
        let target = 2 * working.num_leaves() - 1;

        while working.num_clades() > target {
            let Some(next) = self.next_partition(working) else {
                warn!(clades = working.num_clades(), "no partition left to remove");
                break;
            };
            let removal = Self::reduce_partition(working, next)?;
            self.record_removal(working, &removal);
            self.rounds += 1;

            let factor = rescale_ccps(working);
            self.probabilities = clade_probabilities(working, self.config)?;
            self.remaining *= factor;
        }
        Ok(())
    }

    fn next_partition(&self, working: &CcdGraph<B>) -> Option<PartitionId> {
        let mut best: Option<(PartitionId, f64, usize)> = None;
        for id in working.clade_ids() {
            let clade = working.clade(id);
            if clade.is_leaf() {
                continue;
            }
            // the root's last partition holds the remaining tree together
            if working.is_root(id) && clade.partitions().len() == 1 {
                continue;
            }
            let p_clade = self.probabilities[id.index()];
            for &pid in clade.partitions() {
                if clade.partitions().len() > 1 && Self::strands_leaf(working, pid) {
                    continue;
                }
                let p = p_clade * working.partition(pid).ccp();
                let better = match best {
                    None => true,
                    Some((_, min, size)) => p < min || (p == min && clade.size() > size),
                };
                if better {
                    best = Some((pid, p, clade.size()));
                }
            }
        }
        best.map(|(pid, _, _)| pid)
    }

    /// Whether removing only this partition would leave a leaf without parent.
    fn strands_leaf(working: &CcdGraph<B>, pid: PartitionId) -> bool {
        working.partition(pid).children().iter().any(|&child| {
            let clade = working.clade(child);
            clade.is_leaf() && clade.parents().len() == 1
        })
    }

    /// Removes `pid` and whatever it alone held in place:
    /// - the parent if this is its only partition
    /// - else a non-leaf child reachable only through this partition
    /// - else just the partition
    fn reduce_partition(working: &mut CcdGraph<B>, pid: PartitionId) -> Result<Removal> {
        let partition = working.partition(pid);
        let parent = partition.parent();
        if working.clade(parent).partitions().len() == 1 {
            return working.reduce(vec![parent], CascadeMode::Strict);
        }
        for child in partition.children() {
            let clade = working.clade(child);
            if !clade.is_leaf() && clade.parents().len() == 1 {
                return working.reduce(vec![child], CascadeMode::Strict);
            }
        }
        working.remove_partition(pid);
        Ok(Removal {
            clades: Vec::new(),
            partitions: vec![pid],
            complete: true,
        })
    }
}

/// Renormalizes CCPs after partitions were removed and returns the
/// fraction of mass the root kept.
///
/// Clades are visited by increasing size. A clade whose CCPs sum to
/// `s < 1` scales the partitions of its parents that contain it by `s` and
/// divides its own CCPs by `s`.
fn rescale_ccps<B: LeafSet>(working: &mut CcdGraph<B>) -> f64 {
    let root = working.root();
    let mut root_sum = 1.0;
    for id in working.clades_by_size() {
        let clade = working.clade(id);
        if clade.is_leaf() {
            continue;
        }
        let own: Vec<PartitionId> = clade.partitions().to_vec();
        let sum: f64 = own.iter().map(|&pid| working.partition(pid).ccp()).sum();
        if sum < 1.0 {
            let above: Vec<PartitionId> = clade
                .parents()
                .iter()
                .filter_map(|&parent| working.partition_with_child(parent, id))
                .collect();
            for pid in above {
                let ccp = working.partition(pid).ccp();
                working.set_ccp(pid, ccp * sum);
            }
            for pid in own {
                let ccp = working.partition(pid).ccp();
                working.set_ccp(pid, (ccp / sum).min(1.0));
            }
        }
        if id == root {
            root_sum = sum;
        }
    }
    root_sum
}
