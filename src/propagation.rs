//! Probabilities derived from the conditional clade probabilities (CCPs).
//!
//! # Clade probabilities
//! The probability of a clade is the probability that a tree drawn from the
//! distribution contains it: the sum, over all root-to-clade paths, of the
//! product of CCPs along the path. One Kahn-style sweep from the root
//! computes it for every clade, handling a clade only once all of its parents
//! have contributed:
//!
//! ```text
//! P(child) = Σ over parents C, partitions π of C containing child: P(C) · ccp(π)
//! ```
//!
//! # CCP assignment
//! - frequency ratio: `ccp(π) = count(π) / count(parent)`
//! - normalized: bottom-up sums of subtree clade credibilities, see
//!   [`normalize_ccps`]

use crate::bitset::LeafSet;
use crate::ccd::CcpModel;
use crate::clade::CladeId;
use crate::config::CcdConfig;
use crate::error::{CcdError, Result};
use crate::graph::CcdGraph;
use crate::tree::{Tree, Vertex};
use std::collections::VecDeque;
use tracing::debug;

/// Sets every CCP to the ratio of partition to parent occurrence counts.
pub(crate) fn set_frequency_ratio_ccps<B: LeafSet>(graph: &mut CcdGraph<B>) {
    let ids: Vec<CladeId> = graph.clade_ids().collect();
    for id in ids {
        let clade = graph.clade(id);
        let total = clade.occurrences();
        let updates: Vec<_> = clade
            .partitions()
            .iter()
            .map(|&pid| {
                let ccp = if total == 0 {
                    0.0
                } else {
                    graph.partition(pid).occurrences() as f64 / total as f64
                };
                (pid, ccp)
            })
            .collect();
        for (pid, ccp) in updates {
            graph.set_ccp(pid, ccp);
        }
    }
}

/// Sets CCPs proportional to the product of the children's summed subtree
/// credibilities and returns those sums, indexed by clade.
///
/// # Algorithm
/// Clades are handled by increasing size so children are always done first:
/// - leaf: sum = 1
/// - cherry: its single partition gets ccp 1, sum = credibility
/// - otherwise: `w(π) = sum(c1) · sum(c2)`, `ccp(π) = w(π) / Σ w`,
///   sum = `credibility · Σ w`
///
/// # Errors
/// A cherry without partition, or a clade whose weights sum to 0.
pub(crate) fn normalize_ccps<B: LeafSet>(graph: &mut CcdGraph<B>) -> Result<Vec<f64>> {
    let mut sums = vec![0.0; graph.arena_len()];

    for id in graph.clades_by_size() {
        let clade = graph.clade(id);
        if clade.is_leaf() {
            sums[id.index()] = 1.0;
            continue;
        }
        if clade.is_cherry() {
            let Some(&pid) = clade.partitions().first() else {
                return Err(CcdError::MissingCherryPartition(clade.bits().to_string()));
            };
            sums[id.index()] = graph.credibility(id);
            graph.set_ccp(pid, 1.0);
            continue;
        }

        let weights: Vec<_> = clade
            .partitions()
            .iter()
            .map(|&pid| {
                let [a, b] = graph.partition(pid).children();
                (pid, sums[a.index()] * sums[b.index()])
            })
            .collect();
        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        if total == 0.0 {
            return Err(CcdError::ZeroCredibility(clade.bits().to_string()));
        }
        sums[id.index()] = total * graph.credibility(id);
        for (pid, w) in weights {
            graph.set_ccp(pid, w / total);
        }
    }
    Ok(sums)
}

/// Probability of every clade, indexed by clade; leaves have probability 1.
///
/// # Errors
/// A probability above `1 + probability_error`, which means the CCPs of some
/// clade do not sum to 1.
pub fn clade_probabilities<B: LeafSet>(graph: &CcdGraph<B>, config: &CcdConfig) -> Result<Vec<f64>> {
    let mut probabilities = vec![0.0; graph.arena_len()];
    let mut pending: Vec<usize> = vec![0; graph.arena_len()];
    for id in graph.clade_ids() {
        pending[id.index()] = graph.clade(id).parents().len();
    }

    let root = graph.root();
    probabilities[root.index()] = 1.0;
    let mut queue = VecDeque::from([root]);

    while let Some(id) = queue.pop_front() {
        let clade = graph.clade(id);
        if clade.is_leaf() {
            continue;
        }
        let parent_probability = probabilities[id.index()];

        for &pid in clade.partitions() {
            let partition = graph.partition(pid);
            for child in partition.children() {
                if graph.clade(child).is_leaf() {
                    continue;
                }
                let mut value = probabilities[child.index()] + parent_probability * partition.ccp();

                if value > 1.0 + config.probability_error {
                    return Err(CcdError::InvalidProbability {
                        value,
                        parent: clade.bits().to_string(),
                        child: graph.clade(child).bits().to_string(),
                        partition: format!("{:.6}", partition.ccp()),
                    });
                }
                if value > 1.0 + config.rounding_epsilon {
                    debug!(
                        clade = %graph.clade(child).bits(),
                        value,
                        "clade probability above 1, treating as rounding error"
                    );
                }
                if value > 1.0 && value <= 1.0 + config.rounding_epsilon {
                    value = 1.0;
                }
                probabilities[child.index()] = value;

                let slot = &mut pending[child.index()];
                *slot = slot.saturating_sub(1);
                if *slot == 0 {
                    queue.push_back(child);
                }
            }
        }
    }

    for id in graph.clade_ids() {
        if graph.clade(id).is_leaf() {
            probabilities[id.index()] = 1.0;
        }
    }
    Ok(probabilities)
}

/// Entropy of the tree distribution: `-Σ P(C) · ccp(π) · ln ccp(π)`.
pub fn entropy<B: LeafSet>(graph: &CcdGraph<B>, probabilities: &[f64]) -> f64 {
    let mut sum = 0.0;
    for id in graph.clade_ids() {
        let p = probabilities[id.index()];
        for &pid in graph.clade(id).partitions() {
            let ccp = graph.partition(pid).ccp();
            if ccp > 0.0 {
                sum += p * ccp * ccp.ln();
            }
        }
    }
    -sum
}

/// Entropy by recursion over subtrees, leaves contributing 0:
///
/// ```text
/// H(C) = Σ over partitions π = (A, B) of C: ccp(π) · (H(A) + H(B) - ln ccp(π))
/// ```
///
/// Agrees with [`entropy`] on a graph whose CCPs sum to 1 per clade.
pub fn lewis_entropy<B: LeafSet>(graph: &CcdGraph<B>) -> f64 {
    let mut entropies = vec![0.0; graph.arena_len()];
    for id in graph.clades_by_size() {
        let value: f64 = graph
            .clade(id)
            .partitions()
            .iter()
            .map(|&pid| {
                let partition = graph.partition(pid);
                let ccp = partition.ccp();
                if ccp <= 0.0 {
                    return 0.0;
                }
                let [a, b] = partition.children();
                ccp * (entropies[a.index()] + entropies[b.index()] - ccp.ln())
            })
            .sum();
        entropies[id.index()] = value;
    }
    entropies[graph.root().index()]
}

/// Free parameters of the model, for the AIC score.
///
/// - frequency ratio: one CCP per partition less one per clade
/// - normalized: one credibility per non-trivial clade
pub fn number_of_parameters<B: LeafSet>(graph: &CcdGraph<B>, model: CcpModel) -> usize {
    match model {
        CcpModel::FrequencyRatio => graph
            .clade_ids()
            .map(|id| graph.clade(id).partitions().len().saturating_sub(1))
            .sum(),
        CcpModel::Normalized => graph
            .clade_ids()
            .filter(|&id| !graph.clade(id).is_leaf() && !graph.is_root(id))
            .count(),
    }
}

/// Product of the CCPs of the tree's partitions; 0 if any is missing.
pub fn tree_probability<B: LeafSet>(graph: &CcdGraph<B>, tree: &Tree) -> Result<f64> {
    tree.validate(graph.num_leaves())?;
    let bits: Vec<B> = tree.clade_bits(graph.num_leaves());
    let ids: Vec<Option<CladeId>> = bits.iter().map(|b| graph.clade_id(b)).collect();

    let mut probability = 1.0;
    for (idx, vertex) in tree.vertices().iter().enumerate() {
        let Vertex::Internal { children, .. } = vertex else {
            continue;
        };
        let partition = match (ids[idx], ids[children[0]], ids[children[1]]) {
            (Some(parent), Some(a), Some(b)) => graph.partition_between(parent, a, b),
            _ => None,
        };
        match partition {
            Some(pid) => probability *= graph.partition(pid).ccp(),
            None => return Ok(0.0),
        }
    }
    Ok(probability)
}

/// Number of distinct topologies with non-zero probability.
///
/// Returned as `f64`; large distributions overflow to infinity.
pub fn number_of_topologies<B: LeafSet>(graph: &CcdGraph<B>) -> f64 {
    let mut counts = vec![0.0; graph.arena_len()];
    for id in graph.clades_by_size() {
        let clade = graph.clade(id);
        counts[id.index()] = if clade.is_leaf() {
            1.0
        } else {
            clade
                .partitions()
                .iter()
                .filter(|&&pid| graph.partition(pid).ccp() > 0.0)
                .map(|&pid| {
                    let [a, b] = graph.partition(pid).children();
                    counts[a.index()] * counts[b.index()]
                })
                .sum()
        };
    }
    counts[graph.root().index()]
}

/// Log-likelihood of the folded trees: `Σ count(π) · ln ccp(π)`.
pub fn log_likelihood<B: LeafSet>(graph: &CcdGraph<B>) -> f64 {
    graph
        .clade_ids()
        .flat_map(|id| graph.clade(id).partitions().iter().copied())
        .map(|pid| graph.partition(pid))
        .filter(|p| p.occurrences() > 0)
        .map(|p| p.occurrences() as f64 * p.ccp().ln())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitset::Bitset64;
    use crate::fixtures::{bits64, four_taxon_trees, taxa, tree};

    fn frequency_ratio_graph() -> CcdGraph<Bitset64> {
        let mut graph = CcdGraph::new(4).unwrap();
        for t in four_taxon_trees() {
            graph.add_tree(&t).unwrap();
        }
        set_frequency_ratio_ccps(&mut graph);
        graph
    }

    fn root_ccp(graph: &CcdGraph<Bitset64>, a: &[usize], b: &[usize]) -> f64 {
        let a = graph.clade_id(&bits64(a)).unwrap();
        let b = graph.clade_id(&bits64(b)).unwrap();
        let pid = graph.partition_between(graph.root(), a, b).unwrap();
        graph.partition(pid).ccp()
    }

    #[test]
    fn test_frequency_ratio_ccps() {
        let graph = frequency_ratio_graph();
        assert!((root_ccp(&graph, &[0, 1], &[2, 3]) - 0.75).abs() < 1e-12);
        assert!((root_ccp(&graph, &[0, 2], &[1, 3]) - 0.25).abs() < 1e-12);

        for id in graph.clade_ids() {
            let clade = graph.clade(id);
            if clade.is_leaf() {
                continue;
            }
            let sum: f64 = clade.partitions().iter().map(|&p| graph.partition(p).ccp()).sum();
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_clade_probabilities_and_entropy() {
        let graph = frequency_ratio_graph();
        let probs = clade_probabilities(&graph, &CcdConfig::default()).unwrap();
        let ab = graph.clade_id(&bits64(&[0, 1])).unwrap();
        let bd = graph.clade_id(&bits64(&[1, 3])).unwrap();
        assert_eq!(probs[graph.root().index()], 1.0);
        assert!((probs[ab.index()] - 0.75).abs() < 1e-12);
        assert!((probs[bd.index()] - 0.25).abs() < 1e-12);
        assert_eq!(probs[graph.leaf(0).unwrap().index()], 1.0);

        let h = entropy(&graph, &probs);
        let expected = -(0.75f64 * 0.75f64.ln() + 0.25 * 0.25f64.ln());
        assert!((h - expected).abs() < 1e-12);
        assert!((h - 0.5623).abs() < 1e-4);
    }

    #[test]
    fn test_tree_probability() {
        let graph = frequency_ratio_graph();
        let taxa = taxa(4);
        let p = |nwk: &str| tree_probability(&graph, &tree(nwk, &taxa)).unwrap();
        assert!((p("((A,B),(C,D));") - 0.75).abs() < 1e-12);
        assert!((p("((D,B),(C,A));") - 0.25).abs() < 1e-12);
        assert_eq!(p("((A,D),(B,C));"), 0.0);
        assert_eq!(p("(((A,B),C),D);"), 0.0);
    }

    #[test]
    fn test_counts_and_log_likelihood() {
        let graph = frequency_ratio_graph();
        assert_eq!(number_of_topologies(&graph), 2.0);
        let expected = 3.0 * 0.75f64.ln() + 0.25f64.ln();
        assert!((log_likelihood(&graph) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_lewis_entropy_matches_entropy() {
        let graph = frequency_ratio_graph();
        let probs = clade_probabilities(&graph, &CcdConfig::default()).unwrap();
        assert!((lewis_entropy(&graph) - entropy(&graph, &probs)).abs() < 1e-12);

        let mut normalized: CcdGraph<Bitset64> = CcdGraph::new(4).unwrap();
        for t in four_taxon_trees() {
            normalized.add_tree(&t).unwrap();
        }
        normalize_ccps(&mut normalized).unwrap();
        let probs = clade_probabilities(&normalized, &CcdConfig::default()).unwrap();
        let expected = -(0.9f64 * 0.9f64.ln() + 0.1 * 0.1f64.ln());
        assert!((lewis_entropy(&normalized) - expected).abs() < 1e-12);
        assert!((entropy(&normalized, &probs) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_number_of_parameters() {
        let graph = frequency_ratio_graph();
        // the root's two partitions share one degree of freedom
        assert_eq!(number_of_parameters(&graph, CcpModel::FrequencyRatio), 1);
        // {A,B} {C,D} {A,C} {B,D}
        assert_eq!(number_of_parameters(&graph, CcpModel::Normalized), 4);
    }

    #[test]
    fn test_normalized_ccps() {
        let mut graph: CcdGraph<Bitset64> = CcdGraph::new(4).unwrap();
        for t in four_taxon_trees() {
            graph.add_tree(&t).unwrap();
        }
        let sums = normalize_ccps(&mut graph).unwrap();
        assert!((root_ccp(&graph, &[0, 1], &[2, 3]) - 0.9).abs() < 1e-12);
        assert!((root_ccp(&graph, &[0, 2], &[1, 3]) - 0.1).abs() < 1e-12);
        assert!((sums[graph.root().index()] - 0.625).abs() < 1e-12);

        let ab = graph.clade_id(&bits64(&[0, 1])).unwrap();
        assert!((sums[ab.index()] - 0.75).abs() < 1e-12);
        let pid = graph.clade(ab).partitions()[0];
        assert_eq!(graph.partition(pid).ccp(), 1.0);
    }

    #[test]
    fn test_probability_bounds() {
        let mut graph = frequency_ratio_graph();
        let config = CcdConfig::default();
        let root_partitions = graph.clade(graph.root()).partitions().to_vec();

        graph.set_ccp(root_partitions[0], 1.0 + 1e-11);
        let probs = clade_probabilities(&graph, &config).unwrap();
        let ab = graph.clade_id(&bits64(&[0, 1])).unwrap();
        assert_eq!(probs[ab.index()], 1.0);

        graph.set_ccp(root_partitions[0], 1.5);
        assert!(matches!(
            clade_probabilities(&graph, &config),
            Err(CcdError::InvalidProbability { .. })
        ));
    }
}
