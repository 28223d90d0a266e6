//! Building single trees out of the graph.
//!
//! # Overview
//! Every extraction is one top-down descent from the root clade that picks
//! one partition per non-leaf clade:
//!
//! | Strategy | Partition choice |
//! |---|---|
//! | sampling | drawn with probability equal to its CCP |
//! | MAP | maximises `ln ccp + best(c1) + best(c2)` |
//! | MSCC | maximises `best(c1) + best(c2)`, plus the clade's credibility |
//!
//! Output vertices carry the clade probability as support and a height
//! chosen by [`HeightPolicy`], independently of the strategy.

use crate::bitset::LeafSet;
use crate::clade::{CladeId, PartitionId};
use crate::error::{CcdError, Result};
use crate::graph::CcdGraph;
use crate::tree::{Ancestry, Tree, Vertex};
use rand::Rng;
use tracing::warn;

/// How heights are assigned to extracted or re-heighted trees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum HeightPolicy {
    /// Every height is 0.
    #[default]
    None,
    /// Leaves at their mean observed height, internal vertices one above
    /// their higher child.
    One,
    /// Mean of the heights the clade was observed at.
    MeanOccurred,
    /// Mean height of the clade's most recent common ancestor across the
    /// stored input trees. Needs `store_base_trees`.
    CommonAncestor,
}

/// Best subtree value and the partition achieving it, indexed by clade.
#[derive(Clone, Debug, Default)]
pub(crate) struct BestSubtrees {
    pub(crate) values: Vec<f64>,
    pub(crate) choices: Vec<Option<PartitionId>>,
}

impl BestSubtrees {
    pub(crate) fn choice(&self, id: CladeId) -> Option<PartitionId> {
        self.choices[id.index()]
    }

    pub(crate) fn value(&self, id: CladeId) -> f64 {
        self.values[id.index()]
    }
}

/// Bottom-up maximisation over partitions; the first maximum wins ties.
fn best_subtrees<B, F>(graph: &CcdGraph<B>, leaf_value: f64, score: F) -> BestSubtrees
where
    B: LeafSet,
    F: Fn(CladeId, PartitionId, f64) -> f64,
{
    let mut values = vec![f64::NEG_INFINITY; graph.arena_len()];
    let mut choices = vec![None; graph.arena_len()];

    for id in graph.clades_by_size() {
        let clade = graph.clade(id);
        if clade.is_leaf() {
            values[id.index()] = leaf_value;
            continue;
        }
        let mut best = f64::NEG_INFINITY;
        let mut choice = None;
        for &pid in clade.partitions() {
            let [a, b] = graph.partition(pid).children();
            let value = score(id, pid, values[a.index()] + values[b.index()]);
            if choice.is_none() || value > best {
                best = value;
                choice = Some(pid);
            }
        }
        values[id.index()] = best;
        choices[id.index()] = choice;
    }
    BestSubtrees { values, choices }
}

/// Per clade, the largest log probability of a subtree below it.
pub(crate) fn max_log_subtree_ccps<B: LeafSet>(graph: &CcdGraph<B>) -> BestSubtrees {
    best_subtrees(graph, 0.0, |_, pid, children| {
        graph.partition(pid).ccp().ln() + children
    })
}

/// Per clade, the largest sum of clade credibilities of a subtree below it.
pub(crate) fn max_sum_clade_credibility<B: LeafSet>(graph: &CcdGraph<B>) -> BestSubtrees {
    best_subtrees(graph, 1.0, |id, _, children| {
        graph.credibility(id) + children
    })
}

/// Draws a partition of `id` with probability equal to its CCP.
///
/// Falls back to the last partition when rounding leaves the CCP sum short
/// of the drawn value.
pub(crate) fn sample_partition<B: LeafSet, R: Rng + ?Sized>(
    graph: &CcdGraph<B>,
    id: CladeId,
    rng: &mut R,
) -> Option<PartitionId> {
    let partitions = graph.clade(id).partitions();
    let draw: f64 = rng.random();
    let mut sum = 0.0;
    for &pid in partitions {
        sum += graph.partition(pid).ccp();
        if draw < sum {
            return Some(pid);
        }
    }
    partitions.last().copied()
}

/// Common-ancestor height of every clade, indexed by clade.
///
/// Leaves, the root and monophyletic clades use their mean observed height;
/// any other clade averages the height of its MRCA over `trees`.
pub(crate) fn common_ancestor_heights<B: LeafSet>(
    graph: &CcdGraph<B>,
    trees: &[Tree],
) -> Result<Vec<f64>> {
    if trees.is_empty() {
        return Err(CcdError::BaseTreesNotStored);
    }
    let n = graph.num_leaves();
    let ancestries: Vec<Ancestry<'_, B>> = trees.iter().map(|t| Ancestry::new(t, n)).collect();
    let mut heights = vec![0.0; graph.arena_len()];

    for id in graph.clade_ids() {
        let clade = graph.clade(id);
        heights[id.index()] = if clade.is_leaf() || graph.is_root(id) || graph.is_monophyletic(id) {
            clade.mean_height()
        } else {
            mean_over(&ancestries, |a| a.mrca_height(clade.bits()))
        };
    }
    Ok(heights)
}

fn mean_over<'t, B, F>(ancestries: &[Ancestry<'t, B>], height: F) -> f64
where
    B: LeafSet,
    F: Fn(&Ancestry<'t, B>) -> Option<f64>,
{
    let sum: f64 = ancestries.iter().filter_map(height).sum();
    sum / ancestries.len() as f64
}

/// Top-down descent building a [`Tree`].
pub(crate) struct Extractor<'a, B> {
    pub(crate) graph: &'a CcdGraph<B>,
    pub(crate) probabilities: &'a [f64],
    pub(crate) policy: HeightPolicy,
    /// Required for [`HeightPolicy::CommonAncestor`].
    pub(crate) ca_heights: Option<&'a [f64]>,
}

impl<B: LeafSet> Extractor<'_, B> {
    /// Descends from the root, asking `choose` for the partition of every
    /// non-leaf clade reached.
    pub(crate) fn extract<F>(&self, mut choose: F) -> Result<Tree>
    where
        F: FnMut(CladeId) -> Option<PartitionId>,
    {
        if self.policy == HeightPolicy::CommonAncestor && self.ca_heights.is_none() {
            return Err(CcdError::BaseTreesNotStored);
        }
        let mut tree = Tree::new();
        self.descend(self.graph.root(), &mut choose, &mut tree)?;
        Ok(tree)
    }

    fn descend<F>(&self, id: CladeId, choose: &mut F, tree: &mut Tree) -> Result<usize>
    where
        F: FnMut(CladeId) -> Option<PartitionId>,
    {
        let clade = self.graph.clade(id);
        if clade.is_leaf() {
            let Some(taxon) = clade.bits().next_set_index(0) else {
                return Err(CcdError::InvalidTree(format!("leaf clade {} is empty", clade.bits())));
            };
            let height = match self.policy {
                HeightPolicy::None => 0.0,
                _ => clade.mean_height(),
            };
            return Ok(tree.add_leaf(taxon, height));
        }

        let Some(pid) = choose(id) else {
            return Err(CcdError::InvalidTree(format!(
                "no partition to extract for clade {}",
                clade.bits()
            )));
        };
        let [a, b] = self.graph.partition(pid).children();
        let left = self.descend(a, choose, tree)?;
        let right = self.descend(b, choose, tree)?;

        let height = match self.policy {
            HeightPolicy::None => 0.0,
            HeightPolicy::One => {
                let child_height = |idx: usize| tree.vertex(idx).map_or(0.0, Vertex::height);
                child_height(left).max(child_height(right)) + 1.0
            }
            HeightPolicy::MeanOccurred => clade.mean_height(),
            HeightPolicy::CommonAncestor => self.ca_heights.map_or(0.0, |h| h[id.index()]),
        };
        let idx = tree.add_internal(left, right, height);
        tree.set_support(idx, self.probabilities[id.index()]);
        Ok(idx)
    }
}

/// Overwrites the heights of `tree` according to `policy`.
///
/// `MeanOccurred` leaves vertices whose clade is not in the graph unchanged
/// and logs a warning. `CommonAncestor` averages over `base_trees`: leaf
/// heights directly, internal vertices via their MRCA.
pub(crate) fn set_heights<B: LeafSet>(
    graph: &CcdGraph<B>,
    tree: &mut Tree,
    policy: HeightPolicy,
    base_trees: &[Tree],
) -> Result<()> {
    let n = graph.num_leaves();
    tree.validate(n)?;
    let bits: Vec<B> = tree.clade_bits(n);

    match policy {
        HeightPolicy::None => {
            for idx in 0..tree.len() {
                tree.set_height(idx, 0.0);
            }
        }
        HeightPolicy::One => {
            for (idx, clade_bits) in bits.iter().enumerate() {
                let height = match tree.vertices()[idx] {
                    Vertex::Leaf { .. } => graph
                        .clade_id(clade_bits)
                        .map_or(0.0, |id| graph.clade(id).mean_height()),
                    Vertex::Internal { children, .. } => {
                        let [l, r] = children.map(|c| tree.vertices()[c].height());
                        l.max(r) + 1.0
                    }
                };
                tree.set_height(idx, height);
            }
        }
        HeightPolicy::MeanOccurred => {
            for (idx, clade_bits) in bits.iter().enumerate() {
                match graph.clade_id(clade_bits) {
                    Some(id) => tree.set_height(idx, graph.clade(id).mean_height()),
                    None => warn!(clade = %clade_bits, "clade not in distribution, height unchanged"),
                }
            }
        }
        HeightPolicy::CommonAncestor => {
            if base_trees.is_empty() {
                return Err(CcdError::BaseTreesNotStored);
            }
            let ancestries: Vec<Ancestry<'_, B>> =
                base_trees.iter().map(|t| Ancestry::new(t, n)).collect();
            for (idx, clade_bits) in bits.iter().enumerate() {
                let height = match tree.vertices()[idx] {
                    Vertex::Leaf { taxon, .. } => mean_over(&ancestries, |a| a.leaf_height(taxon)),
                    Vertex::Internal { .. } => mean_over(&ancestries, |a| a.mrca_height(clade_bits)),
                };
                tree.set_height(idx, height);
            }
        }
    }
    Ok(())
}

/// Fair-proportion diversity index of every taxon.
///
/// Each parent-to-child edge of the graph contributes
/// `P(parent) · ccp · branch / |child|` to every taxon of the child, with
/// branch lengths taken from mean observed or common-ancestor heights.
/// Other policies give zero branch lengths. Negative branch lengths are
/// clamped to 0 with a warning.
pub(crate) fn fair_proportion_index<B: LeafSet>(
    graph: &CcdGraph<B>,
    probabilities: &[f64],
    policy: HeightPolicy,
    ca_heights: Option<&[f64]>,
) -> Result<Vec<f64>> {
    let height = |id: CladeId| -> Result<f64> {
        match policy {
            HeightPolicy::MeanOccurred => Ok(graph.clade(id).mean_height()),
            HeightPolicy::CommonAncestor => ca_heights
                .map(|h| h[id.index()])
                .ok_or(CcdError::BaseTreesNotStored),
            HeightPolicy::None | HeightPolicy::One => Ok(0.0),
        }
    };

    let mut index = vec![0.0; graph.num_leaves()];
    for parent in graph.clade_ids() {
        let p_parent = probabilities[parent.index()];
        let parent_height = height(parent)?;
        for &pid in graph.clade(parent).partitions() {
            let partition = graph.partition(pid);
            for child in partition.children() {
                let mut branch = parent_height - height(child)?;
                if branch < 0.0 {
                    warn!(
                        parent = %graph.clade(parent).bits(),
                        child = %graph.clade(child).bits(),
                        branch,
                        "negative branch length"
                    );
                    branch = 0.0;
                }
                let child_clade = graph.clade(child);
                let diversity = p_parent * partition.ccp() * branch / child_clade.size() as f64;
                for taxon in child_clade.bits().ones() {
                    index[taxon] += diversity;
                }
            }
        }
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitset::Bitset64;
    use crate::config::CcdConfig;
    use crate::fixtures::{bits64, four_taxon_trees, taxa, tree};
    use crate::propagation::{clade_probabilities, set_frequency_ratio_ccps};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn frequency_ratio_graph(trees: &[Tree]) -> (CcdGraph<Bitset64>, Vec<f64>) {
        let mut graph = CcdGraph::new(4).unwrap();
        for t in trees {
            graph.add_tree(t).unwrap();
        }
        set_frequency_ratio_ccps(&mut graph);
        let probs = clade_probabilities(&graph, &CcdConfig::default()).unwrap();
        (graph, probs)
    }

    fn timed_trees() -> Vec<Tree> {
        let taxa = taxa(4);
        vec![
            tree("((A:1,B:1):1,(C:1,D:1):1);", &taxa),
            tree("((A:1,C:1):2,(B:2,D:2):1);", &taxa),
        ]
    }

    #[test]
    fn test_map_tree_with_unit_heights() {
        let (graph, probs) = frequency_ratio_graph(&four_taxon_trees());
        let best = max_log_subtree_ccps(&graph);
        let extractor = Extractor {
            graph: &graph,
            probabilities: &probs,
            policy: HeightPolicy::One,
            ca_heights: None,
        };
        let map = extractor.extract(|id| best.choice(id)).unwrap();

        assert_eq!(map.to_newick(&taxa(4), false), "((A,B),(C,D));");
        assert!((best.value(graph.root()) - 0.75f64.ln()).abs() < 1e-12);
        let root = map.root().unwrap();
        assert_eq!(map.vertices()[root].height(), 2.0);
        assert!(matches!(
            map.vertices()[root],
            Vertex::Internal { support: Some(s), .. } if s == 1.0
        ));
        assert!(map.vertices().iter().any(|v| matches!(
            v,
            Vertex::Internal { support: Some(s), .. } if (*s - 0.75).abs() < 1e-12
        )));
    }

    #[test]
    fn test_max_sum_clade_credibility() {
        let (graph, _) = frequency_ratio_graph(&four_taxon_trees());
        let best = max_sum_clade_credibility(&graph);
        // 1 + (0.75 + 2) * 2
        assert!((best.value(graph.root()) - 6.5).abs() < 1e-12);
        let ab = graph.clade_id(&bits64(&[0, 1])).unwrap();
        let choice = best.choice(graph.root()).unwrap();
        assert!(graph.partition(choice).contains_child(ab));
    }

    #[test]
    fn test_sampling_reproduces_clade_support() {
        let (graph, probs) = frequency_ratio_graph(&four_taxon_trees());
        let extractor = Extractor {
            graph: &graph,
            probabilities: &probs,
            policy: HeightPolicy::None,
            ca_heights: None,
        };
        let mut rng = StdRng::seed_from_u64(42);
        let mut refolded: CcdGraph<Bitset64> = CcdGraph::new(4).unwrap();
        for _ in 0..4000 {
            let sample = extractor
                .extract(|id| sample_partition(&graph, id, &mut rng))
                .unwrap();
            refolded.add_tree(&sample).unwrap();
        }

        assert_eq!(refolded.num_clades(), graph.num_clades());
        for id in graph.clade_ids() {
            let bits = graph.clade(id).bits();
            let refolded_id = refolded.clade_id(bits).unwrap();
            let support = refolded.credibility(refolded_id);
            assert!((support - probs[id.index()]).abs() < 0.03, "clade {bits}: {support}");
        }
    }

    #[test]
    fn test_sampling_falls_back_to_last_partition() {
        let (mut graph, _) = frequency_ratio_graph(&four_taxon_trees());
        let root = graph.root();
        let partitions = graph.clade(root).partitions().to_vec();
        for &pid in &partitions {
            graph.set_ccp(pid, 0.0);
        }
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(
            sample_partition(&graph, root, &mut rng),
            partitions.last().copied()
        );
    }

    #[test]
    fn test_common_ancestor_heights() {
        let trees = timed_trees();
        let (graph, probs) = frequency_ratio_graph(&trees);
        let heights = common_ancestor_heights(&graph, &trees).unwrap();

        let ab = graph.clade_id(&bits64(&[0, 1])).unwrap();
        // MRCA of {A,B} is at 1 in the first tree and the root (3) in the second
        assert!((heights[ab.index()] - 2.0).abs() < 1e-12);
        assert!((heights[graph.root().index()] - 2.5).abs() < 1e-12);
        assert_eq!(heights[graph.leaf(0).unwrap().index()], 0.0);

        let extractor = Extractor {
            graph: &graph,
            probabilities: &probs,
            policy: HeightPolicy::CommonAncestor,
            ca_heights: None,
        };
        assert!(matches!(
            extractor.extract(|_| None),
            Err(CcdError::BaseTreesNotStored)
        ));
        assert!(matches!(
            common_ancestor_heights(&graph, &[]),
            Err(CcdError::BaseTreesNotStored)
        ));
    }

    #[test]
    fn test_set_heights() {
        let trees = timed_trees();
        let (graph, _) = frequency_ratio_graph(&trees);
        let taxa = taxa(4);

        let mut t = tree("((A,B),(C,D));", &taxa);
        set_heights(&graph, &mut t, HeightPolicy::MeanOccurred, &[]).unwrap();
        assert_eq!(t.to_newick(&taxa, true), "((A:1,B:1):1.5,(C:1,D:1):1.5);");

        set_heights(&graph, &mut t, HeightPolicy::CommonAncestor, &trees).unwrap();
        let root = t.root().unwrap();
        assert!((t.vertices()[root].height() - 2.5).abs() < 1e-12);

        set_heights(&graph, &mut t, HeightPolicy::One, &[]).unwrap();
        assert_eq!(t.vertices()[root].height(), 2.0);

        assert!(matches!(
            set_heights(&graph, &mut t, HeightPolicy::CommonAncestor, &[]),
            Err(CcdError::BaseTreesNotStored)
        ));
    }

    #[test]
    fn test_fair_proportion_index() {
        let trees = timed_trees();
        let (graph, probs) = frequency_ratio_graph(&trees);
        let index = fair_proportion_index(&graph, &probs, HeightPolicy::MeanOccurred, None).unwrap();
        assert!((index[0] - 2.0).abs() < 1e-12);
        assert!((index[1] - 2.0).abs() < 1e-12);

        let flat = fair_proportion_index(&graph, &probs, HeightPolicy::None, None).unwrap();
        assert!(flat.iter().all(|&x| x == 0.0));
    }
}
