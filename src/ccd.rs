//! The public distribution type tying graph, CCP model and caches together.
//!
//! # Lazy preparation
//! Mutations (adding, removing trees) only touch occurrence counts and bump
//! the graph epoch. The first query afterwards prepares the graph once:
//!
//! 1. tidy up clades left unobserved or unreachable
//! 2. assign CCPs per [`CcpModel`] (normalized: completion pass first)
//!
//! Derived per-clade values (probabilities, best subtrees, common-ancestor
//! heights) are memoised together with the epoch they were computed at and
//! recomputed on mismatch.

use crate::bitset::{Bitset, LeafSet};
use crate::config::CcdConfig;
use crate::credible::{self, CredibleLevels, CredibleSetType, ProbabilityThresholds};
use crate::error::{CcdError, Result};
use crate::expansion::expand;
use crate::extraction::{
    self, BestSubtrees, Extractor, HeightPolicy, common_ancestor_heights, max_log_subtree_ccps,
    max_sum_clade_credibility, sample_partition,
};
use crate::graph::CcdGraph;
use crate::propagation::{self, normalize_ccps, set_frequency_ratio_ccps};
use crate::tree::Tree;
use rand::Rng;
use tracing::{debug, warn};

/// How conditional clade probabilities are assigned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CcpModel {
    /// `count(partition) / count(parent)` over the observed partitions ("CCD1").
    FrequencyRatio,
    /// Completion pass, then CCPs proportional to summed clade
    /// credibilities ("CCD0").
    Normalized,
}

/// A value computed at a given graph epoch.
#[derive(Clone, Debug, Default)]
struct Memo<T> {
    epoch: Option<u64>,
    value: T,
}

impl<T> Memo<T> {
    fn is_fresh(&self, epoch: u64) -> bool {
        self.epoch == Some(epoch)
    }

    fn store(&mut self, epoch: u64, value: T) {
        self.epoch = Some(epoch);
        self.value = value;
    }
}

/// A conditional clade distribution over `n` taxa.
///
/// # Example
/// ```
/// # use rust_tree_ccd::{Ccd, CcdConfig, CcpModel, HeightPolicy, Bitset64, TaxonSet, Tree};
/// let taxa = TaxonSet::from_names(["A", "B", "C", "D"]);
/// let trees: Vec<Tree> = ["((A,B),(C,D));", "((A,B),(C,D));", "((A,C),(B,D));"]
///     .iter()
///     .map(|nwk| Tree::from_newick(nwk, &taxa).unwrap())
///     .collect();
///
/// let mut ccd: Ccd<Bitset64> =
///     Ccd::from_trees(&trees, CcpModel::FrequencyRatio, CcdConfig::default()).unwrap();
/// let map = ccd.map_tree(HeightPolicy::None).unwrap();
/// assert_eq!(map.to_newick(&taxa, false), "((A,B),(C,D));");
/// assert!((ccd.tree_probability(&trees[2]).unwrap() - 1.0 / 3.0).abs() < 1e-12);
/// ```
#[derive(Clone, Debug)]
pub struct Ccd<B = Bitset> {
    graph: CcdGraph<B>,
    model: CcpModel,
    config: CcdConfig,
    base_trees: Vec<Tree>,
    prepared: Option<u64>,
    /// Summed subtree credibilities of the normalized model, per clade.
    sums: Memo<Vec<f64>>,
    probabilities: Memo<Vec<f64>>,
    max_log: Memo<BestSubtrees>,
    mscc: Memo<BestSubtrees>,
    ca_heights: Memo<Vec<f64>>,
}

impl<B: LeafSet> Ccd<B> {
    /// An empty distribution over `num_leaves` taxa.
    pub fn new(num_leaves: usize, model: CcpModel, config: CcdConfig) -> Result<Self> {
        config.validate()?;
        Ok(Ccd {
            graph: CcdGraph::new(num_leaves)?,
            model,
            config,
            base_trees: Vec::new(),
            prepared: None,
            sums: Memo::default(),
            probabilities: Memo::default(),
            max_log: Memo::default(),
            mscc: Memo::default(),
            ca_heights: Memo::default(),
        })
    }

    /// Builds a distribution from a batch of trees.
    ///
    /// The leading `floor(burnin · len)` trees are dropped; the taxon count
    /// is taken from the first remaining tree.
    ///
    /// # Errors
    /// No tree left after burn-in, or any tree rejected by
    /// [`CcdGraph::add_tree`].
    pub fn from_trees(trees: &[Tree], model: CcpModel, config: CcdConfig) -> Result<Self> {
        config.validate()?;
        let skip = (config.burnin * trees.len() as f64).floor() as usize;
        let kept = &trees[skip.min(trees.len())..];
        let Some(first) = kept.first() else {
            return Err(CcdError::EmptyDistribution);
        };

        let mut ccd = Ccd::new(first.num_leaves(), model, config)?;
        for tree in kept {
            ccd.add_tree(tree)?;
        }
        debug!(
            trees = kept.len(),
            burnin = skip,
            clades = ccd.graph.num_clades(),
            partitions = ccd.graph.num_partitions(),
            "built distribution"
        );
        Ok(ccd)
    }

    pub fn model(&self) -> CcpModel {
        self.model
    }

    pub fn config(&self) -> &CcdConfig {
        &self.config
    }

    pub fn num_leaves(&self) -> usize {
        self.graph.num_leaves()
    }

    pub fn num_trees(&self) -> usize {
        self.graph.num_trees()
    }

    /// Stored input trees; empty unless `store_base_trees` is set.
    pub fn base_trees(&self) -> &[Tree] {
        &self.base_trees
    }

    /// The graph as is, possibly not yet tidied or with stale CCPs.
    pub fn graph(&self) -> &CcdGraph<B> {
        &self.graph
    }

    /// The graph after tidy-up and CCP assignment.
    pub fn prepared_graph(&mut self) -> Result<&CcdGraph<B>> {
        self.prepare()?;
        Ok(&self.graph)
    }

    pub fn add_tree(&mut self, tree: &Tree) -> Result<()> {
        self.graph.add_tree(tree)?;
        if self.config.store_base_trees {
            self.base_trees.push(tree.clone());
        }
        Ok(())
    }

    /// Removes one occurrence of `tree`, tidying up right away if `tidy` is set.
    ///
    /// Under the frequency-ratio model partitions whose count drops to 0 are
    /// detached immediately. Returns false, leaving the distribution
    /// untouched, if `tree` is not part of it.
    pub fn remove_tree(&mut self, tree: &Tree, tidy: bool) -> Result<bool> {
        let prune = self.model == CcpModel::FrequencyRatio;
        if !self.graph.remove_tree(tree, prune)? {
            return Ok(false);
        }
        if self.config.store_base_trees {
            if let Some(pos) = self.base_trees.iter().position(|t| t == tree) {
                self.base_trees.remove(pos);
            }
        }
        if tidy {
            self.tidy_up();
        }
        Ok(true)
    }

    /// See [`CcdGraph::tidy_up`].
    pub fn tidy_up(&mut self) -> bool {
        self.graph.tidy_up()
    }

    fn prepare(&mut self) -> Result<()> {
        if self.prepared == Some(self.graph.epoch()) {
            return Ok(());
        }
        if self.graph.num_trees() == 0 {
            return Err(CcdError::EmptyDistribution);
        }
        if !self.graph.tidy_up() {
            warn!("some leaves are no longer reachable from the root");
        }
        match self.model {
            CcpModel::FrequencyRatio => set_frequency_ratio_ccps(&mut self.graph),
            CcpModel::Normalized => {
                expand(&mut self.graph, &self.config);
                let sums = normalize_ccps(&mut self.graph)?;
                self.sums.store(self.graph.epoch(), sums);
            }
        }
        self.prepared = Some(self.graph.epoch());
        Ok(())
    }

    fn ensure_probabilities(&mut self) -> Result<()> {
        self.prepare()?;
        let epoch = self.graph.epoch();
        if !self.probabilities.is_fresh(epoch) {
            let value = propagation::clade_probabilities(&self.graph, &self.config)?;
            self.probabilities.store(epoch, value);
        }
        Ok(())
    }

    fn ensure_max_log(&mut self) -> Result<()> {
        self.prepare()?;
        let epoch = self.graph.epoch();
        if !self.max_log.is_fresh(epoch) {
            self.max_log.store(epoch, max_log_subtree_ccps(&self.graph));
        }
        Ok(())
    }

    fn ensure_ca_heights(&mut self) -> Result<()> {
        self.prepare()?;
        if !self.config.store_base_trees || self.base_trees.len() != self.graph.num_trees() {
            return Err(CcdError::BaseTreesNotStored);
        }
        let epoch = self.graph.epoch();
        if !self.ca_heights.is_fresh(epoch) {
            let value = common_ancestor_heights(&self.graph, &self.base_trees)?;
            self.ca_heights.store(epoch, value);
        }
        Ok(())
    }

    /// Probability that a tree drawn from the distribution contains the
    /// clade; 0 for clades not in the graph.
    pub fn clade_probability(&mut self, clade: &B) -> Result<f64> {
        self.ensure_probabilities()?;
        Ok(self
            .graph
            .clade_id(clade)
            .map_or(0.0, |id| self.probabilities.value[id.index()]))
    }

    /// CCP of the partition of `parent` with `child` as one side; 0 if absent.
    pub fn ccp(&mut self, parent: &B, child: &B) -> Result<f64> {
        self.prepare()?;
        let partition = self
            .graph
            .clade_id(parent)
            .zip(self.graph.clade_id(child))
            .and_then(|(p, c)| self.graph.partition_with_child(p, c));
        Ok(partition.map_or(0.0, |pid| self.graph.partition(pid).ccp()))
    }

    pub fn entropy(&mut self) -> Result<f64> {
        self.ensure_probabilities()?;
        Ok(propagation::entropy(&self.graph, &self.probabilities.value))
    }

    /// Entropy computed recursively from the root; see
    /// [`propagation::lewis_entropy`].
    pub fn lewis_entropy(&mut self) -> Result<f64> {
        self.prepare()?;
        Ok(propagation::lewis_entropy(&self.graph))
    }

    /// Product of the CCPs of the tree's partitions; 0 if one is missing.
    pub fn tree_probability(&mut self, tree: &Tree) -> Result<f64> {
        self.prepare()?;
        propagation::tree_probability(&self.graph, tree)
    }

    pub fn contains_tree(&mut self, tree: &Tree) -> Result<bool> {
        Ok(self.tree_probability(tree)? > 0.0)
    }

    pub fn max_log_tree_probability(&mut self) -> Result<f64> {
        self.ensure_max_log()?;
        Ok(self.max_log.value.value(self.graph.root()))
    }

    /// Probability of the MAP tree; may underflow for large trees, prefer
    /// [`Ccd::max_log_tree_probability`].
    pub fn max_tree_probability(&mut self) -> Result<f64> {
        Ok(self.max_log_tree_probability()?.exp())
    }

    pub fn number_of_topologies(&mut self) -> Result<f64> {
        self.prepare()?;
        Ok(propagation::number_of_topologies(&self.graph))
    }

    /// `Σ count(π) · ln ccp(π)` over the folded trees.
    pub fn log_likelihood(&mut self) -> Result<f64> {
        self.prepare()?;
        Ok(propagation::log_likelihood(&self.graph))
    }

    /// Akaike information criterion of the model on its folded trees,
    /// `2k - 2 · log_likelihood`.
    pub fn aic_score(&mut self) -> Result<f64> {
        self.prepare()?;
        let k = propagation::number_of_parameters(&self.graph, self.model) as f64;
        Ok(2.0 * k - 2.0 * propagation::log_likelihood(&self.graph))
    }

    /// Prepares every cache an extraction with `policy` reads.
    fn prepare_extraction(&mut self, policy: HeightPolicy) -> Result<()> {
        self.ensure_probabilities()?;
        if policy == HeightPolicy::CommonAncestor {
            self.ensure_ca_heights()?;
        }
        Ok(())
    }

    fn extractor(&self, policy: HeightPolicy) -> Extractor<'_, B> {
        Extractor {
            graph: &self.graph,
            probabilities: &self.probabilities.value,
            policy,
            ca_heights: (policy == HeightPolicy::CommonAncestor)
                .then_some(self.ca_heights.value.as_slice()),
        }
    }

    /// Draws a tree with probability equal to its probability in the distribution.
    pub fn sample_tree<R: Rng + ?Sized>(&mut self, policy: HeightPolicy, rng: &mut R) -> Result<Tree> {
        self.prepare_extraction(policy)?;
        let graph = &self.graph;
        self.extractor(policy)
            .extract(|id| sample_partition(graph, id, rng))
    }

    /// The tree of maximum probability; ties go to the first partition in
    /// graph order.
    pub fn map_tree(&mut self, policy: HeightPolicy) -> Result<Tree> {
        self.ensure_max_log()?;
        self.prepare_extraction(policy)?;
        let best = &self.max_log.value;
        self.extractor(policy).extract(|id| best.choice(id))
    }

    /// The tree maximising the sum of clade credibilities.
    ///
    /// # Errors
    /// [`CcdError::Unsupported`] under the frequency-ratio model.
    pub fn mscc_tree(&mut self, policy: HeightPolicy) -> Result<Tree> {
        if self.model != CcpModel::Normalized {
            return Err(CcdError::Unsupported(
                "max sum of clade credibility trees need the normalized model".to_string(),
            ));
        }
        self.prepare()?;
        let epoch = self.graph.epoch();
        if !self.mscc.is_fresh(epoch) {
            self.mscc.store(epoch, max_sum_clade_credibility(&self.graph));
        }
        self.prepare_extraction(policy)?;
        let best = &self.mscc.value;
        self.extractor(policy).extract(|id| best.choice(id))
    }

    /// Overwrites the heights of `tree` per `policy`.
    pub fn set_heights(&mut self, tree: &mut Tree, policy: HeightPolicy) -> Result<()> {
        self.prepare()?;
        if policy == HeightPolicy::CommonAncestor && !self.config.store_base_trees {
            return Err(CcdError::BaseTreesNotStored);
        }
        extraction::set_heights(&self.graph, tree, policy, &self.base_trees)
    }

    /// Fair-proportion diversity index per taxon, see
    /// [`crate::extraction`] for the branch lengths used.
    pub fn fair_proportion_index(&mut self, policy: HeightPolicy) -> Result<Vec<f64>> {
        self.ensure_probabilities()?;
        let ca_heights = if policy == HeightPolicy::CommonAncestor {
            self.ensure_ca_heights()?;
            Some(self.ca_heights.value.as_slice())
        } else {
            None
        };
        extraction::fair_proportion_index(&self.graph, &self.probabilities.value, policy, ca_heights)
    }

    /// Credible levels of every clade and partition.
    ///
    /// # Errors
    /// [`CcdError::Unsupported`] for clade granularity under the
    /// frequency-ratio model; nothing is computed in that case.
    pub fn credible_levels(&mut self, kind: CredibleSetType) -> Result<CredibleLevels<B>> {
        if kind == CredibleSetType::Clade && self.model == CcpModel::FrequencyRatio {
            return Err(CcdError::Unsupported(
                "clade credible sets need the normalized model".to_string(),
            ));
        }
        self.prepare()?;
        credible::credible_levels(&self.graph, self.model, &self.config, kind)
    }

    /// Probability thresholds from `credible_samples` sampled trees, kept at
    /// `credible_precision` resolution.
    pub fn probability_thresholds<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
    ) -> Result<ProbabilityThresholds> {
        self.prepare_extraction(HeightPolicy::None)?;
        let graph = &self.graph;
        let extractor = self.extractor(HeightPolicy::None);
        let samples = (0..self.config.credible_samples)
            .map(|_| {
                let tree = extractor.extract(|id| sample_partition(graph, id, rng))?;
                propagation::tree_probability(graph, &tree)
            })
            .collect::<Result<Vec<f64>>>()?;
        debug!(samples = samples.len(), "sampled tree probabilities");
        Ok(ProbabilityThresholds::from_samples(
            samples,
            self.config.credible_precision,
        ))
    }

    /// Credible level of `tree` against sampled thresholds; `None` if the
    /// tree has probability 0.
    pub fn sampled_tree_level(
        &mut self,
        thresholds: &ProbabilityThresholds,
        tree: &Tree,
    ) -> Result<Option<f64>> {
        Ok(thresholds.level(self.tree_probability(tree)?))
    }

    /// Summed subtree credibility of the root under the normalized model.
    pub fn root_sum_credibility(&mut self) -> Result<Option<f64>> {
        self.prepare()?;
        Ok(match self.model {
            CcpModel::Normalized => self.sums.value.get(self.graph.root().index()).copied(),
            CcpModel::FrequencyRatio => None,
        })
    }
}
