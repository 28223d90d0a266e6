//! The conditional clade distribution graph.
//!
//! # Overview
//! Vertices are [`Clade`]s (sets of taxa), hyperedges are [`CladePartition`]s
//! (splits of a clade into two children). Both live in arenas addressed by
//! [`CladeId`] / [`PartitionId`]; a `HashMap` from leaf set to clade is the
//! authoritative clade set.
//!
//! ```text
//!              {A,B,C,D}                 root clade
//!             /    |    \
//!        (AB|CD)  ...  (AC|BD)           partitions of the root
//!         /  \           /  \
//!      {A,B} {C,D}    {A,C} {B,D}        cherries
//!       / \   / \      / \   / \
//!      A   B C   D    A   C B   D        leaves (shared)
//! ```
//!
//! Removed clades and partitions stay in the arena as tombstones so that
//! handles never dangle; [`CcdGraph::clade_ids`] only yields live clades.
//!
//! Every structural change bumps [`CcdGraph::epoch`]; cached values derived
//! from the graph record the epoch they were computed at.

use crate::bitset::{Bitset, LeafSet};
use crate::clade::{Clade, CladeId, CladePartition, PartitionId, child_order};
use crate::error::{CcdError, Result};
use crate::tree::{Tree, Vertex};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, warn};

/// How [`CcdGraph::reduce`] treats leaves and the root reached by a cascade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CascadeMode {
    /// Leaves and root are kept and the graph is reported incomplete.
    Tidy,
    /// Reaching a leaf or the root is an error.
    Strict,
}

/// Elements removed by one [`CcdGraph::reduce`] call.
#[derive(Clone, Debug, Default)]
pub struct Removal {
    pub clades: Vec<CladeId>,
    pub partitions: Vec<PartitionId>,
    /// False if the cascade tried to remove a leaf or the root.
    pub complete: bool,
}

/// Arena-backed clade graph over `num_leaves` taxa.
#[derive(Clone, Debug)]
pub struct CcdGraph<B = Bitset> {
    num_leaves: usize,
    clades: Vec<Clade<B>>,
    partitions: Vec<CladePartition>,
    lookup: HashMap<B, CladeId>,
    root: CladeId,
    leaves: Vec<CladeId>,
    live_partitions: usize,
    num_trees: usize,
    epoch: u64,
}

impl<B: LeafSet> CcdGraph<B> {
    /// Creates a graph holding only the leaf clades and the root clade.
    ///
    /// # Errors
    /// Fewer than 2 taxa, or more than the leaf-set type can hold.
    pub fn new(num_leaves: usize) -> Result<Self> {
        if num_leaves < 2 {
            return Err(CcdError::TooFewTaxa(num_leaves));
        }
        if let Some(capacity) = B::CAPACITY {
            if num_leaves > capacity {
                return Err(CcdError::CapacityExceeded {
                    requested: num_leaves,
                    capacity,
                });
            }
        }

        let mut graph = CcdGraph {
            num_leaves,
            clades: Vec::with_capacity(2 * num_leaves),
            partitions: Vec::new(),
            lookup: HashMap::new(),
            root: CladeId(0),
            leaves: Vec::with_capacity(num_leaves),
            live_partitions: 0,
            num_trees: 0,
            epoch: 0,
        };
        for taxon in 0..num_leaves {
            let id = graph.get_or_create_clade(B::singleton(num_leaves, taxon));
            graph.leaves.push(id);
        }
        graph.root = graph.get_or_create_clade(B::full(num_leaves));
        Ok(graph)
    }

    pub fn num_leaves(&self) -> usize {
        self.num_leaves
    }

    /// Number of trees currently folded in.
    pub fn num_trees(&self) -> usize {
        self.num_trees
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn root(&self) -> CladeId {
        self.root
    }

    /// The leaf clade of `taxon`.
    pub fn leaf(&self, taxon: usize) -> Option<CladeId> {
        self.leaves.get(taxon).copied()
    }

    pub fn clade(&self, id: CladeId) -> &Clade<B> {
        &self.clades[id.0]
    }

    pub fn partition(&self, id: PartitionId) -> &CladePartition {
        &self.partitions[id.0]
    }

    pub fn clade_id(&self, bits: &B) -> Option<CladeId> {
        self.lookup.get(bits).copied()
    }

    /// Number of live clades, leaves and root included.
    pub fn num_clades(&self) -> usize {
        self.lookup.len()
    }

    pub fn num_partitions(&self) -> usize {
        self.live_partitions
    }

    /// Length of the clade arena; per-clade caches are sized by it.
    pub fn arena_len(&self) -> usize {
        self.clades.len()
    }

    /// Live clades in arena order.
    pub fn clade_ids(&self) -> impl Iterator<Item = CladeId> + '_ {
        self.clades
            .iter()
            .enumerate()
            .filter(|(_, c)| c.live)
            .map(|(idx, _)| CladeId(idx))
    }

    /// Live clades sorted by increasing size, ties in arena order.
    ///
    /// Every child precedes its parents in this order.
    pub fn clades_by_size(&self) -> Vec<CladeId> {
        let mut ids: Vec<CladeId> = self.clade_ids().collect();
        ids.sort_by_key(|id| self.clades[id.0].size);
        ids
    }

    pub fn is_root(&self, id: CladeId) -> bool {
        id == self.root
    }

    /// A clade present in every folded tree.
    pub fn is_monophyletic(&self, id: CladeId) -> bool {
        self.num_trees > 0 && self.clades[id.0].occurrences == self.num_trees as u64
    }

    /// Fraction of folded trees containing the clade.
    pub fn credibility(&self, id: CladeId) -> f64 {
        if self.num_trees == 0 {
            0.0
        } else {
            self.clades[id.0].occurrences as f64 / self.num_trees as f64
        }
    }

    /// The partition of `parent` splitting it into `a` and `b`, in either order.
    pub fn partition_between(&self, parent: CladeId, a: CladeId, b: CladeId) -> Option<PartitionId> {
        self.clades[parent.0].partitions.iter().copied().find(|pid| {
            let p = &self.partitions[pid.0];
            p.contains_child(a) && p.other_child(a) == b
        })
    }

    /// The unique partition of `parent` that has `child` as a child.
    pub fn partition_with_child(&self, parent: CladeId, child: CladeId) -> Option<PartitionId> {
        self.clades[parent.0]
            .partitions
            .iter()
            .copied()
            .find(|pid| self.partitions[pid.0].contains_child(child))
    }

    /// All clades below `id`, excluding `id` itself.
    pub fn descendants(&self, id: CladeId) -> Vec<CladeId> {
        let mut seen = vec![false; self.clades.len()];
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for pid in &self.clades[current.0].partitions {
                for child in self.partitions[pid.0].children {
                    if !seen[child.0] {
                        seen[child.0] = true;
                        out.push(child);
                        stack.push(child);
                    }
                }
            }
        }
        out
    }

    /// Returns the clade for `bits`, creating it if needed.
    pub(crate) fn get_or_create_clade(&mut self, bits: B) -> CladeId {
        if let Some(&id) = self.lookup.get(&bits) {
            return id;
        }
        let id = CladeId(self.clades.len());
        self.lookup.insert(bits.clone(), id);
        self.clades.push(Clade::new(bits));
        self.epoch += 1;
        id
    }

    /// Returns the partition of `parent` into `a` and `b`, creating it if needed.
    ///
    /// Idempotent: repeated calls with the children in any order return the
    /// same partition and leave the graph unchanged.
    pub(crate) fn get_or_create_partition(&mut self, parent: CladeId, a: CladeId, b: CladeId) -> PartitionId {
        if let Some(pid) = self.partition_between(parent, a, b) {
            return pid;
        }
        let children = match child_order(&self.clades[a.0], &self.clades[b.0]) {
            Ordering::Greater => [b, a],
            _ => [a, b],
        };
        let pid = PartitionId(self.partitions.len());
        self.partitions.push(CladePartition::new(parent, children));
        self.clades[parent.0].partitions.push(pid);
        for child in children {
            let parents = &mut self.clades[child.0].parents;
            if !parents.contains(&parent) {
                parents.push(parent);
            }
        }
        self.live_partitions += 1;
        self.epoch += 1;
        pid
    }

    /// Detaches a single partition from its parent and children.
    pub(crate) fn remove_partition(&mut self, pid: PartitionId) {
        if !self.partitions[pid.0].live {
            return;
        }
        self.partitions[pid.0].live = false;
        let CladePartition {
            parent, children, ..
        } = self.partitions[pid.0];
        self.clades[parent.0].partitions.retain(|p| *p != pid);
        for child in children {
            self.clades[child.0].parents.retain(|p| *p != parent);
        }
        self.live_partitions -= 1;
        self.epoch += 1;
    }

    pub(crate) fn set_ccp(&mut self, pid: PartitionId, ccp: f64) {
        self.partitions[pid.0].ccp = ccp;
    }

    /// Folds a tree into the graph.
    ///
    /// # Algorithm
    /// Walk the vertices bottom-up; each vertex's leaf set is the union of
    /// its children's. Look up or create the clade and count the occurrence
    /// (with the vertex height), then do the same for the partition formed by
    /// the two child clades.
    ///
    /// # Errors
    /// The tree is validated first and rejected without mutation if it is not
    /// a binary tree over exactly this graph's taxa.
    pub fn add_tree(&mut self, tree: &Tree) -> Result<()> {
        tree.validate(self.num_leaves)?;
        let bits: Vec<B> = tree.clade_bits(self.num_leaves);
        let mut ids: Vec<CladeId> = Vec::with_capacity(tree.len());

        for (vertex, vertex_bits) in tree.vertices().iter().zip(bits) {
            let id = self.get_or_create_clade(vertex_bits);
            self.clades[id.0].record_occurrence(vertex.height());
            if let Vertex::Internal {
                children, height, ..
            } = vertex
            {
                let pid = self.get_or_create_partition(id, ids[children[0]], ids[children[1]]);
                let partition = &mut self.partitions[pid.0];
                partition.occurrences += 1;
                partition.height_sum += height;
            }
            ids.push(id);
        }

        self.num_trees += 1;
        self.epoch += 1;
        Ok(())
    }

    /// Undoes [`CcdGraph::add_tree`] by decrementing the same counters.
    ///
    /// Partitions whose count drops to 0 are detached when
    /// `prune_empty_partitions` is set. Clades are never removed here; a
    /// subsequent [`CcdGraph::tidy_up`] drops clades left unobserved.
    ///
    /// Returns false without touching the graph if some clade or partition
    /// of `tree` has no occurrence left, i.e. the tree was never added.
    pub fn remove_tree(&mut self, tree: &Tree, prune_empty_partitions: bool) -> Result<bool> {
        tree.validate(self.num_leaves)?;
        let Some(matched) = self.match_tree(tree) else {
            warn!(
                trees = self.num_trees,
                "tree to remove is not part of the distribution, ignoring it"
            );
            return Ok(false);
        };

        for (vertex, (id, pid)) in tree.vertices().iter().zip(matched) {
            self.clades[id.0].remove_occurrence(vertex.height());
            let Some(pid) = pid else {
                continue;
            };
            let partition = &mut self.partitions[pid.0];
            partition.occurrences -= 1;
            partition.height_sum = if partition.occurrences == 0 {
                0.0
            } else {
                partition.height_sum - vertex.height()
            };
            if prune_empty_partitions && partition.occurrences == 0 {
                self.remove_partition(pid);
            }
        }

        self.num_trees -= 1;
        self.epoch += 1;
        Ok(true)
    }

    /// Clade (and, for internal vertices, partition) of every vertex of
    /// `tree`, provided each is live with a positive count.
    fn match_tree(&self, tree: &Tree) -> Option<Vec<(CladeId, Option<PartitionId>)>> {
        if self.num_trees == 0 {
            return None;
        }
        let bits: Vec<B> = tree.clade_bits(self.num_leaves);
        let mut matched: Vec<(CladeId, Option<PartitionId>)> = Vec::with_capacity(tree.len());

        for (vertex, vertex_bits) in tree.vertices().iter().zip(&bits) {
            let id = self.clade_id(vertex_bits)?;
            if self.clades[id.0].occurrences == 0 {
                return None;
            }
            let pid = match vertex {
                Vertex::Internal { children, .. } => {
                    let (a, _) = matched[children[0]];
                    let (b, _) = matched[children[1]];
                    let pid = self.partition_between(id, a, b)?;
                    if self.partitions[pid.0].occurrences == 0 {
                        return None;
                    }
                    Some(pid)
                }
                Vertex::Leaf { .. } => None,
            };
            matched.push((id, pid));
        }
        Some(matched)
    }

    /// Removes clades that are unreachable, childless or unobserved, cascading.
    ///
    /// Leaves and the root are never removed. Returns whether every leaf is
    /// still reachable from the root. Calling it on a tidy graph is a no-op.
    pub fn tidy_up(&mut self) -> bool {
        let mut complete = true;
        let mut doomed = Vec::new();

        for id in self.clade_ids() {
            let clade = &self.clades[id.0];
            if clade.is_leaf() {
                if clade.parents.is_empty() {
                    complete = false;
                }
            } else if id == self.root {
                if clade.partitions.is_empty() {
                    warn!("root clade has no partitions");
                }
            } else if clade.parents.is_empty()
                || clade.partitions.is_empty()
                || clade.occurrences == 0
            {
                doomed.push(id);
            }
        }

        if doomed.is_empty() {
            return complete;
        }
        let removal = self.cascade(doomed, CascadeMode::Tidy);
        match removal {
            Ok(removal) => {
                debug!(
                    clades = removal.clades.len(),
                    partitions = removal.partitions.len(),
                    complete = removal.complete,
                    "tidied up graph"
                );
                complete && removal.complete
            }
            // Tidy mode never fails.
            Err(_) => false,
        }
    }

    /// Removes `targets` and everything that the removal leaves dangling.
    ///
    /// # Cascade
    /// For each removed clade:
    /// - each parent loses the partition containing it; a parent left without
    ///   partitions is removed, and the partition's other child loses that
    ///   parent (and is removed once it has no parent left)
    /// - each of its own partitions is dropped; children left without a
    ///   parent are removed
    ///
    /// # Errors
    /// Explicitly requesting a leaf or the root always fails. In
    /// [`CascadeMode::Strict`] reaching one through the cascade fails too;
    /// the graph may then be partially reduced.
    pub fn reduce(&mut self, targets: Vec<CladeId>, mode: CascadeMode) -> Result<Removal> {
        for &id in &targets {
            if let Some(kind) = self.protected_kind(id) {
                return Err(CcdError::IllegalRemoval {
                    kind,
                    clade: self.clades[id.0].bits.to_string(),
                    operation: "explicit reduction",
                });
            }
        }
        self.cascade(targets, mode)
    }

    fn protected_kind(&self, id: CladeId) -> Option<&'static str> {
        if self.clades[id.0].is_leaf() {
            Some("leaf")
        } else if id == self.root {
            Some("root")
        } else {
            None
        }
    }

    fn cascade(&mut self, mut worklist: Vec<CladeId>, mode: CascadeMode) -> Result<Removal> {
        let mut removal = Removal {
            complete: true,
            ..Removal::default()
        };

        while let Some(id) = worklist.pop() {
            if let Some(kind) = self.protected_kind(id) {
                match mode {
                    CascadeMode::Tidy => {
                        warn!(kind, clade = %self.clades[id.0].bits, "cascade reached a protected clade");
                        removal.complete = false;
                        continue;
                    }
                    CascadeMode::Strict => {
                        return Err(CcdError::IllegalRemoval {
                            kind,
                            clade: self.clades[id.0].bits.to_string(),
                            operation: "cascading reduction",
                        });
                    }
                }
            }
            // A clade can be queued several times.
            if !self.clades[id.0].live {
                continue;
            }
            self.clades[id.0].live = false;
            let bits = self.clades[id.0].bits.clone();
            self.lookup.remove(&bits);
            removal.clades.push(id);

            let parents = std::mem::take(&mut self.clades[id.0].parents);
            for parent in parents {
                let Some(pid) = self.partition_with_child(parent, id) else {
                    continue;
                };
                let other = self.partitions[pid.0].other_child(id);
                self.partitions[pid.0].live = false;
                self.live_partitions -= 1;
                removal.partitions.push(pid);

                let parent_clade = &mut self.clades[parent.0];
                parent_clade.partitions.retain(|p| *p != pid);
                if parent_clade.partitions.is_empty() {
                    worklist.push(parent);
                }

                let other_clade = &mut self.clades[other.0];
                other_clade.parents.retain(|p| *p != parent);
                if other_clade.parents.is_empty() {
                    worklist.push(other);
                }
            }

            let partitions = std::mem::take(&mut self.clades[id.0].partitions);
            for pid in partitions {
                self.partitions[pid.0].live = false;
                self.live_partitions -= 1;
                removal.partitions.push(pid);
                for child in self.partitions[pid.0].children {
                    let child_clade = &mut self.clades[child.0];
                    child_clade.parents.retain(|p| *p != id);
                    if child_clade.parents.is_empty() {
                        worklist.push(child);
                    }
                }
            }
        }

        if !removal.clades.is_empty() || !removal.partitions.is_empty() {
            self.epoch += 1;
        }
        Ok(removal)
    }
}
