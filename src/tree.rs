//! Binary trees fed into, and extracted from, a distribution.
//!
//! # Overview
//! The graph only needs, per internal vertex, its two children and, per leaf,
//! a taxon index in `[0, n)`. [`Tree`] stores exactly that in a post-order
//! arena: children always come before their parent and the root is the last
//! vertex. Heights and an optional support value ride along for extracted
//! trees.
//!
//! ```text
//!        4 (root)
//!       /   \
//!      2     3         vertices: [leaf 0, leaf 1, (0,1), leaf 2 ...]
//!     / \            is one valid layout; any order with children
//!    0   1             before parents is accepted
//! ```
//!
//! # CRITICAL: taxon NAMES map to indices, not node IDs
//! Node IDs are assigned during parsing and differ across inputs. Taxon
//! names are consistent, so [`TaxonSet`] sorts them alphabetically and the
//! position in that order becomes the bit index of the leaf.

use crate::bitset::LeafSet;
use crate::error::{CcdError, Result};
use phylotree::tree::Tree as PhyloTree;
use std::collections::HashMap;
use std::fmt::Write as _;

/// A vertex of a [`Tree`].
#[derive(Clone, Debug, PartialEq)]
pub enum Vertex {
    Leaf {
        taxon: usize,
        height: f64,
    },
    Internal {
        /// Indices of the two children in the tree's vertex list.
        children: [usize; 2],
        height: f64,
        /// Clade probability attached by extraction.
        support: Option<f64>,
    },
}

impl Vertex {
    pub fn height(&self) -> f64 {
        match self {
            Vertex::Leaf { height, .. } | Vertex::Internal { height, .. } => *height,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Vertex::Leaf { .. })
    }
}

/// A rooted binary tree stored in post-order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tree {
    vertices: Vec<Vertex>,
    num_leaves: usize,
}

impl Tree {
    pub fn new() -> Self {
        Tree::default()
    }

    /// Appends a leaf and returns its vertex index.
    pub fn add_leaf(&mut self, taxon: usize, height: f64) -> usize {
        self.vertices.push(Vertex::Leaf { taxon, height });
        self.num_leaves += 1;
        self.vertices.len() - 1
    }

    /// Appends an internal vertex over two earlier vertices and returns its index.
    pub fn add_internal(&mut self, left: usize, right: usize, height: f64) -> usize {
        self.vertices.push(Vertex::Internal {
            children: [left, right],
            height,
            support: None,
        });
        self.vertices.len() - 1
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn vertex(&self, idx: usize) -> Option<&Vertex> {
        self.vertices.get(idx)
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn num_leaves(&self) -> usize {
        self.num_leaves
    }

    /// Index of the root, the last vertex.
    pub fn root(&self) -> Option<usize> {
        self.vertices.len().checked_sub(1)
    }

    pub fn set_height(&mut self, idx: usize, value: f64) {
        if let Some(Vertex::Leaf { height, .. } | Vertex::Internal { height, .. }) =
            self.vertices.get_mut(idx)
        {
            *height = value;
        }
    }

    pub fn set_support(&mut self, idx: usize, value: f64) {
        if let Some(Vertex::Internal { support, .. }) = self.vertices.get_mut(idx) {
            *support = Some(value);
        }
    }

    /// Parent index of every vertex (`None` for the root).
    pub fn parents(&self) -> Vec<Option<usize>> {
        let mut parents = vec![None; self.vertices.len()];
        for (idx, vertex) in self.vertices.iter().enumerate() {
            if let Vertex::Internal { children, .. } = vertex {
                for &child in children {
                    if let Some(slot) = parents.get_mut(child) {
                        *slot = Some(idx);
                    }
                }
            }
        }
        parents
    }

    /// Checks that the tree is a well-formed binary tree over taxa `0..num_leaves`.
    ///
    /// # Checks
    /// - the tree has exactly `num_leaves` leaves, each taxon appearing once
    /// - children precede their parent
    /// - every vertex except the root is the child of exactly one vertex
    pub fn validate(&self, num_leaves: usize) -> Result<()> {
        if self.vertices.is_empty() {
            return Err(CcdError::InvalidTree("tree has no vertices".to_string()));
        }
        if self.num_leaves != num_leaves {
            return Err(CcdError::TaxonCountMismatch {
                expected: num_leaves,
                found: self.num_leaves,
            });
        }
        let mut seen_taxa = vec![false; num_leaves];
        let mut child_of = vec![0usize; self.vertices.len()];
        for (idx, vertex) in self.vertices.iter().enumerate() {
            match vertex {
                Vertex::Leaf { taxon, .. } => {
                    let seen = seen_taxa.get_mut(*taxon).ok_or_else(|| {
                        CcdError::InvalidTree(format!(
                            "taxon index {taxon} out of range for {num_leaves} taxa"
                        ))
                    })?;
                    if *seen {
                        return Err(CcdError::InvalidTree(format!(
                            "taxon {taxon} appears more than once"
                        )));
                    }
                    *seen = true;
                }
                Vertex::Internal { children, .. } => {
                    for &child in children {
                        if child >= idx {
                            return Err(CcdError::InvalidTree(format!(
                                "vertex {idx} references vertex {child} which does not precede it"
                            )));
                        }
                        child_of[child] += 1;
                    }
                }
            }
        }
        let root = self.vertices.len() - 1;
        for (idx, &count) in child_of.iter().enumerate() {
            let expected = usize::from(idx != root);
            if count != expected {
                return Err(CcdError::InvalidTree(format!(
                    "vertex {idx} is the child of {count} vertices"
                )));
            }
        }
        Ok(())
    }

    /// Leaf set of every vertex, indexed like [`Tree::vertices`].
    ///
    /// One forward pass suffices since children precede parents.
    pub fn clade_bits<B: LeafSet>(&self, num_leaves: usize) -> Vec<B> {
        let mut bits: Vec<B> = Vec::with_capacity(self.vertices.len());
        for vertex in &self.vertices {
            let b = match vertex {
                Vertex::Leaf { taxon, .. } => B::singleton(num_leaves, *taxon),
                Vertex::Internal { children, .. } => bits[children[0]].union(&bits[children[1]]),
            };
            bits.push(b);
        }
        bits
    }

    /// Builds a tree from a parsed phylotree, mapping leaf names through `taxa`.
    ///
    /// # Algorithm
    /// 1. DFS from the root, emitting children before parents
    /// 2. Accumulate root-to-vertex distances from `parent_edge` (missing = 0.0)
    /// 3. Height of a vertex = deepest leaf distance - own distance
    ///
    /// # Errors
    /// Unnamed or unknown leaves, vertices without exactly two children, and
    /// malformed phylotree trees are rejected.
    pub fn from_phylotree(tree: &PhyloTree, taxa: &TaxonSet) -> Result<Self> {
        let root_id = tree.get_root()?;
        let mut out = Tree::new();
        let mut depths = Vec::new();
        Self::convert(root_id, 0.0, tree, taxa, &mut out, &mut depths)?;

        let max_depth = depths.iter().copied().fold(0.0, f64::max);
        for (idx, depth) in depths.into_iter().enumerate() {
            out.set_height(idx, max_depth - depth);
        }
        Ok(out)
    }

    fn convert(
        node_id: usize,
        depth: f64,
        tree: &PhyloTree,
        taxa: &TaxonSet,
        out: &mut Tree,
        depths: &mut Vec<f64>,
    ) -> Result<usize> {
        let node = tree.get(&node_id)?;
        match node.children.len() {
            0 => {
                let name = node.name.as_deref().ok_or_else(|| {
                    CcdError::InvalidTree(format!("leaf node {node_id} has no name"))
                })?;
                let taxon = taxa
                    .index_of(name)
                    .ok_or_else(|| CcdError::UnknownTaxon(name.to_string()))?;
                depths.push(depth);
                Ok(out.add_leaf(taxon, 0.0))
            }
            2 => {
                let mut child_idx = [0usize; 2];
                for (slot, &child_id) in child_idx.iter_mut().zip(&node.children) {
                    let edge = tree.get(&child_id)?.parent_edge.unwrap_or(0.0);
                    *slot = Self::convert(child_id, depth + edge, tree, taxa, out, depths)?;
                }
                depths.push(depth);
                Ok(out.add_internal(child_idx[0], child_idx[1], 0.0))
            }
            children => Err(CcdError::NotBinary {
                vertex: node_id,
                children,
            }),
        }
    }

    /// Parses a Newick string, mapping leaf names through `taxa`.
    ///
    /// # Example
    /// ```
    /// # use rust_tree_ccd::tree::{TaxonSet, Tree};
    /// let taxa = TaxonSet::from_names(["A", "B", "C", "D"]);
    /// let tree = Tree::from_newick("((A,B),(C,D));", &taxa).unwrap();
    /// assert_eq!(tree.num_leaves(), 4);
    /// assert_eq!(tree.to_newick(&taxa, false), "((A,B),(C,D));");
    /// ```
    pub fn from_newick(newick: &str, taxa: &TaxonSet) -> Result<Self> {
        let parsed = PhyloTree::from_newick(newick).map_err(|e| CcdError::Newick(e.to_string()))?;
        Self::from_phylotree(&parsed, taxa)
    }

    /// Writes the tree as Newick, optionally with branch lengths from heights.
    ///
    /// Children are written in stored order; unknown taxa fall back to their index.
    pub fn to_newick(&self, taxa: &TaxonSet, branch_lengths: bool) -> String {
        let mut out = String::new();
        if let Some(root) = self.root() {
            self.write_newick(root, None, taxa, branch_lengths, &mut out);
        }
        out.push(';');
        out
    }

    fn write_newick(
        &self,
        idx: usize,
        parent_height: Option<f64>,
        taxa: &TaxonSet,
        branch_lengths: bool,
        out: &mut String,
    ) {
        let vertex = &self.vertices[idx];
        match vertex {
            Vertex::Leaf { taxon, .. } => match taxa.name(*taxon) {
                Some(name) => out.push_str(name),
                None => {
                    let _ = write!(out, "{taxon}");
                }
            },
            Vertex::Internal {
                children, height, ..
            } => {
                out.push('(');
                self.write_newick(children[0], Some(*height), taxa, branch_lengths, out);
                out.push(',');
                self.write_newick(children[1], Some(*height), taxa, branch_lengths, out);
                out.push(')');
            }
        }
        if branch_lengths {
            if let Some(parent) = parent_height {
                let _ = write!(out, ":{}", parent - vertex.height());
            }
        }
    }
}

/// Leaf sets and parent links of one tree, for repeated MRCA lookups.
#[derive(Clone, Debug)]
pub(crate) struct Ancestry<'a, B> {
    tree: &'a Tree,
    bits: Vec<B>,
    parents: Vec<Option<usize>>,
    leaf_of: Vec<usize>,
}

impl<'a, B: LeafSet> Ancestry<'a, B> {
    pub(crate) fn new(tree: &'a Tree, num_leaves: usize) -> Self {
        let mut leaf_of = vec![0; num_leaves];
        for (idx, vertex) in tree.vertices.iter().enumerate() {
            if let Vertex::Leaf { taxon, .. } = vertex {
                if let Some(slot) = leaf_of.get_mut(*taxon) {
                    *slot = idx;
                }
            }
        }
        Ancestry {
            tree,
            bits: tree.clade_bits(num_leaves),
            parents: tree.parents(),
            leaf_of,
        }
    }

    /// Most recent common ancestor of the taxa in `clade`.
    ///
    /// Walks up from the leaf of the clade's first taxon until the vertex
    /// covers the whole clade.
    pub(crate) fn mrca(&self, clade: &B) -> Option<usize> {
        let first = clade.next_set_index(0)?;
        let mut current = *self.leaf_of.get(first)?;
        loop {
            if self.bits[current].contains(clade) {
                return Some(current);
            }
            current = self.parents[current]?;
        }
    }

    pub(crate) fn mrca_height(&self, clade: &B) -> Option<f64> {
        self.mrca(clade).map(|idx| self.tree.vertices[idx].height())
    }

    pub(crate) fn leaf_height(&self, taxon: usize) -> Option<f64> {
        let idx = *self.leaf_of.get(taxon)?;
        Some(self.tree.vertices[idx].height())
    }
}

/// Alphabetically ordered taxon names and their indices.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaxonSet {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl TaxonSet {
    /// Sorts and deduplicates `names`; the sorted position is the taxon index.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();
        let index = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();
        TaxonSet { names, index }
    }

    /// Taxon set built from the leaf names of a parsed tree.
    pub fn from_phylotree(tree: &PhyloTree) -> Result<Self> {
        let mut names = Vec::new();
        for leaf_id in tree.get_leaves() {
            let name = tree.get(&leaf_id)?.name.clone().ok_or_else(|| {
                CcdError::InvalidTree(format!("leaf node {leaf_id} has no name"))
            })?;
            names.push(name);
        }
        Ok(Self::from_names(names))
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn name(&self, idx: usize) -> Option<&str> {
        self.names.get(idx).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitset::Bitset64;

    fn taxa() -> TaxonSet {
        TaxonSet::from_names(["D", "B", "A", "C"])
    }

    /// ```text
    ///        root
    ///       /    \
    ///    node1   node2
    ///    /  \    /  \
    ///   A    B  C    D
    /// ```
    #[test]
    fn test_newick_roundtrip_and_clades() {
        let taxa = taxa();
        let tree = Tree::from_newick("((A:1,B:1):2,(C:2,D:2):1);", &taxa).unwrap();
        assert!(tree.validate(4).is_ok());
        assert_eq!(tree.len(), 7);

        let bits: Vec<Bitset64> = tree.clade_bits(4);
        let root = tree.root().unwrap();
        assert_eq!(bits[root], Bitset64(0b1111));
        assert!(bits.contains(&Bitset64(0b0011)));
        assert!(bits.contains(&Bitset64(0b1100)));

        assert_eq!(tree.vertices()[root].height(), 3.0);
        assert_eq!(tree.to_newick(&taxa, false), "((A,B),(C,D));");
        assert_eq!(tree.to_newick(&taxa, true), "((A:1,B:1):2,(C:2,D:2):1);");
    }

    #[test]
    fn test_taxon_set_sorts_names() {
        let taxa = taxa();
        assert_eq!(taxa.index_of("A"), Some(0));
        assert_eq!(taxa.index_of("D"), Some(3));
        assert_eq!(taxa.name(1), Some("B"));
        assert_eq!(taxa.len(), 4);
    }

    #[test]
    fn test_rejects_unknown_taxon_and_polytomy() {
        let taxa = taxa();
        assert!(matches!(
            Tree::from_newick("((A,B),(C,E));", &taxa),
            Err(CcdError::UnknownTaxon(name)) if name == "E"
        ));
        assert!(matches!(
            Tree::from_newick("((A,B,C),D);", &taxa),
            Err(CcdError::NotBinary { children: 3, .. })
        ));
    }

    #[test]
    fn test_validate_catches_bad_layouts() {
        let mut tree = Tree::new();
        let a = tree.add_leaf(0, 0.0);
        let b = tree.add_leaf(0, 0.0);
        tree.add_internal(a, b, 1.0);
        assert!(tree.validate(2).is_err());

        let mut tree = Tree::new();
        let a = tree.add_leaf(0, 0.0);
        tree.add_leaf(1, 0.0);
        tree.add_internal(a, a, 1.0);
        assert!(tree.validate(2).is_err());

        let mut tree = Tree::new();
        let a = tree.add_leaf(0, 0.0);
        let b = tree.add_leaf(1, 0.0);
        tree.add_internal(a, b, 1.0);
        assert!(tree.validate(2).is_ok());
        assert!(matches!(
            tree.validate(3),
            Err(CcdError::TaxonCountMismatch { expected: 3, found: 2 })
        ));
    }

    #[test]
    fn test_mrca_heights() {
        let taxa = taxa();
        let tree = Tree::from_newick("(((A:1,B:1):1,C:2):1,D:3);", &taxa).unwrap();
        let ancestry: Ancestry<'_, Bitset64> = Ancestry::new(&tree, 4);

        assert_eq!(ancestry.mrca_height(&Bitset64(0b0011)), Some(1.0));
        // {A,C} is not a clade; its MRCA is the {A,B,C} vertex
        assert_eq!(ancestry.mrca_height(&Bitset64(0b0101)), Some(2.0));
        assert_eq!(ancestry.mrca_height(&Bitset64(0b1001)), Some(3.0));
        assert_eq!(ancestry.mrca(&Bitset64(0)), None);
        assert_eq!(ancestry.leaf_height(2), Some(0.0));
    }

    #[test]
    fn test_parents() {
        let taxa = taxa();
        let tree = Tree::from_newick("((A,B),(C,D));", &taxa).unwrap();
        let parents = tree.parents();
        let root = tree.root().unwrap();
        assert_eq!(parents[root], None);
        assert_eq!(parents.iter().filter(|p| **p == Some(root)).count(), 2);
    }
}
