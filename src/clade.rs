//! Clades and clade partitions, the vertices and hyperedges of the graph.
//!
//! Both live in arenas owned by [`crate::graph::CcdGraph`] and refer to each
//! other through [`CladeId`] / [`PartitionId`] handles.

use crate::bitset::{LeafSet, lexicographic_cmp};
use std::cmp::Ordering;

/// Handle of a clade inside one graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CladeId(pub(crate) usize);

impl CladeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Handle of a clade partition inside one graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId(pub(crate) usize);

impl PartitionId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A set of taxa observed (or completed) as the leaf set of some vertex.
#[derive(Clone, Debug)]
pub struct Clade<B> {
    pub(crate) bits: B,
    pub(crate) size: usize,
    /// Outgoing partitions, i.e. the ways this clade splits into two children.
    pub(crate) partitions: Vec<PartitionId>,
    /// Clades that have a partition with this clade as a child.
    pub(crate) parents: Vec<CladeId>,
    pub(crate) occurrences: u64,
    /// Sum of vertex heights over all occurrences.
    pub(crate) height_sum: f64,
    /// False once the clade has been removed from its graph.
    pub(crate) live: bool,
}

impl<B: LeafSet> Clade<B> {
    pub(crate) fn new(bits: B) -> Self {
        let size = bits.count_ones();
        Clade {
            bits,
            size,
            partitions: Vec::new(),
            parents: Vec::new(),
            occurrences: 0,
            height_sum: 0.0,
            live: true,
        }
    }

    pub fn bits(&self) -> &B {
        &self.bits
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }

    pub fn parents(&self) -> &[CladeId] {
        &self.parents
    }

    pub fn occurrences(&self) -> u64 {
        self.occurrences
    }

    pub fn is_leaf(&self) -> bool {
        self.size == 1
    }

    pub fn is_cherry(&self) -> bool {
        self.size == 2
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Mean height over all occurrences, 0 if never observed.
    pub fn mean_height(&self) -> f64 {
        if self.occurrences == 0 {
            0.0
        } else {
            self.height_sum / self.occurrences as f64
        }
    }

    pub(crate) fn record_occurrence(&mut self, height: f64) {
        self.occurrences += 1;
        self.height_sum += height;
    }

    /// Undoes [`Clade::record_occurrence`]; returns false if the count was already 0.
    pub(crate) fn remove_occurrence(&mut self, height: f64) -> bool {
        if self.occurrences == 0 {
            return false;
        }
        self.occurrences -= 1;
        self.height_sum = if self.occurrences == 0 {
            0.0
        } else {
            self.height_sum - height
        };
        true
    }
}

/// A split of a parent clade into two disjoint children whose union is the parent.
///
/// Children are stored canonically: the smaller clade first, equal sizes
/// ordered by [`lexicographic_cmp`].
#[derive(Clone, Debug)]
pub struct CladePartition {
    pub(crate) parent: CladeId,
    pub(crate) children: [CladeId; 2],
    pub(crate) occurrences: u64,
    pub(crate) height_sum: f64,
    pub(crate) ccp: f64,
    pub(crate) live: bool,
}

impl CladePartition {
    pub(crate) fn new(parent: CladeId, children: [CladeId; 2]) -> Self {
        CladePartition {
            parent,
            children,
            occurrences: 0,
            height_sum: 0.0,
            ccp: 0.0,
            live: true,
        }
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn parent(&self) -> CladeId {
        self.parent
    }

    pub fn children(&self) -> [CladeId; 2] {
        self.children
    }

    pub fn occurrences(&self) -> u64 {
        self.occurrences
    }

    /// Conditional clade probability as of the last recomputation.
    pub fn ccp(&self) -> f64 {
        self.ccp
    }

    pub fn contains_child(&self, child: CladeId) -> bool {
        self.children[0] == child || self.children[1] == child
    }

    /// The child that is not `child`.
    pub fn other_child(&self, child: CladeId) -> CladeId {
        if self.children[0] == child {
            self.children[1]
        } else {
            self.children[0]
        }
    }

    pub fn mean_height(&self) -> f64 {
        if self.occurrences == 0 {
            0.0
        } else {
            self.height_sum / self.occurrences as f64
        }
    }
}

/// Canonical child order: smaller first, ties broken lexicographically.
pub(crate) fn child_order<B: LeafSet>(a: &Clade<B>, b: &Clade<B>) -> Ordering {
    a.size
        .cmp(&b.size)
        .then_with(|| lexicographic_cmp(&a.bits, &b.bits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitset::Bitset64;

    #[test]
    fn test_occurrence_bookkeeping() {
        let mut clade = Clade::new(Bitset64(0b0110));
        assert_eq!(clade.size(), 2);
        assert!(clade.is_cherry());

        clade.record_occurrence(2.0);
        clade.record_occurrence(4.0);
        assert_eq!(clade.occurrences(), 2);
        assert_eq!(clade.mean_height(), 3.0);

        assert!(clade.remove_occurrence(2.0));
        assert_eq!(clade.mean_height(), 4.0);
        assert!(clade.remove_occurrence(4.0));
        assert!(!clade.remove_occurrence(4.0));
        assert_eq!(clade.mean_height(), 0.0);
    }

    #[test]
    fn test_child_order() {
        let small = Clade::new(Bitset64(0b1000));
        let big = Clade::new(Bitset64(0b0110));
        assert_eq!(child_order(&small, &big), Ordering::Less);

        let left = Clade::new(Bitset64(0b0011));
        let right = Clade::new(Bitset64(0b1100));
        assert_eq!(child_order(&left, &right), Ordering::Less);
        assert_eq!(child_order(&right, &left), Ordering::Greater);
    }

    #[test]
    fn test_other_child() {
        let p = CladePartition::new(CladeId(0), [CladeId(1), CladeId(2)]);
        assert_eq!(p.other_child(CladeId(1)), CladeId(2));
        assert_eq!(p.other_child(CladeId(2)), CladeId(1));
        assert!(p.contains_child(CladeId(2)));
        assert!(!p.contains_child(CladeId(0)));
    }
}
