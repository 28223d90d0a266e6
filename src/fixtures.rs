//! Shared test inputs.

use crate::bitset::{Bitset64, LeafSet};
use crate::tree::{TaxonSet, Tree};

/// Taxa named `A`, `B`, ... so that index order matches letter order.
pub(crate) fn taxa(n: usize) -> TaxonSet {
    TaxonSet::from_names((0..n).map(|i| char::from(b'A' + i as u8).to_string()))
}

pub(crate) fn tree(newick: &str, taxa: &TaxonSet) -> Tree {
    Tree::from_newick(newick, taxa).unwrap()
}

/// Three copies of `((A,B),(C,D))` followed by one `((A,C),(B,D))`.
pub(crate) fn four_taxon_trees() -> Vec<Tree> {
    let taxa = taxa(4);
    let mut trees = vec![tree("((A,B),(C,D));", &taxa); 3];
    trees.push(tree("((A,C),(B,D));", &taxa));
    trees
}

pub(crate) fn bits64(idx: &[usize]) -> Bitset64 {
    let mut bits = Bitset64::empty(64);
    for &i in idx {
        bits.set(i);
    }
    bits
}
