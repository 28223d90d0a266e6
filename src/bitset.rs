//! Compact bit-vector representation of leaf sets (clades).
//!
//! # Overview
//! A clade is identified by the set of taxa below it. Each bit position
//! corresponds to a taxon index, so the leaf set doubles as the clade's key
//! in the graph's lookup map.
//!
//! # Example
//! For taxa [A, B, C, D] mapped to indices [0, 1, 2, 3]:
//! - Clade {A, C} → bitset `0b0101` (bits 0 and 2 set)
//! - Clade {B, C, D} → bitset `0b1110` (bits 1, 2, 3 set)
//!
//! # Specializations
//! [`Bitset64`] and [`Bitset128`] store the set inline in a single integer and
//! are the fast path for up to 64 / 128 taxa. [`Bitset`] keeps a `Vec<u64>` of
//! words and supports any number of taxa. All three implement [`LeafSet`].

use std::cmp::Ordering;
use std::fmt;
use std::hash::Hash;

/// Operations every leaf-set representation supports.
///
/// Once a leaf set is used as a map key it must not be mutated; the graph
/// only ever mutates scratch copies.
pub trait LeafSet: Clone + Eq + Hash + Ord + fmt::Debug + fmt::Display + Send + Sync {
    /// Largest number of taxa the representation can hold, `None` if unbounded.
    const CAPACITY: Option<usize>;

    /// The empty set, sized for `num_leaves` taxa.
    fn empty(num_leaves: usize) -> Self;

    fn set(&mut self, idx: usize);

    fn get(&self, idx: usize) -> bool;

    /// Removes every taxon.
    fn clear(&mut self);

    /// `self = self ∪ other`
    fn or_assign(&mut self, other: &Self);

    /// `self = self ∩ other`
    fn and_assign(&mut self, other: &Self);

    /// `self = self \ other`
    fn and_not_assign(&mut self, other: &Self);

    /// `self = self ⊕ other`
    fn xor_assign(&mut self, other: &Self);

    /// Cardinality of the set.
    fn count_ones(&self) -> usize;

    /// Index of the first set bit at or after `from`.
    fn next_set_index(&self, from: usize) -> Option<usize>;

    fn is_empty(&self) -> bool;

    /// The set `{0, .., num_leaves - 1}`.
    fn full(num_leaves: usize) -> Self {
        let mut bits = Self::empty(num_leaves);
        for idx in 0..num_leaves {
            bits.set(idx);
        }
        bits
    }

    fn singleton(num_leaves: usize, idx: usize) -> Self {
        let mut bits = Self::empty(num_leaves);
        bits.set(idx);
        bits
    }

    /// Whether `other ⊆ self`.
    fn contains(&self, other: &Self) -> bool {
        let mut inter = self.clone();
        inter.and_assign(other);
        &inter == other
    }

    fn disjoint(&self, other: &Self) -> bool {
        let mut inter = self.clone();
        inter.and_assign(other);
        inter.is_empty()
    }

    fn union(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.or_assign(other);
        out
    }

    fn symmetric_difference(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.xor_assign(other);
        out
    }

    /// Iterates over the set taxon indices in increasing order.
    fn ones(&self) -> Ones<'_, Self> {
        Ones {
            bits: self,
            next: 0,
        }
    }
}

/// Iterator over set bits, see [`LeafSet::ones`].
pub struct Ones<'a, B: LeafSet> {
    bits: &'a B,
    next: usize,
}

impl<B: LeafSet> Iterator for Ones<'_, B> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let idx = self.bits.next_set_index(self.next)?;
        self.next = idx + 1;
        Some(idx)
    }
}

/// Whether the two sets overlap without either containing the other.
///
/// Two clades that intersect properly cannot appear in the same tree.
///
/// # Example
/// ```
/// # use rust_tree_ccd::bitset::{intersects_properly, Bitset64, LeafSet};
/// let a = Bitset64(0b0011);
/// assert!(intersects_properly(&a, &Bitset64(0b0110)));
/// assert!(!intersects_properly(&a, &Bitset64(0b1100)));
/// assert!(!intersects_properly(&a, &Bitset64(0b0111)));
/// ```
pub fn intersects_properly<B: LeafSet>(a: &B, b: &B) -> bool {
    let mut inter = a.clone();
    inter.and_assign(b);
    !inter.is_empty() && &inter != a && &inter != b
}

/// Total order used to break ties between equal-size children.
///
/// `a` comes first when the smallest taxon in exactly one of the two sets
/// belongs to `a`; a side with nothing exclusive (a subset) comes first.
pub fn lexicographic_cmp<B: LeafSet>(a: &B, b: &B) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    let mut only_a = a.clone();
    only_a.and_not_assign(b);
    let mut only_b = b.clone();
    only_b.and_not_assign(a);
    // None (nothing exclusive) sorts before any index.
    match only_a.next_set_index(0).cmp(&only_b.next_set_index(0)) {
        Ordering::Greater => Ordering::Greater,
        _ => Ordering::Less,
    }
}

/// Returns whichever of `a` and `b` comes first under [`lexicographic_cmp`].
pub fn lexicographic_first<'a, B: LeafSet>(a: &'a B, b: &'a B) -> &'a B {
    match lexicographic_cmp(a, b) {
        Ordering::Greater => b,
        _ => a,
    }
}

fn write_indices(f: &mut fmt::Formatter<'_>, indices: impl Iterator<Item = usize>) -> fmt::Result {
    f.write_str("{")?;
    for (i, idx) in indices.enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{idx}")?;
    }
    f.write_str("}")
}

/// A growable bitset for any number of taxa.
///
/// Internally stores bits in `Vec<u64>` words; each word holds 64 taxon indices.
///
/// # Memory efficiency
/// - `HashSet<usize>`: ~24 bytes per element + overhead
/// - `Bitset`: 1 bit per possible element (8 bytes per 64 taxa)
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Bitset(pub Vec<u64>);

impl Bitset {
    /// Creates a new bitset with all bits set to 0.
    ///
    /// # Parameters
    /// - `words`: Number of u64 words needed. Calculate as `num_leaves.div_ceil(64)`
    ///
    /// # Example
    /// ```
    /// # use rust_tree_ccd::bitset::Bitset;
    /// // For a tree with 100 leaves, need 2 words (128 bits)
    /// let bs = Bitset::zeros(2);
    /// assert_eq!(bs.0.len(), 2);
    /// ```
    pub fn zeros(words: usize) -> Self {
        Bitset(vec![0u64; words])
    }
}

impl LeafSet for Bitset {
    const CAPACITY: Option<usize> = None;

    fn empty(num_leaves: usize) -> Self {
        Bitset::zeros(num_leaves.div_ceil(64))
    }

    /// Sets the bit at the given index to 1.
    ///
    /// # Example
    /// ```
    /// # use rust_tree_ccd::bitset::{Bitset, LeafSet};
    /// let mut bs = Bitset::zeros(1);
    /// bs.set(0);
    /// bs.set(5);
    /// assert_eq!(bs.0[0], 0b00100001);
    /// ```
    #[inline]
    fn set(&mut self, idx: usize) {
        let word = idx >> 6; // idx / 64
        let bit = idx & 63; // idx % 64
        self.0[word] |= 1u64 << bit;
    }

    #[inline]
    fn get(&self, idx: usize) -> bool {
        self.0
            .get(idx >> 6)
            .is_some_and(|w| w & (1u64 << (idx & 63)) != 0)
    }

    fn clear(&mut self) {
        self.0.iter_mut().for_each(|w| *w = 0);
    }

    /// Performs bitwise OR with another bitset (union operation).
    ///
    /// # Example
    /// ```
    /// # use rust_tree_ccd::bitset::{Bitset, LeafSet};
    /// let mut left = Bitset::zeros(1);
    /// left.set(0);   // {0}
    ///
    /// let mut right = Bitset::zeros(1);
    /// right.set(1);  // {1}
    ///
    /// left.or_assign(&right);  // {0} ∪ {1} = {0, 1}
    /// assert_eq!(left.0[0], 0b11);
    /// ```
    #[inline]
    fn or_assign(&mut self, other: &Self) {
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a |= *b;
        }
    }

    #[inline]
    fn and_assign(&mut self, other: &Self) {
        for (i, a) in self.0.iter_mut().enumerate() {
            *a &= other.0.get(i).copied().unwrap_or(0);
        }
    }

    #[inline]
    fn and_not_assign(&mut self, other: &Self) {
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a &= !*b;
        }
    }

    #[inline]
    fn xor_assign(&mut self, other: &Self) {
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a ^= *b;
        }
    }

    #[inline]
    fn count_ones(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    fn next_set_index(&self, from: usize) -> Option<usize> {
        let mut word = from >> 6;
        let mut current = *self.0.get(word)? & (!0u64 << (from & 63));
        loop {
            if current != 0 {
                return Some((word << 6) + current.trailing_zeros() as usize);
            }
            word += 1;
            current = *self.0.get(word)?;
        }
    }

    fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    fn contains(&self, other: &Self) -> bool {
        other
            .0
            .iter()
            .enumerate()
            .all(|(i, b)| self.0.get(i).copied().unwrap_or(0) & b == *b)
    }

    fn disjoint(&self, other: &Self) -> bool {
        self.0.iter().zip(&other.0).all(|(a, b)| a & b == 0)
    }
}

impl fmt::Display for Bitset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_indices(f, self.ones())
    }
}

/// Leaf set for up to 64 taxa, stored inline.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Bitset64(pub u64);

impl LeafSet for Bitset64 {
    const CAPACITY: Option<usize> = Some(64);

    fn empty(_num_leaves: usize) -> Self {
        Bitset64(0)
    }

    #[inline]
    fn set(&mut self, idx: usize) {
        self.0 |= 1u64 << idx;
    }

    #[inline]
    fn get(&self, idx: usize) -> bool {
        idx < 64 && self.0 & (1u64 << idx) != 0
    }

    fn clear(&mut self) {
        self.0 = 0;
    }

    #[inline]
    fn or_assign(&mut self, other: &Self) {
        self.0 |= other.0;
    }

    #[inline]
    fn and_assign(&mut self, other: &Self) {
        self.0 &= other.0;
    }

    #[inline]
    fn and_not_assign(&mut self, other: &Self) {
        self.0 &= !other.0;
    }

    #[inline]
    fn xor_assign(&mut self, other: &Self) {
        self.0 ^= other.0;
    }

    #[inline]
    fn count_ones(&self) -> usize {
        self.0.count_ones() as usize
    }

    fn next_set_index(&self, from: usize) -> Option<usize> {
        if from >= 64 {
            return None;
        }
        let rest = self.0 & (!0u64 << from);
        (rest != 0).then(|| rest.trailing_zeros() as usize)
    }

    fn is_empty(&self) -> bool {
        self.0 == 0
    }

    fn contains(&self, other: &Self) -> bool {
        self.0 & other.0 == other.0
    }

    fn disjoint(&self, other: &Self) -> bool {
        self.0 & other.0 == 0
    }
}

impl fmt::Display for Bitset64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_indices(f, self.ones())
    }
}

/// Leaf set for up to 128 taxa, stored inline.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Bitset128(pub u128);

impl LeafSet for Bitset128 {
    const CAPACITY: Option<usize> = Some(128);

    fn empty(_num_leaves: usize) -> Self {
        Bitset128(0)
    }

    #[inline]
    fn set(&mut self, idx: usize) {
        self.0 |= 1u128 << idx;
    }

    #[inline]
    fn get(&self, idx: usize) -> bool {
        idx < 128 && self.0 & (1u128 << idx) != 0
    }

    fn clear(&mut self) {
        self.0 = 0;
    }

    #[inline]
    fn or_assign(&mut self, other: &Self) {
        self.0 |= other.0;
    }

    #[inline]
    fn and_assign(&mut self, other: &Self) {
        self.0 &= other.0;
    }

    #[inline]
    fn and_not_assign(&mut self, other: &Self) {
        self.0 &= !other.0;
    }

    #[inline]
    fn xor_assign(&mut self, other: &Self) {
        self.0 ^= other.0;
    }

    #[inline]
    fn count_ones(&self) -> usize {
        self.0.count_ones() as usize
    }

    fn next_set_index(&self, from: usize) -> Option<usize> {
        if from >= 128 {
            return None;
        }
        let rest = self.0 & (!0u128 << from);
        (rest != 0).then(|| rest.trailing_zeros() as usize)
    }

    fn is_empty(&self) -> bool {
        self.0 == 0
    }

    fn contains(&self, other: &Self) -> bool {
        self.0 & other.0 == other.0
    }

    fn disjoint(&self, other: &Self) -> bool {
        self.0 & other.0 == 0
    }
}

impl fmt::Display for Bitset128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_indices(f, self.ones())
    }
}
