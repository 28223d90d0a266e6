//! Completion pass for the normalized model.
//!
//! Adds every partition whose parent and both children are clades of the
//! graph but which was never observed in a tree.
//!
//! # Algorithm
//! 1. Sort clades by size and bucket them by cardinality
//! 2. For each parent (skipping leaves and cherries) and each `j` in
//!    `1..=size/2`, test every clade `S` of size `j` that is contained in the
//!    parent and not yet one of its children
//! 3. If the partner `parent ⊕ S` is a clade, create the partition
//!
//! Clades below a monophyletic clade `M` are dropped from the buckets once
//! `M` has been handled: a larger parent splitting off such a clade would
//! need a partner that overlaps `M` without containing it, which cannot be a
//! clade. The pruning therefore never changes the result.
//!
//! # Parallelism
//! Large graphs scan parents on the rayon pool. The scan is read-only and
//! partitions are created afterwards in parent order, so the completed graph
//! (arena layout included) equals the one built by the sequential sweep.

use crate::bitset::LeafSet;
use crate::clade::CladeId;
use crate::config::CcdConfig;
use crate::graph::CcdGraph;
use rayon::prelude::*;
use tracing::debug;

/// Runs the completion pass and returns the number of partitions created.
pub(crate) fn expand<B: LeafSet>(graph: &mut CcdGraph<B>, config: &CcdConfig) -> usize {
    let parallel = graph.num_clades() >= config.parallel_expansion_threshold
        && rayon::current_num_threads() > 1;
    expand_with(graph, parallel)
}

fn expand_with<B: LeafSet>(graph: &mut CcdGraph<B>, parallel: bool) -> usize {
    let before = graph.num_partitions();
    let clades = graph.clades_by_size();

    let mut buckets: Vec<Vec<CladeId>> = vec![Vec::new(); graph.num_leaves()];
    for &id in &clades {
        buckets[graph.clade(id).size() - 1].push(id);
    }

    if parallel {
        let found: Vec<Vec<(CladeId, CladeId)>> = {
            let graph = &*graph;
            (0..clades.len())
                .into_par_iter()
                .map(|i| find_partitions(graph, &buckets, None, clades[i]))
                .collect()
        };
        for (&parent, pairs) in clades.iter().zip(found) {
            for (small, large) in pairs {
                graph.get_or_create_partition(parent, small, large);
            }
        }
    } else {
        let mut pruned = vec![false; graph.arena_len()];
        for &parent in &clades {
            let pairs = find_partitions(graph, &buckets, Some(pruned.as_slice()), parent);
            for (small, large) in pairs {
                graph.get_or_create_partition(parent, small, large);
            }
            if graph.is_monophyletic(parent) && !graph.is_root(parent) {
                for descendant in graph.descendants(parent) {
                    pruned[descendant.index()] = true;
                }
            }
        }
    }

    let created = graph.num_partitions() - before;
    debug!(
        clades = clades.len(),
        created,
        parallel,
        "expanded graph"
    );
    created
}

/// Candidate `(small, large)` child pairs for `parent`.
fn find_partitions<B: LeafSet>(
    graph: &CcdGraph<B>,
    buckets: &[Vec<CladeId>],
    pruned: Option<&[bool]>,
    parent: CladeId,
) -> Vec<(CladeId, CladeId)> {
    let clade = graph.clade(parent);
    // leaves have no partition and cherries exactly one
    if clade.is_leaf() || clade.is_cherry() {
        return Vec::new();
    }
    let parent_bits = clade.bits();
    let mut pairs = Vec::new();

    for j in 1..=clade.size() / 2 {
        for &small in &buckets[j - 1] {
            if pruned.is_some_and(|p| p[small.index()]) {
                continue;
            }
            let small_clade = graph.clade(small);
            if !parent_bits.contains(small_clade.bits()) || small_clade.parents().contains(&parent) {
                continue;
            }
            let partner = parent_bits.symmetric_difference(small_clade.bits());
            if let Some(large) = graph.clade_id(&partner) {
                pairs.push((small, large));
            }
        }
    }
    pairs
}
