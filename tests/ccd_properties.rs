//! Property-based tests for distribution invariants on random binary trees.

use proptest::prelude::*;
use proptest::sample::Index;
use proptest::test_runner::TestCaseError;
use rust_tree_ccd::{
    Bitset64, Ccd, CcdConfig, CcdGraph, CcpModel, CladeId, CredibleLevels, CredibleSetType,
    HeightPolicy, LeafSet, Tree,
};

/// Joins two random pending subtrees until one is left.
fn build_tree(num_leaves: usize, merges: &[(Index, Index)]) -> Tree {
    let mut tree = Tree::new();
    let mut pending: Vec<usize> = (0..num_leaves).map(|taxon| tree.add_leaf(taxon, 0.0)).collect();
    for (step, (a, b)) in merges.iter().enumerate() {
        let left = pending.swap_remove(a.index(pending.len()));
        let right = pending.swap_remove(b.index(pending.len()));
        pending.push(tree.add_internal(left, right, (step + 1) as f64));
    }
    tree
}

fn trees_strategy() -> impl Strategy<Value = (usize, Vec<Tree>)> {
    (5usize..=12).prop_flat_map(|num_leaves| {
        let tree = prop::collection::vec((any::<Index>(), any::<Index>()), num_leaves - 1)
            .prop_map(move |merges| build_tree(num_leaves, &merges));
        (Just(num_leaves), prop::collection::vec(tree, 1..10))
    })
}

fn build(trees: &[Tree], model: CcpModel) -> Ccd<Bitset64> {
    Ccd::from_trees(trees, model, CcdConfig::default()).expect("valid random trees")
}

fn check_partitions(graph: &CcdGraph<Bitset64>) -> Result<(), TestCaseError> {
    for id in graph.clade_ids() {
        let clade = graph.clade(id);
        if clade.is_leaf() {
            prop_assert!(clade.partitions().is_empty());
            continue;
        }
        prop_assert!(!clade.partitions().is_empty(), "clade {} has no partition", clade.bits());
        let mut sum = 0.0;
        for &pid in clade.partitions() {
            let partition = graph.partition(pid);
            let [a, b] = partition.children();
            let (a, b) = (graph.clade(a).bits(), graph.clade(b).bits());
            prop_assert_eq!(a.count_ones() + b.count_ones(), clade.size());
            prop_assert!(a.disjoint(b));
            prop_assert_eq!(&a.union(b), clade.bits());
            sum += partition.ccp();
        }
        prop_assert!((sum - 1.0).abs() < 1e-9, "CCPs of {} sum to {sum}", clade.bits());
    }
    Ok(())
}

/// Every clade has a parent of lower or equal level; the root holds the minimum.
fn check_levels(
    graph: &CcdGraph<Bitset64>,
    levels: &CredibleLevels<Bitset64>,
) -> Result<(), TestCaseError> {
    let level_of = |id: CladeId| levels.clade_level(graph.clade(id).bits());
    let root_level = level_of(graph.root()).expect("root has a level");
    for id in graph.clade_ids() {
        let level = level_of(id).expect("every clade has a level");
        prop_assert!(level > 0.0 && level <= 1.0 + 1e-12, "level {level}");
        prop_assert!(level >= root_level - 1e-12);
        let min_parent = graph
            .clade(id)
            .parents()
            .iter()
            .filter_map(|&parent| level_of(parent))
            .reduce(f64::min);
        if let Some(min_parent) = min_parent {
            prop_assert!(
                min_parent <= level + 1e-12,
                "clade {} at {level} outlives all parents (min {min_parent})",
                graph.clade(id).bits()
            );
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prepared_graphs_are_well_formed((_, trees) in trees_strategy()) {
        for model in [CcpModel::FrequencyRatio, CcpModel::Normalized] {
            let mut ccd = build(&trees, model);
            check_partitions(ccd.prepared_graph().unwrap())?;

            for tree in &trees {
                let p = ccd.tree_probability(tree).unwrap();
                prop_assert!(p > 0.0 && p <= 1.0 + 1e-9, "folded tree has probability {p}");
            }
            let entropy = ccd.entropy().unwrap();
            let lewis = ccd.lewis_entropy().unwrap();
            prop_assert!((entropy - lewis).abs() < 1e-9, "{entropy} vs {lewis}");
        }
    }

    #[test]
    fn tidy_up_is_idempotent_after_removals(
        (_, trees) in trees_strategy(),
        keep in prop::collection::vec(any::<bool>(), 10),
    ) {
        let mut ccd = build(&trees, CcpModel::FrequencyRatio);
        let mut kept = vec![trees[0].clone()];
        for (tree, keep) in trees.iter().zip(&keep).skip(1) {
            if *keep {
                kept.push(tree.clone());
            } else {
                prop_assert!(ccd.remove_tree(tree, false).unwrap());
            }
        }

        prop_assert!(ccd.tidy_up());
        let graph = ccd.graph();
        let snapshot = (graph.num_clades(), graph.num_partitions(), graph.epoch());
        prop_assert!(ccd.tidy_up());
        let graph = ccd.graph();
        prop_assert_eq!((graph.num_clades(), graph.num_partitions(), graph.epoch()), snapshot);

        prop_assert_eq!(ccd.num_trees(), kept.len());
        check_partitions(ccd.prepared_graph().unwrap())?;
        for tree in &kept {
            prop_assert!(ccd.tree_probability(tree).unwrap() > 0.0);
        }
    }

    #[test]
    fn credible_levels_are_monotone((_, trees) in trees_strategy()) {
        for (model, kind) in [
            (CcpModel::FrequencyRatio, CredibleSetType::Partition),
            (CcpModel::Normalized, CredibleSetType::Partition),
            (CcpModel::Normalized, CredibleSetType::Clade),
        ] {
            let mut ccd = build(&trees, model);
            let levels = ccd.credible_levels(kind).unwrap();
            let graph = ccd.prepared_graph().unwrap();
            prop_assert_eq!(levels.clade_levels().len(), graph.num_clades());
            check_levels(graph, &levels)?;
            for tree in &trees {
                prop_assert!(levels.tree_level(tree).unwrap().is_some());
            }
        }
    }

    #[test]
    fn granularities_cover_the_same_elements((_, trees) in trees_strategy()) {
        let mut ccd = build(&trees, CcpModel::Normalized);
        let by_clade = ccd.credible_levels(CredibleSetType::Clade).unwrap();
        let by_partition = ccd.credible_levels(CredibleSetType::Partition).unwrap();

        let mut clade_keys: Vec<_> = by_clade.clade_levels().keys().collect();
        let mut partition_keys: Vec<_> = by_partition.clade_levels().keys().collect();
        clade_keys.sort();
        partition_keys.sort();
        prop_assert_eq!(clade_keys, partition_keys);
        prop_assert_eq!(
            by_clade.partition_levels().len(),
            by_partition.partition_levels().len()
        );

        // both contain the MAP tree
        let map = ccd.map_tree(HeightPolicy::None).unwrap();
        let graph = ccd.prepared_graph().unwrap();
        let root = graph.clade(graph.root()).bits();
        for levels in [&by_clade, &by_partition] {
            let tree_level = levels.tree_level(&map).unwrap();
            prop_assert!(tree_level.is_some());
            prop_assert!(tree_level.unwrap() >= levels.clade_level(root).unwrap() - 1e-12);
        }
    }
}
