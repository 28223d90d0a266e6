//! Error type shared by every module of the crate.

use phylotree::tree::TreeError;
use thiserror::Error;

/// Errors raised while building or querying a conditional clade distribution.
#[derive(Debug, Error)]
pub enum CcdError {
    #[error("a distribution needs at least 2 taxa, got {0}")]
    TooFewTaxa(usize),

    #[error("{requested} taxa exceed the {capacity}-taxon capacity of the leaf-set type")]
    CapacityExceeded { requested: usize, capacity: usize },

    #[error("invalid tree: {0}")]
    InvalidTree(String),

    #[error("tree vertex {vertex} has {children} children, only binary trees are supported")]
    NotBinary { vertex: usize, children: usize },

    #[error("unknown taxon `{0}`")]
    UnknownTaxon(String),

    #[error("tree has {found} taxa but the distribution covers {expected}")]
    TaxonCountMismatch { expected: usize, found: usize },

    #[error("newick parse error: {0}")]
    Newick(String),

    #[error("cannot remove {kind} clade {clade} during {operation}")]
    IllegalRemoval {
        kind: &'static str,
        clade: String,
        operation: &'static str,
    },

    #[error(
        "probability {value} of clade {child} exceeds 1 via partition {partition} of parent {parent}"
    )]
    InvalidProbability {
        value: f64,
        parent: String,
        child: String,
        partition: String,
    },

    #[error("cherry {0} has no partition")]
    MissingCherryPartition(String),

    #[error("clade {0} has zero summed credibility over its partitions")]
    ZeroCredibility(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("the distribution contains no trees")]
    EmptyDistribution,

    #[error("base trees were not stored; enable `store_base_trees` in the configuration")]
    BaseTreesNotStored,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<TreeError> for CcdError {
    fn from(err: TreeError) -> Self {
        CcdError::InvalidTree(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CcdError>;
