//! Crate root: module orchestration and public re-exports.
//!
//! Modules:
//! - `bitset`: leaf-set representations (`Bitset`, `Bitset64`, `Bitset128`).
//! - `tree`: binary tree arena, taxon mapping and Newick/phylotree adapters.
//! - `clade`: clades, clade partitions and their arena ids.
//! - `graph`: the clade/partition graph with fold-in, removal and tidy-up.
//! - `propagation`: CCP assignment and the probabilities derived from it.
//! - `expansion`: completion pass of the normalized model.
//! - `extraction`: sampling, MAP and MSCC trees and vertex heights.
//! - `ccd`: the `Ccd` facade with lazily refreshed caches.
//! - `credible`: credible levels of clades, partitions and trees.
//! - `config`, `error`: tunables and the shared error type.

pub mod bitset;
pub mod ccd;
pub mod clade;
pub mod config;
pub mod credible;
pub mod error;
mod expansion;
pub mod extraction;
pub mod graph;
pub mod propagation;
pub mod tree;

#[cfg(test)]
mod fixtures;

// Re-export frequently used types
pub use bitset::{Bitset, Bitset64, Bitset128, LeafSet};
pub use ccd::{Ccd, CcpModel};
pub use clade::{CladeId, PartitionId};
pub use config::CcdConfig;
pub use credible::{CredibleLevels, CredibleSetType, ProbabilityThresholds};
pub use error::{CcdError, Result};
pub use extraction::HeightPolicy;
pub use graph::{CascadeMode, CcdGraph};
pub use tree::{TaxonSet, Tree, Vertex};
