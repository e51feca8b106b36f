//! The partition index: a binary tree over the virtual key space whose
//! leaves map hyper-rectangular regions to partition ids.
//!
//! The tree is an immutable, versioned value ([`PartitionIndex`]): nodes
//! live in an arena and are addressed by [`NodeId`]. Refinement never
//! mutates a published version. Instead [`PartitionIndex::apply`] derives the
//! successor version in which each refined leaf has been replaced by a
//! one-level subtree, and [`SharedIndex`] swaps the published version in a
//! single step. Planners holding an older `Arc<PartitionIndex>` keep seeing
//! a consistent (if slightly stale) tree.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::PartitionId;
use snafu::Snafu;

mod build;
mod shared;
mod split;
mod tree;

pub use shared::SharedIndex;
pub use split::IndexSplit;
pub use tree::{LeafRegion, Node, NodeId, PartitionIndex};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("partition {} is not a leaf of index version {}", partition, version))]
    UnknownPartition { partition: PartitionId, version: u64 },

    #[snafu(display("attribute {} is outside the {}-dimensional key space", attribute, dimensions))]
    UnknownAttribute { attribute: usize, dimensions: usize },

    #[snafu(display(
        "no refinement possible for partition {} on attribute {}: boundary does not divide the region",
        partition,
        attribute
    ))]
    NoRefinement { partition: PartitionId, attribute: usize },

    #[snafu(display(
        "split of partition {} is stale: the leaf was replaced by another commit",
        partition
    ))]
    StaleSplit { partition: PartitionId },

    #[snafu(display("corrupt index: {}", reason))]
    Corrupt { reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
