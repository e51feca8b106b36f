//! The optimizer.
//!
//! Turns a query (in virtual attribute space) into the [`PartitionSplit`]s a
//! compute layer executes in parallel. In access mode the plan only reads.
//! In adapt mode leaves that are much larger than the query's selective
//! sub-range are additionally scheduled for refinement: their split carries
//! a [`RepartitionPlan`] describing how to divide them.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use serde::{Deserialize, Serialize};
use snafu::Snafu;

mod grouping;
mod ids;
mod optimizer;
mod plan;

pub use ids::ClusterIds;
pub use optimizer::Optimizer;
pub use plan::{PartitionSplit, ReadStrategy, RepartitionPlan};

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display(
        "predicate on attribute {} but the index has {} dimensions",
        attribute,
        dimensions
    ))]
    UnknownAttribute { attribute: usize, dimensions: usize },

    #[snafu(display("error reading bucket counts: {}", source))]
    BucketCounts { source: bucket_catalog::Error },

    #[snafu(display("error taking the partition id lease: {}", source))]
    IdLease { source: partition_lock::Error },

    #[snafu(display("error updating the partition id counter: {}", source))]
    IdCounter { source: partition_store::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Split sizing and refinement tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// A split below this many records is merged into an adjacent split of
    /// the same read strategy even if that overshoots `max_split_records`.
    pub min_split_records: u64,
    /// Target upper bound of records per split.
    pub max_split_records: u64,
    /// Leaves with fewer records are never refined.
    pub min_refine_records: u64,
    /// A leaf is refined only when at most this fraction of its records is
    /// estimated to satisfy the query.
    pub max_refine_selectivity: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            min_split_records: 4_000_000,
            max_split_records: 8_000_000,
            min_refine_records: 1000,
            max_refine_selectivity: 0.5,
        }
    }
}
