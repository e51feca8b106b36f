//! Traits and errors of the bucket metadata store.

use std::{collections::BTreeMap, fmt::Debug};

use async_trait::async_trait;
use data_types::PartitionId;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[allow(missing_copy_implementations, missing_docs)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("bucket metadata store unavailable: {}", reason))]
    Unavailable { reason: String },

    #[snafu(display("record count of partition {} overflows", partition))]
    CountOverflow { partition: PartitionId },
}

/// A specialized `Error` for bucket metadata errors
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Access to the shared partition id to record count table.
#[async_trait]
pub trait BucketCounts: Debug + Send + Sync {
    /// The record count of `partition`, if it is registered.
    async fn get(&self, partition: PartitionId) -> Result<Option<u64>>;

    /// The counts of every registered partition among `partitions`.
    /// Unregistered partitions are absent from the result.
    async fn get_many(&self, partitions: &[PartitionId]) -> Result<BTreeMap<PartitionId, u64>>;

    /// Add `count` to the entry of `partition`, creating it if missing.
    /// Returns the new count.
    async fn add_to_bucket_count(&self, partition: PartitionId, count: u64) -> Result<u64>;

    /// Set the entry of `partition` to `count`. Setting the same value twice
    /// is harmless, which is what replayed commits rely on.
    async fn set_bucket_count(&self, partition: PartitionId, count: u64) -> Result<()>;

    /// Remove the entry of `partition`. Returns the removed count; removing
    /// a missing entry succeeds with `None`.
    async fn remove_bucket_count(&self, partition: PartitionId) -> Result<Option<u64>>;

    /// Every registered partition with its count, ordered by id.
    async fn list(&self) -> Result<Vec<(PartitionId, u64)>>;

    /// Sum of all registered counts.
    async fn total(&self) -> Result<u64> {
        Ok(self.list().await?.into_iter().map(|(_, c)| c).sum())
    }
}
