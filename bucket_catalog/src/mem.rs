//! This module implements an in-memory bucket metadata store for testing
//! and single-node deployments.

use std::collections::BTreeMap;

use async_trait::async_trait;
use data_types::PartitionId;
use observability_deps::tracing::trace;
use snafu::OptionExt;
use tokio::sync::Mutex;

use crate::interface::{BucketCounts, CountOverflowSnafu, Result};

/// In-memory bucket counts.
#[derive(Debug, Default)]
pub struct MemBucketCounts {
    counts: Mutex<BTreeMap<PartitionId, u64>>,
}

impl MemBucketCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the table with `counts`.
    pub fn with_counts(counts: impl IntoIterator<Item = (PartitionId, u64)>) -> Self {
        Self {
            counts: Mutex::new(counts.into_iter().collect()),
        }
    }
}

#[async_trait]
impl BucketCounts for MemBucketCounts {
    async fn get(&self, partition: PartitionId) -> Result<Option<u64>> {
        Ok(self.counts.lock().await.get(&partition).copied())
    }

    async fn get_many(&self, partitions: &[PartitionId]) -> Result<BTreeMap<PartitionId, u64>> {
        let counts = self.counts.lock().await;
        Ok(partitions
            .iter()
            .filter_map(|p| counts.get(p).map(|c| (*p, *c)))
            .collect())
    }

    async fn add_to_bucket_count(&self, partition: PartitionId, count: u64) -> Result<u64> {
        let mut counts = self.counts.lock().await;
        let entry = counts.entry(partition).or_default();
        *entry = entry
            .checked_add(count)
            .context(CountOverflowSnafu { partition })?;
        trace!(%partition, count = *entry, "bucket count incremented");
        Ok(*entry)
    }

    async fn set_bucket_count(&self, partition: PartitionId, count: u64) -> Result<()> {
        self.counts.lock().await.insert(partition, count);
        trace!(%partition, count, "bucket count set");
        Ok(())
    }

    async fn remove_bucket_count(&self, partition: PartitionId) -> Result<Option<u64>> {
        let removed = self.counts.lock().await.remove(&partition);
        trace!(%partition, ?removed, "bucket count removed");
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<(PartitionId, u64)>> {
        Ok(self
            .counts
            .lock()
            .await
            .iter()
            .map(|(p, c)| (*p, *c))
            .collect())
    }
}
