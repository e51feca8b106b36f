//! Initial load of a dataset.

use std::{collections::BTreeMap, sync::Arc};

use bucket_catalog::BucketCounts;
use data_types::{Key, KeySchema, PartitionId, Record};
use futures::stream::{FuturesUnordered, TryStreamExt};
use observability_deps::tracing::info;
use partition_index::PartitionIndex;
use partition_store::PartitionStore;
use snafu::ResultExt;

use crate::{
    BuildIndexSnafu, LoadCountsSnafu, LoadKeySnafu, LoadMetadataSnafu, LoadPartitionSnafu, Result,
};

/// Default number of keys kept in the index sample.
pub const DEFAULT_SAMPLE_SIZE: usize = 10_000;

/// Partitions a record set for the first time: samples the keys, builds a
/// balanced index over the sample, writes one partition per leaf, registers
/// the counts and persists schema and index.
#[derive(Debug)]
pub struct BulkLoader {
    store: PartitionStore,
    counts: Arc<dyn BucketCounts>,
    schema: KeySchema,
    sample_size: usize,
    max_leaves: usize,
}

impl BulkLoader {
    pub fn new(store: PartitionStore, counts: Arc<dyn BucketCounts>, schema: KeySchema) -> Self {
        Self {
            store,
            counts,
            schema,
            sample_size: DEFAULT_SAMPLE_SIZE,
            max_leaves: 1,
        }
    }

    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size.max(1);
        self
    }

    pub fn with_max_leaves(mut self, max_leaves: usize) -> Self {
        self.max_leaves = max_leaves.max(1);
        self
    }

    pub async fn load(&self, records: Vec<Record>) -> Result<PartitionIndex> {
        let keys = records
            .iter()
            .map(|r| self.schema.key_of(r))
            .collect::<Result<Vec<Key>, _>>()
            .context(LoadKeySnafu)?;

        let stride = (keys.len() + self.sample_size - 1) / self.sample_size;
        let sample = keys
            .iter()
            .step_by(stride.max(1))
            .take(self.sample_size)
            .cloned()
            .collect();
        let index = PartitionIndex::build(self.schema.dimensions(), sample, self.max_leaves)
            .context(BuildIndexSnafu)?;

        let mut partitions: BTreeMap<PartitionId, Vec<Record>> = index
            .leaves()
            .into_iter()
            .map(|l| (l.partition, vec![]))
            .collect();
        for (record, key) in records.into_iter().zip(&keys) {
            partitions
                .entry(index.route(key))
                .or_default()
                .push(record);
        }

        let store = &self.store;
        let counts: Vec<(PartitionId, u64)> = partitions
            .iter()
            .map(|(partition, records)| async move {
                let partition = *partition;
                store
                    .write_partition(partition, records)
                    .await
                    .map(|n| (partition, n))
                    .context(LoadPartitionSnafu { partition })
            })
            .collect::<FuturesUnordered<_>>()
            .try_collect()
            .await?;

        for (partition, records) in &counts {
            self.counts
                .set_bucket_count(*partition, *records)
                .await
                .context(LoadCountsSnafu)?;
        }
        self.store
            .save_schema(&self.schema)
            .await
            .context(LoadMetadataSnafu)?;
        self.store
            .save_index(&index)
            .await
            .context(LoadMetadataSnafu)?;

        info!(
            records = keys.len(),
            partitions = partitions.len(),
            sample = index.sample().len(),
            "dataset loaded"
        );
        Ok(index)
    }
}
