//! Datasets to run queries against.

use std::{collections::HashSet, fmt::Debug, sync::Arc};

use access_method::{AccessMethod, QueryConf};
use async_trait::async_trait;
use bucket_catalog::{BucketCounts, MemBucketCounts};
use data_types::{DataType, KeyAttribute, KeySchema, PartitionId, Query, Record, TypedValue};
use object_store::{disk::LocalFileSystem, memory::InMemory, ObjectStore};
use partition_index::PartitionIndex;
use partition_lock::MemCoordinator;
use partition_store::PartitionStore;
use repartition::BulkLoader;
use tempfile::TempDir;

const WORKING_DIR: &str = "dataset";
const REPLICA_ID: &str = "0";

/// A fully initialised dataset plus everything needed to check it.
#[derive(Debug)]
pub struct DatasetScenario {
    pub scenario_name: String,
    pub access: AccessMethod,
    /// Every record loaded, for brute force comparisons.
    pub records: Vec<Record>,
    pub counts: Arc<MemBucketCounts>,
    pub coordinator: MemCoordinator,
    object_store: Arc<dyn ObjectStore>,
    _dir: Option<TempDir>,
}

impl DatasetScenario {
    /// The records satisfying `query` (real attribute numbering).
    pub fn expected(&self, query: &Query) -> HashSet<Record> {
        self.records
            .iter()
            .filter(|r| query.matches(r.values()))
            .cloned()
            .collect()
    }

    /// Live partitions and their registered counts, ascending by id.
    pub async fn counts(&self) -> Vec<(PartitionId, u64)> {
        self.counts.list().await.unwrap()
    }

    /// Another process working on the same replica.
    pub async fn open_again(&self) -> AccessMethod {
        AccessMethod::init(
            query_conf(),
            Arc::clone(&self.object_store),
            Arc::clone(&self.counts) as _,
            Arc::new(self.coordinator.clone()),
        )
        .await
        .unwrap()
    }
}

#[async_trait]
pub trait DatasetSetup: Debug + Send + Sync {
    async fn make(&self) -> Vec<DatasetScenario>;
}

/// Split sizing for datasets a thousand times smaller than production.
pub fn query_conf() -> QueryConf {
    QueryConf {
        working_dir: WORKING_DIR.to_string(),
        replica_id: REPLICA_ID.to_string(),
        min_split_records: 2_000,
        max_split_records: 4_000,
        min_refine_records: 100,
        max_refine_selectivity: 0.5,
        lease_timeout_ms: 1_000,
        ..Default::default()
    }
}

/// Every object store backend a scenario runs on.
fn backends() -> Vec<(&'static str, Arc<dyn ObjectStore>, Option<TempDir>)> {
    let dir = test_helpers::tmp_dir().unwrap();
    let memory: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let disk: Arc<dyn ObjectStore> = Arc::new(LocalFileSystem::new(dir.path()));
    vec![
        ("in memory", memory, None),
        ("local file system", disk, Some(dir)),
    ]
}

async fn scenario(
    name: &str,
    backend: &str,
    object_store: Arc<dyn ObjectStore>,
    counts: Arc<MemBucketCounts>,
    records: Vec<Record>,
    dir: Option<TempDir>,
) -> DatasetScenario {
    let coordinator = MemCoordinator::new();
    let access = AccessMethod::init(
        query_conf(),
        Arc::clone(&object_store),
        Arc::clone(&counts) as _,
        Arc::new(coordinator.clone()),
    )
    .await
    .unwrap();
    DatasetScenario {
        scenario_name: format!("{} ({})", name, backend),
        access,
        records,
        counts,
        coordinator,
        object_store,
        _dir: dir,
    }
}

/// Records `[name, price, a]` keyed on `a`, with `a` in `0..4000` split
/// into partition 1 (`a <= 2999`, 3000 records) and partition 2 (the
/// remaining 1000).
#[derive(Debug)]
pub struct TwoSkewedPartitions;

impl TwoSkewedPartitions {
    pub fn record(a: i64) -> Record {
        Record::new(vec![
            TypedValue::Str(format!("item-{}", a)),
            TypedValue::from(a as f64 / 10.0),
            TypedValue::Int(a),
        ])
    }
}

#[async_trait]
impl DatasetSetup for TwoSkewedPartitions {
    async fn make(&self) -> Vec<DatasetScenario> {
        test_helpers::maybe_start_logging();
        let schema = KeySchema::new(vec![KeyAttribute {
            name: "a".to_string(),
            real_index: 2,
            data_type: DataType::Int,
        }]);
        let records: Vec<_> = (0..4000).map(Self::record).collect();
        let sample = records
            .iter()
            .map(|r| schema.key_of(r).unwrap())
            .collect();

        let root = PartitionIndex::single(1, PartitionId::new(0), sample);
        let split = root
            .plan_split(
                PartitionId::new(0),
                0,
                TypedValue::Int(2999),
                root.next_partition_id(),
            )
            .unwrap();
        let index = root.apply(&[split]).unwrap();

        let mut scenarios = vec![];
        for (backend, object_store, dir) in backends() {
            let store = PartitionStore::new(Arc::clone(&object_store), WORKING_DIR, REPLICA_ID);
            let counts = Arc::new(MemBucketCounts::new());
            for leaf in index.leaves() {
                let members: Vec<_> = records
                    .iter()
                    .filter(|r| index.route(&schema.key_of(r).unwrap()) == leaf.partition)
                    .cloned()
                    .collect();
                let n = store.write_partition(leaf.partition, &members).await.unwrap();
                counts.set_bucket_count(leaf.partition, n).await.unwrap();
            }
            store.save_schema(&schema).await.unwrap();
            store.save_index(&index).await.unwrap();

            scenarios.push(
                scenario(
                    "two skewed partitions",
                    backend,
                    object_store,
                    counts,
                    records.clone(),
                    dir,
                )
                .await,
            );
        }
        scenarios
    }
}

/// Records `[x, y, label]` for every point of a 40 by 40 grid, keyed on
/// `(x, y)` and bulk loaded into 8 partitions of 200 records.
#[derive(Debug)]
pub struct UniformGrid;

impl UniformGrid {
    pub fn record(x: i64, y: i64) -> Record {
        Record::new(vec![
            TypedValue::Int(x),
            TypedValue::Int(y),
            TypedValue::Str(format!("{}:{}", x, y)),
        ])
    }
}

#[async_trait]
impl DatasetSetup for UniformGrid {
    async fn make(&self) -> Vec<DatasetScenario> {
        test_helpers::maybe_start_logging();
        let schema = KeySchema::new(vec![
            KeyAttribute {
                name: "x".to_string(),
                real_index: 0,
                data_type: DataType::Int,
            },
            KeyAttribute {
                name: "y".to_string(),
                real_index: 1,
                data_type: DataType::Int,
            },
        ]);
        let records: Vec<_> = (0..40)
            .flat_map(|x| (0..40).map(move |y| Self::record(x, y)))
            .collect();

        let mut scenarios = vec![];
        for (backend, object_store, dir) in backends() {
            let store = PartitionStore::new(Arc::clone(&object_store), WORKING_DIR, REPLICA_ID);
            let counts = Arc::new(MemBucketCounts::new());
            BulkLoader::new(store, Arc::clone(&counts) as _, schema.clone())
                .with_sample_size(records.len())
                .with_max_leaves(8)
                .load(records.clone())
                .await
                .unwrap();

            scenarios.push(
                scenario("uniform grid", backend, object_store, counts, records.clone(), dir).await,
            );
        }
        scenarios
    }
}
