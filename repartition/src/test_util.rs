//! Fixtures and fault injection for the commit protocol tests.
//!
//! Separate processes attached to one replica are modelled as separate
//! [`Dataset`]s (each with its own published index) over the same object
//! store, bucket store and coordinator.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bucket_catalog::{BucketCounts, MemBucketCounts};
use bytes::Bytes;
use data_types::{DataType, KeyAttribute, KeySchema, PartitionId, Query, Record, TypedValue};
use object_store::{memory::InMemory, ObjectPath, ObjectStore};
use parking_lot::Mutex;
use partition_index::SharedIndex;
use partition_lock::{Coordinator, MemCoordinator};
use partition_store::PartitionStore;
use planner::{ClusterIds, RepartitionPlan};

use crate::{BulkLoader, Dataset};

/// Matches object locations containing a fragment, optionally only after
/// skipping some matches and only a limited number of times.
#[derive(Debug)]
struct Fault {
    fragment: String,
    skip: usize,
    remaining: Option<usize>,
}

impl Fault {
    fn new(fragment: &str) -> Self {
        Self {
            fragment: fragment.to_string(),
            skip: 0,
            remaining: None,
        }
    }

    fn hit(&mut self, location: &ObjectPath) -> bool {
        if !location.to_raw().contains(self.fragment.as_str()) {
            return false;
        }
        if self.skip > 0 {
            self.skip -= 1;
            return false;
        }
        match &mut self.remaining {
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
            None => true,
        }
    }
}

/// An in-memory store whose writes and deletes can be made to fail, or
/// writes to stall, for locations containing a given fragment.
#[derive(Debug, Default)]
pub(crate) struct FaultyStore {
    inner: InMemory,
    fail_put: Mutex<Option<Fault>>,
    fail_delete: Mutex<Option<Fault>>,
    delay_put: Mutex<Option<(Fault, Duration)>>,
}

impl FaultyStore {
    pub(crate) fn fail_put(&self, fragment: Option<&str>) {
        *self.fail_put.lock() = fragment.map(Fault::new);
    }

    /// Fail only the next matching write.
    pub(crate) fn fail_put_once(&self, fragment: &str) {
        *self.fail_put.lock() = Some(Fault {
            remaining: Some(1),
            ..Fault::new(fragment)
        });
    }

    pub(crate) fn fail_delete(&self, fragment: Option<&str>) {
        *self.fail_delete.lock() = fragment.map(Fault::new);
    }

    /// Stall one matching write by `delay`, after letting `skip` matching
    /// writes through.
    pub(crate) fn delay_put_once(&self, fragment: &str, skip: usize, delay: Duration) {
        let fault = Fault {
            skip,
            remaining: Some(1),
            ..Fault::new(fragment)
        };
        *self.delay_put.lock() = Some((fault, delay));
    }

    fn injected(rule: &Mutex<Option<Fault>>, location: &ObjectPath) -> Option<std::io::Error> {
        let hit = rule.lock().as_mut().map_or(false, |f| f.hit(location));
        hit.then(|| std::io::Error::new(std::io::ErrorKind::Other, "injected failure"))
    }

    fn delay_for(&self, location: &ObjectPath) -> Option<Duration> {
        self.delay_put
            .lock()
            .as_mut()
            .and_then(|(fault, delay)| fault.hit(location).then(|| *delay))
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn put(&self, location: &ObjectPath, bytes: Bytes) -> object_store::Result<()> {
        if let Some(delay) = self.delay_for(location) {
            tokio::time::sleep(delay).await;
        }
        if let Some(source) = Self::injected(&self.fail_put, location) {
            return Err(object_store::Error::Write {
                location: location.to_raw(),
                source,
            });
        }
        self.inner.put(location, bytes).await
    }

    async fn get(&self, location: &ObjectPath) -> object_store::Result<Bytes> {
        self.inner.get(location).await
    }

    async fn delete(&self, location: &ObjectPath) -> object_store::Result<()> {
        if let Some(source) = Self::injected(&self.fail_delete, location) {
            return Err(object_store::Error::Delete {
                location: location.to_raw(),
                source,
            });
        }
        self.inner.delete(location).await
    }

    async fn list(&self, prefix: &ObjectPath) -> object_store::Result<Vec<ObjectPath>> {
        self.inner.list(prefix).await
    }
}

/// Bucket counts whose registrations or removals can be made to fail.
#[derive(Debug, Default)]
pub(crate) struct FaultyCounts {
    inner: MemBucketCounts,
    pub(crate) fail_set: AtomicBool,
    pub(crate) fail_remove: AtomicBool,
}

impl FaultyCounts {
    fn unavailable() -> bucket_catalog::Error {
        bucket_catalog::Error::Unavailable {
            reason: "injected failure".to_string(),
        }
    }
}

#[async_trait]
impl BucketCounts for FaultyCounts {
    async fn get(&self, partition: PartitionId) -> bucket_catalog::Result<Option<u64>> {
        self.inner.get(partition).await
    }

    async fn get_many(
        &self,
        partitions: &[PartitionId],
    ) -> bucket_catalog::Result<BTreeMap<PartitionId, u64>> {
        self.inner.get_many(partitions).await
    }

    async fn add_to_bucket_count(
        &self,
        partition: PartitionId,
        count: u64,
    ) -> bucket_catalog::Result<u64> {
        self.inner.add_to_bucket_count(partition, count).await
    }

    async fn set_bucket_count(&self, partition: PartitionId, count: u64) -> bucket_catalog::Result<()> {
        if self.fail_set.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.set_bucket_count(partition, count).await
    }

    async fn remove_bucket_count(&self, partition: PartitionId) -> bucket_catalog::Result<Option<u64>> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.remove_bucket_count(partition).await
    }

    async fn list(&self) -> bucket_catalog::Result<Vec<(PartitionId, u64)>> {
        self.inner.list().await
    }
}

#[derive(Debug)]
pub(crate) struct Fixture {
    pub(crate) dataset: Dataset,
    pub(crate) object_store: Arc<FaultyStore>,
    pub(crate) counts: Arc<FaultyCounts>,
    pub(crate) coordinator: MemCoordinator,
}

impl Fixture {
    /// One integer key attribute, records 0..1000 loaded into two
    /// partitions: 0 holds keys up to 499, 1 holds the rest.
    pub(crate) async fn new() -> Self {
        test_helpers::maybe_start_logging();

        let object_store = Arc::new(FaultyStore::default());
        let counts = Arc::new(FaultyCounts::default());
        let coordinator = MemCoordinator::new();
        let schema = KeySchema::new(vec![KeyAttribute {
            name: "a".to_string(),
            real_index: 0,
            data_type: DataType::Int,
        }]);
        let store = PartitionStore::new(Arc::clone(&object_store) as _, "dataset", "0");

        let records = (0..1000).map(record).collect();
        let index = BulkLoader::new(store.clone(), Arc::clone(&counts) as _, schema.clone())
            .with_sample_size(1000)
            .with_max_leaves(2)
            .load(records)
            .await
            .unwrap();

        let dataset = Dataset {
            schema: Arc::new(schema),
            store,
            counts: Arc::clone(&counts) as _,
            index: Arc::new(SharedIndex::new(index)),
            coordinator: Arc::new(coordinator.clone()),
            coordination_hosts: vec!["localhost:2181".to_string()],
            lease_timeout: Duration::from_millis(500),
        };
        Self {
            dataset,
            object_store,
            counts,
            coordinator,
        }
    }

    /// Split partition 0 at 249 into fresh partitions 2 and 3.
    pub(crate) fn plan(&self, query: Query) -> Arc<RepartitionPlan> {
        self.plan_for(0, 249, query)
    }

    /// Split `partition` at `boundary`, minting ids from this process.
    pub(crate) fn plan_for(&self, partition: i64, boundary: i64, query: Query) -> Arc<RepartitionPlan> {
        let first = self.dataset.index.reserve_ids(2);
        plan_split(&self.dataset, partition, boundary, first, query)
    }

    /// The same dataset as seen by a freshly started process.
    pub(crate) async fn restart(&self) -> Dataset {
        let index = self.dataset.store.load_index().await.unwrap();
        Dataset {
            index: Arc::new(SharedIndex::new(index)),
            ..self.dataset.clone()
        }
    }

    /// Replica-wide id allocation as another process would set it up.
    pub(crate) async fn cluster_ids(&self) -> ClusterIds {
        let session = self
            .coordinator
            .connect(&self.dataset.coordination_hosts)
            .await
            .unwrap();
        ClusterIds::new(
            self.dataset.store.clone(),
            session,
            self.dataset.lease_timeout,
        )
    }

    pub(crate) async fn counts(&self) -> Vec<(i64, u64)> {
        self.counts
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|(p, c)| (p.get(), c))
            .collect()
    }

    /// The persisted index, the bucket counts and the partition files name
    /// the same partitions, every record sits in the partition its key
    /// routes to, nothing is left in flight and no lease is held.
    pub(crate) async fn assert_consistent(&self) {
        let store = &self.dataset.store;
        let index = store.load_index().await.unwrap();
        let mut leaves: Vec<_> = index.leaves().iter().map(|l| l.partition.get()).collect();
        leaves.sort_unstable();

        let counts = self.counts().await;
        assert_eq!(counts.iter().map(|(p, _)| *p).collect::<Vec<_>>(), leaves);
        assert_eq!(self.partition_files().await, leaves);

        let mut total = 0;
        for (partition, count) in counts {
            let partition = PartitionId::new(partition);
            let records = store.read_partition(partition).await.unwrap();
            assert_eq!(records.len() as u64, count, "partition {}", partition);
            for r in &records {
                let key = self.dataset.schema.key_of(r).unwrap();
                assert_eq!(index.route(&key), partition);
            }
            total += count;
        }
        assert_eq!(total, 1000);

        assert!(store.list_journals().await.unwrap().is_empty());
        assert_eq!(self.coordinator.held_count(), 0);
    }

    pub(crate) async fn partition_files(&self) -> Vec<i64> {
        self.dataset
            .store
            .list_partitions()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.get())
            .collect()
    }
}

/// Split `partition` of the index `dataset` currently publishes, minting
/// ids from the replica-wide counter.
pub(crate) async fn plan_on(
    dataset: &Dataset,
    ids: &ClusterIds,
    partition: i64,
    boundary: i64,
    query: Query,
) -> Arc<RepartitionPlan> {
    let floor = dataset.index.snapshot().next_partition_id();
    let first = ids.reserve(2, floor).await.unwrap();
    plan_split(dataset, partition, boundary, first, query)
}

fn plan_split(
    dataset: &Dataset,
    partition: i64,
    boundary: i64,
    first: PartitionId,
    query: Query,
) -> Arc<RepartitionPlan> {
    let split = dataset
        .index
        .snapshot()
        .plan_split(
            PartitionId::new(partition),
            0,
            TypedValue::Int(boundary),
            first,
        )
        .unwrap();
    Arc::new(RepartitionPlan::new(query, vec![split]))
}

pub(crate) fn record(i: i64) -> Record {
    Record::new(vec![TypedValue::Int(i), TypedValue::from("payload")])
}
