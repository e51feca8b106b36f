//! The access method: entry point of the adaptive partitioning engine.
//!
//! [`AccessMethod::init`] loads the key schema and the persisted index of a
//! dataset replica, finishes any repartition a previous process left behind,
//! and wires up the planner. From then on it hands out [`PartitionSplit`]s
//! for queries expressed in the dataset's real attribute numbering and
//! executes them.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::sync::Arc;

use bucket_catalog::BucketCounts;
use data_types::{KeySchema, PartitionId, Predicate, Query, Record};
use object_store::ObjectStore;
use observability_deps::tracing::{debug, error, info, warn};
use partition_index::{PartitionIndex, SharedIndex};
use partition_lock::{Coordinator, LeaseSession};
use partition_store::PartitionStore;
use planner::{ClusterIds, Optimizer, PartitionSplit, ReadStrategy};
use repartition::{reader, Dataset, Recovery, RepartitionIterator};
use snafu::{ensure, ResultExt, Snafu};

mod config;

pub use config::{QueryConf, QueryConfFile};

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("{}", source))]
    Config { source: config::Error },

    #[snafu(display("error loading key schema: {}", source))]
    LoadSchema { source: partition_store::Error },

    #[snafu(display("error loading partition index: {}", source))]
    LoadIndex { source: partition_store::Error },

    #[snafu(display(
        "key schema has {} attributes but the index has {} dimensions",
        schema,
        index
    ))]
    SchemaMismatch { schema: usize, index: usize },

    #[snafu(display("error recovering interrupted repartitions: {}", source))]
    Recover { source: repartition::Error },

    #[snafu(display("cannot translate query to the index key: {}", source))]
    TranslateQuery { source: data_types::schema::Error },

    #[snafu(display("error connecting to the coordination service: {}", source))]
    Connect { source: partition_lock::Error },

    #[snafu(display("error planning query: {}", source))]
    Plan { source: planner::Error },

    #[snafu(display("error executing {} split: {}", strategy, source))]
    ExecuteSplit {
        strategy: &'static str,
        source: repartition::Error,
    },

    #[snafu(display("error closing coordination session: {}", source))]
    Close { source: partition_lock::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Plans and executes queries against one dataset replica.
#[derive(Debug)]
pub struct AccessMethod {
    conf: QueryConf,
    dataset: Dataset,
    optimizer: Optimizer,
    session: Arc<dyn LeaseSession>,
    /// The configured predicates in virtual attribute space.
    query: Query,
}

impl AccessMethod {
    /// Load the dataset described by `conf` and recover it.
    ///
    /// Only journals whose owner is gone are resumed, so other processes
    /// may keep repartitioning the same replica while this runs.
    pub async fn init(
        conf: QueryConf,
        object_store: Arc<dyn ObjectStore>,
        counts: Arc<dyn BucketCounts>,
        coordinator: Arc<dyn Coordinator>,
    ) -> Result<Self> {
        conf.validate().context(ConfigSnafu)?;

        let store = PartitionStore::new(object_store, &conf.working_dir, &conf.replica_id);
        let schema = store.load_schema().await.context(LoadSchemaSnafu)?;
        let index = store.load_index().await.context(LoadIndexSnafu)?;
        ensure!(
            schema.dimensions() == index.dimensions(),
            SchemaMismatchSnafu {
                schema: schema.dimensions(),
                index: index.dimensions(),
            }
        );
        let query = schema.to_virtual_query(&conf.query()).context(TranslateQuerySnafu)?;

        let dataset = Dataset {
            schema: Arc::new(schema),
            store,
            counts: Arc::clone(&counts),
            index: Arc::new(SharedIndex::new(index)),
            coordinator: Arc::clone(&coordinator),
            coordination_hosts: conf.coordination_hosts.clone(),
            lease_timeout: conf.lease_timeout(),
        };
        let recovered = Recovery::new(dataset.clone())
            .resume_all()
            .await
            .context(RecoverSnafu)?;

        let session = coordinator
            .connect(&conf.coordination_hosts)
            .await
            .context(ConnectSnafu)?;
        let optimizer = Optimizer::new(
            Arc::clone(&dataset.index),
            counts,
            conf.planner_config(),
        )
        .with_lease_observer(Arc::clone(&session))
        .with_cluster_ids(ClusterIds::new(
            dataset.store.clone(),
            Arc::clone(&session),
            conf.lease_timeout(),
        ));

        let snapshot = dataset.index.snapshot();
        info!(
            working_dir = %conf.working_dir,
            replica_id = %conf.replica_id,
            version = snapshot.version(),
            partitions = snapshot.leaves().len(),
            abandoned = recovered.abandoned,
            completed = recovered.completed,
            skipped = recovered.skipped,
            "access method initialised"
        );

        Ok(Self {
            conf,
            dataset,
            optimizer,
            session,
            query,
        })
    }

    pub fn conf(&self) -> &QueryConf {
        &self.conf
    }

    pub fn schema(&self) -> &KeySchema {
        &self.dataset.schema
    }

    /// The currently published index version.
    pub fn index(&self) -> Arc<PartitionIndex> {
        self.dataset.index.snapshot()
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Splits for the configured predicates, in the configured mode.
    pub async fn splits(&self) -> Result<Vec<PartitionSplit>> {
        self.plan_virtual(&self.query, self.conf.just_access).await
    }

    /// Splits covering every partition relevant to `query` (real attribute
    /// numbering). Unless `just_access` is set the plan may refine the
    /// index; if adapt planning fails the access plan is returned instead.
    pub async fn get_partition_splits(
        &self,
        query: &Query,
        just_access: bool,
    ) -> Result<Vec<PartitionSplit>> {
        let query = self
            .dataset
            .schema
            .to_virtual_query(query)
            .context(TranslateQuerySnafu)?;
        self.plan_virtual(&query, just_access).await
    }

    async fn plan_virtual(&self, query: &Query, just_access: bool) -> Result<Vec<PartitionSplit>> {
        if !just_access {
            match self.optimizer.build_plan(query).await {
                Ok(splits) => return Ok(splits),
                Err(e) => warn!(%query, %e, "adapt planning failed, falling back to access plan"),
            }
        }
        self.optimizer
            .build_access_plan(query)
            .await
            .context(PlanSnafu)
    }

    /// Whether `partition` may hold records satisfying `predicate` (real
    /// attribute numbering). Returns true whenever that cannot be ruled
    /// out, including for predicates on attributes outside the key and for
    /// partitions the current index no longer knows.
    pub fn is_relevant(&self, partition: PartitionId, predicate: &Predicate) -> bool {
        let predicate = match self.dataset.schema.to_virtual(predicate) {
            Ok(p) => p,
            Err(_) => return true,
        };
        let query = Query::new(vec![predicate]);
        self.dataset
            .index
            .snapshot()
            .leaves()
            .into_iter()
            .find(|l| l.partition == partition)
            .map_or(true, |l| l.region.intersects(&query))
    }

    /// Read the records of `split` that satisfy its query.
    ///
    /// Partitions dropped by a commit since the split was planned are read
    /// through their successors. A repartition split also replaces its
    /// partitions with their refined successors. Should that fail, the
    /// records already read from the old partitions are returned regardless,
    /// since those stay authoritative. If another process already replaced
    /// them, the split is served as a filter over the current layout.
    pub async fn execute_split(&self, split: &PartitionSplit) -> Result<Vec<Record>> {
        let strategy = split.iterator.name();
        match &split.iterator {
            ReadStrategy::Scan => reader::scan(&self.dataset, &split.partition_ids)
                .await
                .context(ExecuteSplitSnafu { strategy }),
            ReadStrategy::Filter(query) => {
                reader::filter(&self.dataset, &split.partition_ids, query)
                    .await
                    .context(ExecuteSplitSnafu { strategy })
            }
            ReadStrategy::Repartition(plan) => {
                let mut iter = RepartitionIterator::new(Arc::clone(plan), self.dataset.clone());
                let records = match iter.read().await {
                    Ok(records) => records,
                    Err(e) if e.is_not_found() => {
                        debug!(plan_id = %plan.id, %e, "plan outdated, filtering current partitions");
                        return reader::filter(&self.dataset, &split.partition_ids, &plan.query)
                            .await
                            .context(ExecuteSplitSnafu { strategy });
                    }
                    Err(e) => return Err(e).context(ExecuteSplitSnafu { strategy }),
                };
                if let Err(e) = iter.finish().await {
                    error!(plan_id = %plan.id, %e, "repartition failed, serving old partitions");
                }
                Ok(records)
            }
        }
    }

    /// Close the coordination session, releasing anything it still holds.
    pub async fn close(self) -> Result<()> {
        self.session.close().await.context(CloseSnafu)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use bucket_catalog::MemBucketCounts;
    use data_types::{DataType, KeyAttribute, PredicateType, TypedValue};
    use object_store::memory::InMemory;
    use partition_lock::MemCoordinator;
    use pretty_assertions::assert_eq;
    use repartition::BulkLoader;

    use super::*;

    /// Records carry a name in column 0 and the key in column 1.
    fn record(i: i64) -> Record {
        Record::new(vec![TypedValue::Str(format!("r{}", i)), TypedValue::Int(i)])
    }

    fn schema() -> KeySchema {
        KeySchema::new(vec![KeyAttribute {
            name: "id".to_string(),
            real_index: 1,
            data_type: DataType::Int,
        }])
    }

    fn conf() -> QueryConf {
        QueryConf {
            working_dir: "ds".to_string(),
            replica_id: "0".to_string(),
            min_split_records: 600,
            max_split_records: 1200,
            min_refine_records: 100,
            max_refine_selectivity: 0.5,
            lease_timeout_ms: 500,
            ..Default::default()
        }
    }

    fn between(low: i64, high: i64) -> Query {
        Query::new(vec![
            Predicate::new(1, PredicateType::Geq, low),
            Predicate::new(1, PredicateType::Leq, high),
        ])
    }

    struct Setup {
        object_store: Arc<dyn ObjectStore>,
        counts: Arc<MemBucketCounts>,
        coordinator: MemCoordinator,
    }

    impl Setup {
        /// Keys 0..1000 in two partitions: 0 holds keys up to 499, 1 the rest.
        async fn new() -> Self {
            test_helpers::maybe_start_logging();
            let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
            let counts = Arc::new(MemBucketCounts::new());
            let store = PartitionStore::new(Arc::clone(&object_store), "ds", "0");
            BulkLoader::new(store, Arc::clone(&counts) as _, schema())
                .with_sample_size(1000)
                .with_max_leaves(2)
                .load((0..1000).map(record).collect())
                .await
                .unwrap();
            Self {
                object_store,
                counts,
                coordinator: MemCoordinator::new(),
            }
        }

        async fn init(&self, conf: QueryConf) -> Result<AccessMethod> {
            AccessMethod::init(
                conf,
                Arc::clone(&self.object_store),
                Arc::clone(&self.counts) as _,
                Arc::new(self.coordinator.clone()),
            )
            .await
        }

        async fn counts(&self) -> Vec<(i64, u64)> {
            self.counts
                .list()
                .await
                .unwrap()
                .into_iter()
                .map(|(p, c)| (p.get(), c))
                .collect()
        }
    }

    fn virtual_between(low: i64, high: i64) -> Query {
        Query::new(vec![
            Predicate::new(0, PredicateType::Geq, low),
            Predicate::new(0, PredicateType::Leq, high),
        ])
    }

    #[tokio::test]
    async fn test_access_plan() {
        let setup = Setup::new().await;
        let access = setup.init(conf()).await.unwrap();

        let splits = access
            .get_partition_splits(&between(50, 60), true)
            .await
            .unwrap();
        assert_eq!(
            splits,
            vec![PartitionSplit::new(
                vec![PartitionId::new(0)],
                ReadStrategy::Filter(virtual_between(50, 60))
            )]
        );
        assert_eq!(
            access.execute_split(&splits[0]).await.unwrap(),
            (50..=60).map(record).collect::<Vec<_>>()
        );

        // both partitions fit in one scan split
        let splits = access
            .get_partition_splits(&Query::default(), true)
            .await
            .unwrap();
        assert_eq!(
            splits,
            vec![PartitionSplit::new(
                vec![PartitionId::new(0), PartitionId::new(1)],
                ReadStrategy::Scan
            )]
        );
        assert_eq!(access.execute_split(&splits[0]).await.unwrap().len(), 1000);

        // access mode never touches the layout
        assert_eq!(setup.counts().await, vec![(0, 500), (1, 500)]);
        access.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_adapt_plan_refines_index() {
        let setup = Setup::new().await;
        let access = setup.init(conf()).await.unwrap();

        let splits = access
            .get_partition_splits(&between(50, 60), false)
            .await
            .unwrap();
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].partition_ids, vec![PartitionId::new(0)]);
        assert_matches!(&splits[0].iterator, ReadStrategy::Repartition(_));

        let records = access.execute_split(&splits[0]).await.unwrap();
        assert_eq!(records, (50..=60).map(record).collect::<Vec<_>>());
        assert_eq!(setup.counts().await, vec![(1, 500), (2, 250), (3, 250)]);
        assert_eq!(access.index().version(), 1);

        // the next query reads only the refined half
        let splits = access
            .get_partition_splits(&between(50, 60), true)
            .await
            .unwrap();
        assert_eq!(
            splits,
            vec![PartitionSplit::new(
                vec![PartitionId::new(2)],
                ReadStrategy::Filter(virtual_between(50, 60))
            )]
        );

        // a new process sees the refined index
        access.close().await.unwrap();
        let reopened = setup.init(conf()).await.unwrap();
        assert_eq!(reopened.index().leaves().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_repartition_still_returns_records() {
        let setup = Setup::new().await;
        let access = setup.init(conf()).await.unwrap();
        let splits = access
            .get_partition_splits(&between(50, 60), false)
            .await
            .unwrap();

        // someone else holds the lease of a new partition until the commit
        // gives up
        let other = setup.coordinator.connect(&conf().coordination_hosts).await.unwrap();
        let lease = other
            .acquire(&partition_lock::lock_name(PartitionId::new(2)), conf().lease_timeout())
            .await
            .unwrap();

        let records = access.execute_split(&splits[0]).await.unwrap();
        assert_eq!(records.len(), 11);
        assert_eq!(access.index().version(), 0);
        other.release(lease).await.unwrap();

        // the journal left behind is completed on the next start
        access.close().await.unwrap();
        let reopened = setup.init(conf()).await.unwrap();
        assert_eq!(reopened.index().version(), 1);
        assert_eq!(setup.counts().await, vec![(1, 500), (2, 250), (3, 250)]);
    }

    #[tokio::test]
    async fn test_split_planned_before_other_process_commits() {
        let setup = Setup::new().await;
        let a = setup.init(conf()).await.unwrap();
        let b = setup.init(conf()).await.unwrap();

        let stale = a.get_partition_splits(&between(50, 60), true).await.unwrap();
        assert_eq!(stale[0].partition_ids, vec![PartitionId::new(0)]);

        // b replaces partition 0 before a executes its split
        let splits = b.get_partition_splits(&between(50, 60), false).await.unwrap();
        b.execute_split(&splits[0]).await.unwrap();
        assert_eq!(setup.counts().await, vec![(1, 500), (2, 250), (3, 250)]);

        assert_eq!(
            a.execute_split(&stale[0]).await.unwrap(),
            (50..=60).map(record).collect::<Vec<_>>()
        );
        assert_eq!(a.index().version(), 1);
        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_adapt_split_outdated_by_other_process() {
        let setup = Setup::new().await;
        let a = setup.init(conf()).await.unwrap();
        let b = setup.init(conf()).await.unwrap();

        let outdated = a.get_partition_splits(&between(50, 60), false).await.unwrap();
        assert_matches!(&outdated[0].iterator, ReadStrategy::Repartition(_));
        let splits = b.get_partition_splits(&between(50, 60), false).await.unwrap();
        b.execute_split(&splits[0]).await.unwrap();

        // a's plan names ids 2 and 3, b committed 4 and 5
        assert_eq!(
            a.execute_split(&outdated[0]).await.unwrap(),
            (50..=60).map(record).collect::<Vec<_>>()
        );
        assert_eq!(setup.counts().await, vec![(1, 500), (4, 250), (5, 250)]);
        let files = PartitionStore::new(Arc::clone(&setup.object_store), "ds", "0")
            .list_partitions()
            .await
            .unwrap();
        assert_eq!(files.len(), 3);
        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_adapt_on_disjoint_partitions() {
        let setup = Setup::new().await;
        let a = setup.init(conf()).await.unwrap();
        let b = setup.init(conf()).await.unwrap();

        let low = a.get_partition_splits(&between(50, 60), false).await.unwrap();
        let high = b.get_partition_splits(&between(600, 610), false).await.unwrap();
        let (low, high) = tokio::join!(a.execute_split(&low[0]), b.execute_split(&high[0]));
        assert_eq!(low.unwrap(), (50..=60).map(record).collect::<Vec<_>>());
        assert_eq!(high.unwrap(), (600..=610).map(record).collect::<Vec<_>>());

        assert_eq!(
            setup.counts().await,
            vec![(2, 250), (3, 250), (4, 250), (5, 250)]
        );
        a.close().await.unwrap();
        b.close().await.unwrap();

        let reopened = setup.init(conf()).await.unwrap();
        assert_eq!(reopened.index().version(), 2);
        let mut leaves: Vec<_> = reopened
            .index()
            .leaves()
            .iter()
            .map(|l| l.partition.get())
            .collect();
        leaves.sort_unstable();
        assert_eq!(leaves, vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_configured_query() {
        let setup = Setup::new().await;
        let access = setup
            .init(QueryConf {
                predicates: between(700, 800).predicates,
                just_access: true,
                ..conf()
            })
            .await
            .unwrap();
        assert_eq!(
            access.splits().await.unwrap(),
            vec![PartitionSplit::new(
                vec![PartitionId::new(1)],
                ReadStrategy::Filter(virtual_between(700, 800))
            )]
        );
    }

    #[tokio::test]
    async fn test_is_relevant() {
        let setup = Setup::new().await;
        let access = setup.init(conf()).await.unwrap();
        let (p0, p1) = (PartitionId::new(0), PartitionId::new(1));

        let low = Predicate::new(1, PredicateType::Lt, 100);
        assert!(access.is_relevant(p0, &low));
        assert!(!access.is_relevant(p1, &low));

        let high = Predicate::new(1, PredicateType::Gt, 499);
        assert!(!access.is_relevant(p0, &high));
        assert!(access.is_relevant(p1, &high));

        // not part of the key, or an unknown partition
        assert!(access.is_relevant(p1, &Predicate::new(0, PredicateType::Eq, "r1")));
        assert!(access.is_relevant(PartitionId::new(42), &low));
    }

    #[tokio::test]
    async fn test_init_errors() {
        let setup = Setup::new().await;

        assert_matches!(
            setup
                .init(QueryConf {
                    replica_id: "missing".to_string(),
                    ..conf()
                })
                .await,
            Err(Error::LoadSchema { .. })
        );
        assert_matches!(
            setup
                .init(QueryConf {
                    predicates: vec![Predicate::new(0, PredicateType::Eq, "r1")],
                    ..conf()
                })
                .await,
            Err(Error::TranslateQuery { .. })
        );
        assert_matches!(
            setup
                .init(QueryConf {
                    max_refine_selectivity: 2.0,
                    ..conf()
                })
                .await,
            Err(Error::Config { .. })
        );

        setup.coordinator.set_unreachable(true);
        assert_matches!(setup.init(conf()).await, Err(Error::Connect { .. }));
    }
}
