use std::sync::Arc;

use bucket_catalog::BucketCounts;
use data_types::{PartitionId, Query, TypedValue};
use observability_deps::tracing::{debug, info, trace, warn};
use partition_index::{LeafRegion, PartitionIndex, SharedIndex};
use partition_lock::{lock_name, LeaseSession};
use snafu::{ensure, ResultExt};

use crate::{
    grouping::{group_splits, Candidate},
    ids::ClusterIds,
    BucketCountsSnafu, PartitionSplit, PlannerConfig, ReadStrategy, RepartitionPlan, Result,
    UnknownAttributeSnafu,
};

/// Plans queries against the published index version.
#[derive(Debug)]
pub struct Optimizer {
    index: Arc<SharedIndex>,
    counts: Arc<dyn BucketCounts>,
    leases: Option<Arc<dyn LeaseSession>>,
    ids: Option<ClusterIds>,
    config: PlannerConfig,
}

impl Optimizer {
    pub fn new(index: Arc<SharedIndex>, counts: Arc<dyn BucketCounts>, config: PlannerConfig) -> Self {
        Self {
            index,
            counts,
            leases: None,
            ids: None,
            config,
        }
    }

    /// Skip refining leaves whose partition lease is held by someone else.
    pub fn with_lease_observer(mut self, leases: Arc<dyn LeaseSession>) -> Self {
        self.leases = Some(leases);
        self
    }

    /// Mint partition ids from the replica-wide counter instead of the
    /// process-local one.
    pub fn with_cluster_ids(mut self, ids: ClusterIds) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn index(&self) -> &Arc<SharedIndex> {
        &self.index
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// A read-only plan covering every partition relevant to `query`.
    pub async fn build_access_plan(&self, query: &Query) -> Result<Vec<PartitionSplit>> {
        let snapshot = self.index.snapshot();
        check_attributes(&snapshot, query)?;

        let leaves = snapshot.lookup(query);
        let candidates: Vec<_> = self
            .candidates(&leaves, query)
            .await?
            .into_iter()
            .map(|(c, _)| c)
            .collect();
        let splits = group_splits(&candidates, &self.config);
        debug!(
            %query,
            version = snapshot.version(),
            partitions = candidates.len(),
            splits = splits.len(),
            "built access plan"
        );
        Ok(splits)
    }

    /// Like [`Self::build_access_plan`], but leaves worth refining are read
    /// through a [`ReadStrategy::Repartition`] split of their own.
    pub async fn build_plan(&self, query: &Query) -> Result<Vec<PartitionSplit>> {
        let snapshot = self.index.snapshot();
        check_attributes(&snapshot, query)?;

        let leaves = snapshot.lookup(query);
        let mut candidates = self.candidates(&leaves, query).await?;

        let mut refined = 0;
        for (leaf, (candidate, known)) in leaves.iter().zip(candidates.iter_mut()) {
            if !*known || !matches!(candidate.strategy, ReadStrategy::Filter(_)) {
                continue;
            }
            if let Some(plan) = self.refine(&snapshot, leaf, candidate.records, query).await {
                candidate.strategy = ReadStrategy::Repartition(Arc::new(plan));
                refined += 1;
            }
        }

        let candidates: Vec<_> = candidates.into_iter().map(|(c, _)| c).collect();
        let splits = group_splits(&candidates, &self.config);
        info!(
            %query,
            version = snapshot.version(),
            partitions = candidates.len(),
            refined,
            splits = splits.len(),
            "built adapt plan"
        );
        Ok(splits)
    }

    /// Size estimate and read strategy of every leaf, paired with whether
    /// the estimate comes from the bucket store.
    async fn candidates(
        &self,
        leaves: &[LeafRegion],
        query: &Query,
    ) -> Result<Vec<(Candidate, bool)>> {
        let ids: Vec<_> = leaves.iter().map(|l| l.partition).collect();
        let counts = self
            .counts
            .get_many(&ids)
            .await
            .context(BucketCountsSnafu)?;
        // unknown partitions are assumed as large as the largest known one
        let fallback = counts.values().copied().max().unwrap_or(0);

        Ok(leaves
            .iter()
            .map(|leaf| {
                let (records, known, strategy) = match counts.get(&leaf.partition) {
                    Some(c) if leaf.region.within(query) => (*c, true, ReadStrategy::Scan),
                    Some(c) => (*c, true, ReadStrategy::Filter(query.clone())),
                    None => {
                        warn!(
                            partition_id = %leaf.partition,
                            assumed_records = fallback,
                            "missing bucket metadata, assuming full scan"
                        );
                        (fallback, false, ReadStrategy::Filter(query.clone()))
                    }
                };
                let candidate = Candidate {
                    partition: leaf.partition,
                    path: leaf.path.clone(),
                    records,
                    strategy,
                };
                (candidate, known)
            })
            .collect())
    }

    /// Decide whether `leaf` should be split for `query` and, if so, claim
    /// it and describe the split.
    async fn refine(
        &self,
        snapshot: &PartitionIndex,
        leaf: &LeafRegion,
        records: u64,
        query: &Query,
    ) -> Option<RepartitionPlan> {
        let partition = leaf.partition;
        if records < self.config.min_refine_records {
            trace!(partition_id = %partition, records, "leaf too small to refine");
            return None;
        }

        let selectivity = snapshot.estimate_selectivity(leaf, query)?;
        if selectivity > self.config.max_refine_selectivity {
            trace!(partition_id = %partition, selectivity, "query not selective enough to refine");
            return None;
        }

        let (attribute, boundary) = split_point(snapshot, leaf, query)?;

        if self.lease_held(partition).await {
            warn!(partition_id = %partition, "partition is locked, skipping refinement");
            return None;
        }
        if !self.index.try_claim(partition) {
            debug!(partition_id = %partition, "partition already scheduled for refinement");
            return None;
        }

        let first = match &self.ids {
            Some(ids) => match ids.reserve(2, snapshot.next_partition_id()).await {
                Ok(first) => first,
                Err(e) => {
                    self.index.release_claims([partition]);
                    warn!(partition_id = %partition, %e, "no partition ids available, skipping refinement");
                    return None;
                }
            },
            None => self.index.reserve_ids(2),
        };
        match snapshot.plan_split(partition, attribute, boundary, first) {
            Ok(split) => {
                debug!(
                    partition_id = %partition,
                    attribute,
                    value = %split.value,
                    left = %split.left,
                    right = %split.right,
                    selectivity,
                    "planned refinement"
                );
                Some(RepartitionPlan::claimed(
                    query.clone(),
                    vec![split],
                    Arc::clone(&self.index),
                ))
            }
            Err(e) => {
                self.index.release_claims([partition]);
                debug!(partition_id = %partition, %e, "no refinement possible");
                None
            }
        }
    }

    async fn lease_held(&self, partition: PartitionId) -> bool {
        let leases = match &self.leases {
            Some(leases) => leases,
            None => return false,
        };
        match leases.is_held(&lock_name(partition)).await {
            Ok(held) => held,
            Err(e) => {
                warn!(partition_id = %partition, %e, "unable to observe partition lease");
                true
            }
        }
    }
}

fn check_attributes(index: &PartitionIndex, query: &Query) -> Result<()> {
    for p in &query.predicates {
        ensure!(
            p.attribute < index.dimensions(),
            UnknownAttributeSnafu {
                attribute: p.attribute,
                dimensions: index.dimensions(),
            }
        );
    }
    Ok(())
}

/// The attribute of the most selective predicate that can divide `leaf`,
/// with the median boundary along it. Ties keep the earlier predicate.
fn split_point(index: &PartitionIndex, leaf: &LeafRegion, query: &Query) -> Option<(usize, TypedValue)> {
    let mut best: Option<(f64, usize, TypedValue)> = None;
    for p in &query.predicates {
        let selectivity = match index.estimate_selectivity(leaf, &Query::new(vec![p.clone()])) {
            Some(s) => s,
            None => continue,
        };
        if matches!(&best, Some((s, _, _)) if *s <= selectivity) {
            continue;
        }
        if let Some(boundary) = index.median_boundary(leaf, p.attribute) {
            best = Some((selectivity, p.attribute, boundary));
        }
    }
    best.map(|(_, attribute, boundary)| (attribute, boundary))
}
