//! The planner's output types.

use std::sync::Arc;

use data_types::{PartitionId, Query};
use partition_index::{IndexSplit, SharedIndex};
use uuid::Uuid;

/// How a worker reads the partitions of one split.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadStrategy {
    /// Every record qualifies; read without filtering.
    Scan,
    /// Re-check the query against every record read.
    Filter(Query),
    /// Read the old partitions filtered by the plan's query, and replace
    /// them with their refined successors.
    Repartition(Arc<RepartitionPlan>),
}

impl ReadStrategy {
    /// Whether partitions read with `self` and `other` may share a split.
    pub(crate) fn mergeable(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Self::Scan, Self::Scan) | (Self::Filter(_), Self::Filter(_))
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Filter(_) => "filter",
            Self::Repartition(_) => "repartition",
        }
    }
}

/// One unit of parallel work.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionSplit {
    pub partition_ids: Vec<PartitionId>,
    pub iterator: ReadStrategy,
}

impl PartitionSplit {
    pub fn new(partition_ids: Vec<PartitionId>, iterator: ReadStrategy) -> Self {
        Self {
            partition_ids,
            iterator,
        }
    }
}

/// Leaves claimed for a plan, released when the plan goes away.
#[derive(Debug)]
struct Claim {
    index: Arc<SharedIndex>,
    partitions: Vec<PartitionId>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.index.release_claims(self.partitions.iter().copied());
    }
}

/// A refinement of one or more leaves, identified by a plan id that keys
/// its commit journal.
#[derive(Debug)]
pub struct RepartitionPlan {
    pub id: Uuid,
    pub query: Query,
    pub splits: Vec<IndexSplit>,
    claim: Option<Claim>,
}

impl RepartitionPlan {
    pub fn new(query: Query, splits: Vec<IndexSplit>) -> Self {
        Self {
            id: Uuid::new_v4(),
            query,
            splits,
            claim: None,
        }
    }

    /// A plan holding the claims on its old partitions in `index` until it
    /// is dropped.
    pub(crate) fn claimed(query: Query, splits: Vec<IndexSplit>, index: Arc<SharedIndex>) -> Self {
        let partitions = splits.iter().map(|s| s.partition).collect();
        Self {
            claim: Some(Claim { index, partitions }),
            ..Self::new(query, splits)
        }
    }

    pub fn old_partitions(&self) -> Vec<PartitionId> {
        self.splits.iter().map(|s| s.partition).collect()
    }

    pub fn new_partitions(&self) -> Vec<PartitionId> {
        self.splits
            .iter()
            .flat_map(|s| s.new_partitions())
            .collect()
    }

    pub fn split_of(&self, old: PartitionId) -> Option<&IndexSplit> {
        self.splits.iter().find(|s| s.partition == old)
    }
}

impl PartialEq for RepartitionPlan {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.query == other.query && self.splits == other.splits
    }
}
