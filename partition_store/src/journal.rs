//! The per-plan commit journal.

use std::collections::BTreeSet;

use data_types::PartitionId;
use partition_index::IndexSplit;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How far a repartition got before the journal was last written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitPhase {
    /// New partitions are being written; none is registered yet. Old
    /// partitions are authoritative.
    Writing,
    /// Every new partition is durable. Registration and drops are under way
    /// and must be driven to completion.
    Committing,
}

/// Durable record of one repartition, enough to resume or undo it after a
/// crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitJournal {
    pub plan_id: Uuid,
    pub phase: CommitPhase,
    /// Partitions being retired.
    pub old: Vec<PartitionId>,
    /// Partitions being created.
    pub new: Vec<PartitionId>,
    pub splits: Vec<IndexSplit>,
    /// Record count of each new partition, filled in once writing is done.
    pub counts: Vec<(PartitionId, u64)>,
    /// Old partitions this plan has exclusively taken over. At most one
    /// journal claims a partition; registration starts only once every old
    /// partition is claimed.
    #[serde(default)]
    pub claimed: BTreeSet<PartitionId>,
    /// New partitions already registered with the bucket store.
    pub stored: BTreeSet<PartitionId>,
    /// Old partitions already removed.
    pub dropped: BTreeSet<PartitionId>,
}

impl CommitJournal {
    /// A journal for a plan that is about to start writing.
    pub fn new(plan_id: Uuid, splits: Vec<IndexSplit>) -> Self {
        let old = splits.iter().map(|s| s.partition).collect();
        let new = splits.iter().flat_map(|s| s.new_partitions()).collect();
        Self {
            plan_id,
            phase: CommitPhase::Writing,
            old,
            new,
            splits,
            counts: vec![],
            claimed: Default::default(),
            stored: Default::default(),
            dropped: Default::default(),
        }
    }

    pub fn count_of(&self, partition: PartitionId) -> Option<u64> {
        self.counts
            .iter()
            .find(|(p, _)| *p == partition)
            .map(|(_, c)| *c)
    }

    /// Old partitions not yet claimed.
    pub fn pending_claims(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.old.iter().copied().filter(|p| !self.claimed.contains(p))
    }

    /// New partitions not yet registered.
    pub fn pending_registrations(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.new.iter().copied().filter(|p| !self.stored.contains(p))
    }

    /// Old partitions not yet dropped.
    pub fn pending_drops(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.old.iter().copied().filter(|p| !self.dropped.contains(p))
    }
}
