//! Physical repartitioning.
//!
//! A [`RepartitionIterator`] executes one adapt plan: it reads the old
//! partitions, writes their records into the new partitions, and commits
//! the metadata change so that new partitions are registered before old
//! ones are dropped. Every step is recorded in a [`CommitJournal`] so that
//! [`Recovery`] can finish (or cleanly undo) a repartition whose owner
//! died.
//!
//! Several processes may repartition one replica at the same time. They
//! coordinate through leases only:
//!
//! * the owner of a plan holds its plan lease from the first journal write
//!   until the journal is gone, and recovery leaves journals with a live
//!   owner alone;
//! * an old partition is claimed in the journal under its partition lease
//!   before anything is registered, so only one plan ever retires it;
//! * the persisted index is reloaded, refined and saved under the index
//!   lease.
//!
//! [`BulkLoader`] produces the initial partitions and index, and
//! [`reader`] holds the split readers.
//!
//! [`CommitJournal`]: partition_store::CommitJournal

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::{sync::Arc, time::Duration};

use bucket_catalog::BucketCounts;
use data_types::{KeySchema, PartitionId};
use partition_index::SharedIndex;
use partition_lock::Coordinator;
use partition_store::PartitionStore;
use snafu::Snafu;
use uuid::Uuid;

mod bulk;
mod commit;
mod iterator;
pub mod reader;
mod recovery;
#[cfg(test)]
mod test_util;

pub use bulk::BulkLoader;
pub use iterator::{RepartitionIterator, RepartitionState};
pub use recovery::{Recovery, RecoveryReport};

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("plan {}: error reading partition {}: {}", plan_id, partition, source))]
    ReadPartition {
        plan_id: Uuid,
        partition: PartitionId,
        source: partition_store::Error,
    },

    #[snafu(display("plan {}: record does not fit the key schema: {}", plan_id, source))]
    RecordKey {
        plan_id: Uuid,
        source: data_types::schema::Error,
    },

    #[snafu(display("plan {}: error writing partition {}: {}", plan_id, partition, source))]
    WritePartition {
        plan_id: Uuid,
        partition: PartitionId,
        source: partition_store::Error,
    },

    #[snafu(display("plan {}: error updating commit journal: {}", plan_id, source))]
    Journal {
        plan_id: Uuid,
        source: partition_store::Error,
    },

    #[snafu(display("plan {}: error registering partition {}: {}", plan_id, partition, source))]
    RegisterPartition {
        plan_id: Uuid,
        partition: PartitionId,
        source: bucket_catalog::Error,
    },

    #[snafu(display("plan {}: error dropping partition {}: {}", plan_id, partition, source))]
    DropPartition {
        plan_id: Uuid,
        partition: PartitionId,
        source: partition_store::Error,
    },

    #[snafu(display("plan {}: error unregistering partition {}: {}", plan_id, partition, source))]
    UnregisterPartition {
        plan_id: Uuid,
        partition: PartitionId,
        source: bucket_catalog::Error,
    },

    #[snafu(display("plan {}: partition lock error: {}", plan_id, source))]
    Lock {
        plan_id: Uuid,
        source: partition_lock::Error,
    },

    #[snafu(display("plan {}: error claiming partition {}: {}", plan_id, partition, source))]
    ClaimPartition {
        plan_id: Uuid,
        partition: PartitionId,
        source: partition_store::Error,
    },

    #[snafu(display("plan {}: partition {} {}, plan abandoned", plan_id, partition, reason))]
    StalePlan {
        plan_id: Uuid,
        partition: PartitionId,
        reason: String,
    },

    #[snafu(display("plan {}: error applying index splits: {}", plan_id, source))]
    ApplyIndex {
        plan_id: Uuid,
        source: partition_index::Error,
    },

    #[snafu(display("plan {}: error persisting index: {}", plan_id, source))]
    PersistIndex {
        plan_id: Uuid,
        source: partition_store::Error,
    },

    #[snafu(display("plan {}: cannot {} in state {:?}", plan_id, action, state))]
    InvalidState {
        plan_id: Uuid,
        action: &'static str,
        state: RepartitionState,
    },

    #[snafu(display("error reading partition {}: {}", partition, source))]
    Read {
        partition: PartitionId,
        source: partition_store::Error,
    },

    #[snafu(display("record of partition {} does not fit the key schema: {}", partition, source))]
    Key {
        partition: PartitionId,
        source: data_types::schema::Error,
    },

    #[snafu(display("bulk load failed writing partition {}: {}", partition, source))]
    LoadPartition {
        partition: PartitionId,
        source: partition_store::Error,
    },

    #[snafu(display("bulk load record does not fit the key schema: {}", source))]
    LoadKey { source: data_types::schema::Error },

    #[snafu(display("bulk load failed registering partition counts: {}", source))]
    LoadCounts { source: bucket_catalog::Error },

    #[snafu(display("bulk load failed building the index: {}", source))]
    BuildIndex { source: partition_index::Error },

    #[snafu(display("bulk load failed persisting metadata: {}", source))]
    LoadMetadata { source: partition_store::Error },

    #[snafu(display("error listing commit journals: {}", source))]
    ListJournals { source: partition_store::Error },

    #[snafu(display("error reloading the persisted index: {}", source))]
    RefreshIndex { source: partition_store::Error },

    #[snafu(display("coordination session error: {}", source))]
    Session { source: partition_lock::Error },
}

impl Error {
    /// Returns true if a partition being read no longer exists.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ReadPartition { source, .. } | Self::Read { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything a repartition touches for one dataset replica.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub schema: Arc<KeySchema>,
    pub store: PartitionStore,
    pub counts: Arc<dyn BucketCounts>,
    pub index: Arc<SharedIndex>,
    pub coordinator: Arc<dyn Coordinator>,
    pub coordination_hosts: Vec<String>,
    pub lease_timeout: Duration,
}
