//! The published index version shared by planners and committers.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use data_types::PartitionId;
use hashbrown::HashSet;
use observability_deps::tracing::info;
use parking_lot::{Mutex, RwLock};

use crate::tree::PartitionIndex;

/// Holds the newest [`PartitionIndex`] version this process has seen.
///
/// Readers take a snapshot (`Arc` clone) and work on it without further
/// locking. Commits derive successor versions from the persisted index and
/// [`publish`](Self::publish) them here; a version never replaces a newer
/// one, so no reader ever observes a half-applied split or goes back in
/// time.
///
/// Two pieces of process-local bookkeeping keep planners of this process
/// out of each other's way:
///
/// * fresh partition ids can be reserved from a local counter. Planners
///   sharing a replica with other processes allocate ids cluster-wide
///   instead;
/// * a leaf is *claimed* while an adapt plan for it is outstanding.
#[derive(Debug)]
pub struct SharedIndex {
    current: RwLock<Arc<PartitionIndex>>,
    next_id: AtomicI64,
    claims: Mutex<HashSet<PartitionId>>,
}

impl SharedIndex {
    pub fn new(index: PartitionIndex) -> Self {
        let next_id = AtomicI64::new(index.next_partition_id().get());
        Self {
            current: RwLock::new(Arc::new(index)),
            next_id,
            claims: Default::default(),
        }
    }

    /// The currently published version.
    pub fn snapshot(&self) -> Arc<PartitionIndex> {
        Arc::clone(&self.current.read())
    }

    /// Reserve `n` consecutive partition ids unique within this process and
    /// return the first.
    pub fn reserve_ids(&self, n: usize) -> PartitionId {
        PartitionId::new(self.next_id.fetch_add(n as i64, Ordering::SeqCst))
    }

    /// Claim `partition` for an adapt plan. Returns false if another plan
    /// already holds it.
    pub fn try_claim(&self, partition: PartitionId) -> bool {
        self.claims.lock().insert(partition)
    }

    /// Release the claims taken for a finished (or abandoned) plan.
    pub fn release_claims(&self, partitions: impl IntoIterator<Item = PartitionId>) {
        let mut claims = self.claims.lock();
        for p in partitions {
            claims.remove(&p);
        }
    }

    pub fn is_claimed(&self, partition: PartitionId) -> bool {
        self.claims.lock().contains(&partition)
    }

    /// Publish `index` unless a version at least as new is already
    /// published. Returns whichever version is current afterwards.
    pub fn publish(&self, index: PartitionIndex) -> Arc<PartitionIndex> {
        self.next_id
            .fetch_max(index.next_partition_id().get(), Ordering::SeqCst);
        let mut current = self.current.write();
        if index.version() > current.version() {
            info!(
                version = index.version(),
                previous = current.version(),
                leaves = index.leaves().len(),
                "published index version"
            );
            *current = Arc::new(index);
        }
        Arc::clone(&current)
    }
}
