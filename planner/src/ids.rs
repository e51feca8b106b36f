//! Partition ids shared by every process planning on one replica.

use std::{fmt::Debug, sync::Arc, time::Duration};

use data_types::PartitionId;
use observability_deps::tracing::debug;
use partition_lock::{LeaseSession, IDS_LOCK};
use partition_store::PartitionStore;
use snafu::ResultExt;

use crate::{IdCounterSnafu, IdLeaseSnafu, Result};

/// Hands out partition ids from a counter persisted next to the index.
///
/// The counter is read and bumped while holding [`IDS_LOCK`], so two
/// processes refining different leaves of the same replica never mint the
/// same id.
#[derive(Debug)]
pub struct ClusterIds {
    store: PartitionStore,
    session: Arc<dyn LeaseSession>,
    timeout: Duration,
}

impl ClusterIds {
    pub fn new(store: PartitionStore, session: Arc<dyn LeaseSession>, timeout: Duration) -> Self {
        Self {
            store,
            session,
            timeout,
        }
    }

    /// Reserve `n` consecutive ids, none below `floor`, and return the
    /// first.
    pub async fn reserve(&self, n: usize, floor: PartitionId) -> Result<PartitionId> {
        let lease = self
            .session
            .acquire(IDS_LOCK, self.timeout)
            .await
            .context(IdLeaseSnafu)?;
        let bumped = self.bump(n, floor).await;
        let released = self.session.release(lease).await.context(IdLeaseSnafu);
        let first = bumped?;
        released?;
        Ok(first)
    }

    async fn bump(&self, n: usize, floor: PartitionId) -> Result<PartitionId> {
        let stored = self.store.load_next_id().await.context(IdCounterSnafu)?;
        let first = stored.map_or(floor, |next| next.max(floor));
        let next = PartitionId::new(first.get() + n as i64);
        self.store.save_next_id(next).await.context(IdCounterSnafu)?;
        debug!(%first, %next, "partition ids reserved");
        Ok(first)
    }
}
