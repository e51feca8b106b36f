//! Lease bookkeeping for one commit or recovery run.

use std::{fmt::Display, sync::Arc, time::Duration};

use data_types::PartitionId;
use hashbrown::HashMap;
use observability_deps::tracing::{debug, warn};

use crate::{Coordinator, Error, Lease, LeaseSession, Result};

/// Prefix of the lease name guarding a partition.
pub const LOCK_PATH_BASE: &str = "/partition-lock-";

/// Prefix of the lease held by the owner of an in-flight repartition.
pub const PLAN_LOCK_PATH_BASE: &str = "/plan-lock-";

/// Serializes read-modify-write cycles of the persisted index.
pub const INDEX_LOCK: &str = "/partition-index-lock";

/// Serializes allocation of partition ids.
pub const IDS_LOCK: &str = "/partition-ids-lock";

/// Lease name guarding `partition`.
pub fn lock_name(partition: PartitionId) -> String {
    format!("{}{}", LOCK_PATH_BASE, partition)
}

/// Lease name marking the repartition `plan_id` as owned by a live process.
pub fn plan_lock_name(plan_id: impl Display) -> String {
    format!("{}{}", PLAN_LOCK_PATH_BASE, plan_id)
}

/// Tracks the leases taken through one session.
///
/// Every `lock_*` must be paired with the matching `unlock_*`;
/// [`PartitionLock::close`] force-releases whatever is left so a failed
/// commit never strands a lease.
#[derive(Debug)]
pub struct PartitionLock {
    session: Arc<dyn LeaseSession>,
    timeout: Duration,
    leases: HashMap<String, Lease>,
}

impl PartitionLock {
    pub fn new(session: Arc<dyn LeaseSession>, timeout: Duration) -> Self {
        Self {
            session,
            timeout,
            leases: Default::default(),
        }
    }

    /// Open a fresh session against `hosts` and wrap it.
    pub async fn connect(
        coordinator: &dyn Coordinator,
        hosts: &[String],
        timeout: Duration,
    ) -> Result<Self> {
        let session = coordinator.connect(hosts).await?;
        Ok(Self::new(session, timeout))
    }

    /// Block until the lease `name` is ours.
    pub async fn lock(&mut self, name: &str) -> Result<()> {
        let lease = self.session.acquire(name, self.timeout).await?;
        debug!(lease = name, "locked");
        self.leases.insert(name.to_string(), lease);
        Ok(())
    }

    /// Take the lease `name` if it is free. Returns false when someone
    /// else holds it.
    pub async fn try_lock(&mut self, name: &str) -> Result<bool> {
        match self.session.try_acquire(name).await? {
            Some(lease) => {
                debug!(lease = name, "locked");
                self.leases.insert(name.to_string(), lease);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Release the lease `name`. Unlocking a lease that was never taken
    /// through this manager is a caller bug and fails with
    /// [`Error::NotLocked`].
    pub async fn unlock(&mut self, name: &str) -> Result<()> {
        let lease = self.leases.remove(name).ok_or_else(|| Error::NotLocked {
            name: name.to_string(),
        })?;
        self.session.release(lease).await?;
        debug!(lease = name, "unlocked");
        Ok(())
    }

    /// Block until the lease of `partition` is ours.
    pub async fn lock_partition(&mut self, partition: PartitionId) -> Result<()> {
        self.lock(&lock_name(partition)).await
    }

    pub async fn unlock_partition(&mut self, partition: PartitionId) -> Result<()> {
        self.unlock(&lock_name(partition)).await
    }

    /// Returns true if this manager holds the lease of `partition`.
    pub fn is_locked(&self, partition: PartitionId) -> bool {
        self.leases.contains_key(&lock_name(partition))
    }

    pub fn session(&self) -> &Arc<dyn LeaseSession> {
        &self.session
    }

    /// Release every lease still held, then close the session. The first
    /// release error is returned after all leases were attempted.
    pub async fn close(mut self) -> Result<()> {
        let mut first_error = None;
        for (name, lease) in self.leases.drain() {
            warn!(lease = %name, "force-releasing lease");
            if let Err(e) = self.session.release(lease).await {
                first_error.get_or_insert(e);
            }
        }
        self.session.close().await?;
        first_error.map_or(Ok(()), Err)
    }
}
