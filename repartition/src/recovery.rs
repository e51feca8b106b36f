//! Resuming repartitions whose owner died.

use observability_deps::tracing::{debug, info, warn};
use partition_lock::{plan_lock_name, PartitionLock};
use partition_store::CommitPhase;
use snafu::ResultExt;
use uuid::Uuid;

use crate::{
    commit, Dataset, Error, JournalSnafu, ListJournalsSnafu, LockSnafu, Result, SessionSnafu,
};

/// What a [`Recovery`] run did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Plans that had not finished writing, or went stale, and were undone.
    pub abandoned: usize,
    /// Plans whose commit was driven to completion.
    pub completed: usize,
    /// Plans left alone because their owner is still alive.
    pub skipped: usize,
}

/// Finishes or undoes repartitions left behind in the journal.
///
/// A journal is only touched once its plan lease can be taken. The owner
/// holds that lease from the first journal write until the journal is
/// gone, so a free lease means the owner gave up or its session died, and
/// recovery may safely run while other processes keep repartitioning the
/// same replica.
#[derive(Debug)]
pub struct Recovery {
    dataset: Dataset,
}

impl Recovery {
    pub fn new(dataset: Dataset) -> Self {
        Self { dataset }
    }

    /// Resume every orphaned journal of the replica.
    pub async fn resume_all(&self) -> Result<RecoveryReport> {
        let journals = self
            .dataset
            .store
            .list_journals()
            .await
            .context(ListJournalsSnafu)?;

        let mut report = RecoveryReport::default();
        if journals.is_empty() {
            return Ok(report);
        }

        let mut locks = self.connect().await?;
        let mut result = Ok(());
        for journal in journals {
            result = self.resume_one(&mut locks, journal.plan_id, &mut report).await;
            if result.is_err() {
                break;
            }
        }
        let closed = locks.close().await.context(SessionSnafu);
        result?;
        closed?;

        if report != RecoveryReport::default() {
            info!(
                abandoned = report.abandoned,
                completed = report.completed,
                skipped = report.skipped,
                "recovery finished"
            );
        }
        Ok(report)
    }

    /// Resume the journal of `plan_id` if its owner is gone.
    pub async fn resume(&self, plan_id: Uuid) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut locks = self.connect().await?;
        let result = self.resume_one(&mut locks, plan_id, &mut report).await;
        let closed = locks.close().await.context(SessionSnafu);
        result?;
        closed?;
        Ok(report)
    }

    async fn connect(&self) -> Result<PartitionLock> {
        PartitionLock::connect(
            self.dataset.coordinator.as_ref(),
            &self.dataset.coordination_hosts,
            self.dataset.lease_timeout,
        )
        .await
        .context(SessionSnafu)
    }

    async fn resume_one(
        &self,
        locks: &mut PartitionLock,
        plan_id: Uuid,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let lease = plan_lock_name(plan_id);
        if !locks.try_lock(&lease).await.context(LockSnafu { plan_id })? {
            info!(%plan_id, "repartition owned by a live process, leaving it alone");
            report.skipped += 1;
            return Ok(());
        }
        let result = self.recover(locks, plan_id, report).await;
        let unlocked = locks.unlock(&lease).await.context(LockSnafu { plan_id });
        result?;
        unlocked
    }

    async fn recover(
        &self,
        locks: &mut PartitionLock,
        plan_id: Uuid,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        // the listing may be older than the lease
        let mut journal = match self.dataset.store.get_journal(plan_id).await {
            Ok(journal) => journal,
            Err(e) if e.is_not_found() => {
                debug!(%plan_id, "journal finished before recovery reached it");
                return Ok(());
            }
            Err(e) => return Err(e).context(JournalSnafu { plan_id }),
        };

        match journal.phase {
            CommitPhase::Writing => {
                warn!(%plan_id, new = ?journal.new, "undoing interrupted write");
                commit::undo(&self.dataset, &journal).await?;
                report.abandoned += 1;
            }
            CommitPhase::Committing => {
                warn!(
                    %plan_id,
                    claimed = ?journal.claimed,
                    stored = ?journal.stored,
                    dropped = ?journal.dropped,
                    "resuming interrupted commit"
                );
                match commit::complete(&self.dataset, locks, &mut journal).await {
                    Ok(()) => report.completed += 1,
                    Err(Error::StalePlan { .. }) => report.abandoned += 1,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}
