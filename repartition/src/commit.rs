//! The commit critical section, shared by live commits and recovery.

use std::{future::Future, sync::Arc};

use data_types::PartitionId;
use observability_deps::tracing::{debug, info, warn};
use partition_index::PartitionIndex;
use partition_lock::{PartitionLock, INDEX_LOCK};
use partition_store::{CommitJournal, CommitPhase};
use snafu::{ensure, ResultExt};
use uuid::Uuid;

use crate::{
    ApplyIndexSnafu, ClaimPartitionSnafu, Dataset, DropPartitionSnafu, Error, InvalidStateSnafu,
    JournalSnafu, LockSnafu, PersistIndexSnafu, RegisterPartitionSnafu, RepartitionState, Result,
    StalePlanSnafu, UnregisterPartitionSnafu,
};

/// Drive a journal in the committing phase to completion: claim every old
/// partition, register every new one, drop the old ones, then refine the
/// persisted index, publish it and forget the journal.
///
/// Each step is idempotent and recorded in the journal as soon as it is
/// done, so a commit whose owner died can be resumed by calling this again.
/// If an old partition turns out to be retired by another plan, nothing
/// has been registered yet: the new partitions and the journal are removed
/// and [`Error::StalePlan`] is returned.
///
/// The caller owns `locks` and must hold the plan lease.
pub(crate) async fn complete(
    dataset: &Dataset,
    locks: &mut PartitionLock,
    journal: &mut CommitJournal,
) -> Result<()> {
    let plan_id = journal.plan_id;
    ensure!(
        journal.phase == CommitPhase::Committing,
        InvalidStateSnafu {
            plan_id,
            action: "commit",
            state: RepartitionState::Writing,
        }
    );

    match claim_old(dataset, locks, journal).await {
        Ok(()) => {}
        Err(e @ Error::StalePlan { .. }) => {
            warn!(%plan_id, %e, "removing partitions of stale plan");
            undo(dataset, journal).await?;
            return Err(e);
        }
        Err(e) => return Err(e),
    }
    register_and_drop(dataset, locks, journal).await?;
    let index = publish_index(dataset, locks, journal).await?;

    dataset
        .store
        .delete_journal(plan_id)
        .await
        .context(JournalSnafu { plan_id })?;

    info!(
        %plan_id,
        old = ?journal.old,
        new = ?journal.new,
        version = index.version(),
        "repartition committed"
    );
    Ok(())
}

/// Delete the new partitions and the journal of a plan that never
/// registered anything. The old partitions stay authoritative.
pub(crate) async fn undo(dataset: &Dataset, journal: &CommitJournal) -> Result<()> {
    let plan_id = journal.plan_id;
    for partition in &journal.new {
        dataset
            .store
            .delete_partition(*partition)
            .await
            .context(DropPartitionSnafu {
                plan_id,
                partition: *partition,
            })?;
    }
    dataset
        .store
        .delete_journal(plan_id)
        .await
        .context(JournalSnafu { plan_id })
}

/// Record in the journal that this plan alone retires each old partition.
///
/// A partition already claimed by another journal, or already gone, makes
/// the plan stale. Checking and recording happen under the partition's
/// lease, so of two plans racing for one leaf exactly one wins.
async fn claim_old(
    dataset: &Dataset,
    locks: &mut PartitionLock,
    journal: &mut CommitJournal,
) -> Result<()> {
    let plan_id = journal.plan_id;
    let store = &dataset.store;

    let pending: Vec<_> = journal.pending_claims().collect();
    for partition in pending {
        let journal = &mut *journal;
        under_lease(locks, plan_id, partition, || async move {
            let journals = store
                .list_journals()
                .await
                .context(ClaimPartitionSnafu { plan_id, partition })?;
            if let Some(rival) = journals
                .iter()
                .find(|j| j.plan_id != plan_id && j.claimed.contains(&partition))
            {
                return StalePlanSnafu {
                    plan_id,
                    partition,
                    reason: format!("is retired by plan {}", rival.plan_id),
                }
                .fail();
            }

            let live = store
                .partition_exists(partition)
                .await
                .context(ClaimPartitionSnafu { plan_id, partition })?;
            ensure!(
                live,
                StalePlanSnafu {
                    plan_id,
                    partition,
                    reason: "no longer exists",
                }
            );

            journal.claimed.insert(partition);
            store
                .put_journal(journal)
                .await
                .context(JournalSnafu { plan_id })
        })
        .await?;
        debug!(%plan_id, partition_id = %partition, "partition claimed");
    }
    Ok(())
}

async fn register_and_drop(
    dataset: &Dataset,
    locks: &mut PartitionLock,
    journal: &mut CommitJournal,
) -> Result<()> {
    let plan_id = journal.plan_id;
    let counts = &dataset.counts;
    let store = &dataset.store;

    let pending: Vec<_> = journal.pending_registrations().collect();
    for partition in pending {
        let records = journal.count_of(partition).unwrap_or_default();
        under_lease(locks, plan_id, partition, || async move {
            counts
                .set_bucket_count(partition, records)
                .await
                .context(RegisterPartitionSnafu { plan_id, partition })
        })
        .await?;

        journal.stored.insert(partition);
        store
            .put_journal(journal)
            .await
            .context(JournalSnafu { plan_id })?;
        debug!(%plan_id, partition_id = %partition, records, "partition registered");
    }

    let pending: Vec<_> = journal.pending_drops().collect();
    for partition in pending {
        under_lease(locks, plan_id, partition, || async move {
            // unregister first so the bucket store never names a partition
            // without data
            counts
                .remove_bucket_count(partition)
                .await
                .context(UnregisterPartitionSnafu { plan_id, partition })?;
            store
                .delete_partition(partition)
                .await
                .context(DropPartitionSnafu { plan_id, partition })
        })
        .await?;

        journal.dropped.insert(partition);
        store
            .put_journal(journal)
            .await
            .context(JournalSnafu { plan_id })?;
        debug!(%plan_id, partition_id = %partition, "partition dropped");
    }
    Ok(())
}

/// Apply the journal's splits on top of the persisted index under the
/// index lease, then publish the result to this process.
async fn publish_index(
    dataset: &Dataset,
    locks: &mut PartitionLock,
    journal: &CommitJournal,
) -> Result<Arc<PartitionIndex>> {
    let plan_id = journal.plan_id;
    locks.lock(INDEX_LOCK).await.context(LockSnafu { plan_id })?;
    let persisted = persist_splits(dataset, journal).await;
    let unlocked = locks.unlock(INDEX_LOCK).await.context(LockSnafu { plan_id });
    let index = persisted?;
    unlocked?;
    Ok(dataset.index.publish(index))
}

async fn persist_splits(dataset: &Dataset, journal: &CommitJournal) -> Result<PartitionIndex> {
    let plan_id = journal.plan_id;
    let persisted = dataset
        .store
        .load_index()
        .await
        .context(PersistIndexSnafu { plan_id })?;
    let next = persisted
        .apply(&journal.splits)
        .context(ApplyIndexSnafu { plan_id })?;
    dataset
        .store
        .save_index(&next)
        .await
        .context(PersistIndexSnafu { plan_id })?;
    Ok(next)
}

/// Run `f` while holding the lease of `partition`. The lease is released
/// whether or not `f` succeeds.
async fn under_lease<F, Fut, T>(
    locks: &mut PartitionLock,
    plan_id: Uuid,
    partition: PartitionId,
    f: F,
) -> Result<T>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
    T: Send,
{
    locks
        .lock_partition(partition)
        .await
        .context(LockSnafu { plan_id })?;
    let result = f().await;
    let unlocked = locks
        .unlock_partition(partition)
        .await
        .context(LockSnafu { plan_id });
    let value = result?;
    unlocked?;
    Ok(value)
}
