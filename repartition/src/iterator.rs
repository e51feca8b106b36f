//! Execution of one adapt plan.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use data_types::{PartitionId, Record};
use futures::stream::{FuturesUnordered, StreamExt};
use observability_deps::tracing::{debug, error, info, warn};
use partition_lock::{plan_lock_name, PartitionLock};
use partition_store::{CommitJournal, CommitPhase};
use planner::RepartitionPlan;
use snafu::{ensure, ResultExt};

use crate::{
    commit, Dataset, Error, InvalidStateSnafu, JournalSnafu, LockSnafu, ReadPartitionSnafu,
    RecordKeySnafu, Recovery, Result, SessionSnafu, WritePartitionSnafu,
};

/// Lifecycle of a [`RepartitionIterator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepartitionState {
    /// Old partitions may have been read; nothing is written yet.
    Planned,
    /// New partitions are being, or have been, written.
    Writing,
    /// Registering new and dropping old partitions.
    Committing,
    Done,
    /// Terminal. Either the old partitions are still authoritative (failure
    /// while writing, or a stale plan) or a journal is left for recovery
    /// (failure while committing).
    Failed,
}

/// Reads the old partitions of a plan, returns the records matching the
/// plan's query and replaces the old partitions with the refined ones.
///
/// From the first journal write until the journal is gone the iterator
/// holds the plan lease, which tells recovery in other processes that the
/// plan has a live owner.
///
/// ```text
/// Planned --write--> Writing --commit--> Committing --> Done
///                       |                    |
///                       +------> Failed <----+
/// ```
#[derive(Debug)]
pub struct RepartitionIterator {
    plan: Arc<RepartitionPlan>,
    dataset: Dataset,
    state: RepartitionState,
    /// Old partitions already read.
    old: BTreeMap<PartitionId, u64>,
    /// Records routed to each new partition, not yet durable.
    new: BTreeMap<PartitionId, Vec<Record>>,
    journal: Option<CommitJournal>,
    /// Session holding the plan lease while writing and committing.
    locks: Option<PartitionLock>,
}

impl RepartitionIterator {
    pub fn new(plan: Arc<RepartitionPlan>, dataset: Dataset) -> Self {
        Self {
            plan,
            dataset,
            state: RepartitionState::Planned,
            old: Default::default(),
            new: Default::default(),
            journal: None,
            locks: None,
        }
    }

    pub fn state(&self) -> RepartitionState {
        self.state
    }

    pub fn plan(&self) -> &Arc<RepartitionPlan> {
        &self.plan
    }

    fn ensure_state(&self, expected: RepartitionState, action: &'static str) -> Result<()> {
        ensure!(
            self.state == expected,
            InvalidStateSnafu {
                plan_id: self.plan.id,
                action,
                state: self.state,
            }
        );
        Ok(())
    }

    /// Read every old partition, route its records to the new partitions
    /// and return those matching the plan's query.
    pub async fn read(&mut self) -> Result<Vec<Record>> {
        self.ensure_state(RepartitionState::Planned, "read")?;
        let plan_id = self.plan.id;
        ensure!(
            self.old.is_empty(),
            InvalidStateSnafu {
                plan_id,
                action: "read twice",
                state: self.state,
            }
        );

        let mut matching = vec![];
        for split in &self.plan.splits {
            let records = match self.dataset.store.read_partition(split.partition).await {
                Ok(records) => records,
                Err(source) => {
                    self.state = RepartitionState::Failed;
                    return Err(source).context(ReadPartitionSnafu {
                        plan_id,
                        partition: split.partition,
                    });
                }
            };
            self.old.insert(split.partition, records.len() as u64);

            for &p in &split.new_partitions() {
                self.new.entry(p).or_default();
            }
            for record in records {
                let key = match self.dataset.schema.key_of(&record) {
                    Ok(key) => key,
                    Err(source) => {
                        self.state = RepartitionState::Failed;
                        return Err(source).context(RecordKeySnafu { plan_id });
                    }
                };
                if self.plan.query.matches(&key) {
                    matching.push(record.clone());
                }
                self.new
                    .entry(split.route(&key))
                    .or_default()
                    .push(record);
            }
        }

        debug!(
            %plan_id,
            old = self.old.len(),
            matching = matching.len(),
            "old partitions read"
        );
        Ok(matching)
    }

    /// Write the new partitions and commit them. Requires [`Self::read`].
    pub async fn finish(&mut self) -> Result<()> {
        self.write().await?;
        self.commit().await
    }

    /// Durably write every new partition.
    ///
    /// The journal is written first, so a crash from here on is undone by
    /// recovery. All writes run to completion even if one fails; a failure
    /// deletes whatever was written and leaves the old partitions
    /// authoritative.
    pub async fn write(&mut self) -> Result<()> {
        self.ensure_state(RepartitionState::Planned, "write")?;
        if self.old.len() != self.plan.splits.len() {
            return InvalidStateSnafu {
                plan_id: self.plan.id,
                action: "write before reading",
                state: self.state,
            }
            .fail();
        }
        let plan_id = self.plan.id;
        let start = Instant::now();
        self.state = RepartitionState::Writing;

        match self.take_plan_lease().await {
            Ok(locks) => self.locks = Some(locks),
            Err(e) => {
                self.state = RepartitionState::Failed;
                return Err(e);
            }
        }

        let mut journal = CommitJournal::new(plan_id, self.plan.splits.clone());
        if let Err(e) = self
            .dataset
            .store
            .put_journal(&journal)
            .await
            .context(JournalSnafu { plan_id })
        {
            self.abandon().await;
            return Err(e);
        }

        let store = &self.dataset.store;
        let results: Vec<_> = self
            .new
            .iter()
            .map(|(partition, records)| async move {
                let partition = *partition;
                store
                    .write_partition(partition, records)
                    .await
                    .map(|n| (partition, n))
                    .context(WritePartitionSnafu { plan_id, partition })
            })
            .collect::<FuturesUnordered<_>>()
            .collect()
            .await;

        let written = results
            .into_iter()
            .collect::<Result<Vec<_>>>()
            .map(|mut counts| {
                counts.sort();
                journal.counts = counts;
                journal.phase = CommitPhase::Committing;
                journal
            });
        let journal = match written {
            Ok(journal) => journal,
            Err(e) => {
                error!(%plan_id, %e, "writing new partitions failed, abandoning plan");
                self.abandon().await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .dataset
            .store
            .put_journal(&journal)
            .await
            .context(JournalSnafu { plan_id })
        {
            error!(%plan_id, %e, "recording written partitions failed, abandoning plan");
            self.abandon().await;
            return Err(e);
        }

        info!(
            %plan_id,
            partitions = journal.counts.len(),
            records = journal.counts.iter().map(|(_, c)| c).sum::<u64>(),
            elapsed = ?start.elapsed(),
            "new partitions written"
        );
        self.journal = Some(journal);
        Ok(())
    }

    /// Delete the new partitions and the journal. Old partitions stay
    /// authoritative.
    async fn abandon(&mut self) {
        let plan_id = self.plan.id;
        self.state = RepartitionState::Failed;
        for partition in self.new.keys() {
            if let Err(e) = self.dataset.store.delete_partition(*partition).await {
                warn!(%plan_id, partition_id = %partition, %e, "unable to remove abandoned partition");
            }
        }
        if let Err(e) = self.dataset.store.delete_journal(plan_id).await {
            warn!(%plan_id, %e, "unable to remove journal of abandoned plan");
        }
        self.new.clear();
        self.old.clear();
        if let Some(locks) = self.locks.take() {
            release_plan_lease(plan_id, locks).await;
        }
    }

    async fn take_plan_lease(&self) -> Result<PartitionLock> {
        let plan_id = self.plan.id;
        let mut locks = PartitionLock::connect(
            self.dataset.coordinator.as_ref(),
            &self.dataset.coordination_hosts,
            self.dataset.lease_timeout,
        )
        .await
        .context(SessionSnafu)?;
        if let Err(e) = locks.lock(&plan_lock_name(plan_id)).await {
            if let Err(e) = locks.close().await {
                warn!(%plan_id, %e, "unable to close coordination session");
            }
            return Err(e).context(LockSnafu { plan_id });
        }
        Ok(locks)
    }

    /// Register the new partitions, drop the old ones and publish the
    /// refined index.
    ///
    /// When a step fails the plan lease is given up and the journal is
    /// resumed once right away, so a transient failure does not leave this
    /// process planning against a dropped partition. If that fails too the
    /// journal stays behind for recovery.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_state(RepartitionState::Writing, "commit")?;
        let plan_id = self.plan.id;
        let (mut journal, mut locks) = match (self.journal.take(), self.locks.take()) {
            (Some(journal), Some(locks)) => (journal, locks),
            _ => {
                return InvalidStateSnafu {
                    plan_id,
                    action: "commit before writing",
                    state: self.state,
                }
                .fail()
            }
        };

        self.state = RepartitionState::Committing;
        let start = Instant::now();
        let result = commit::complete(&self.dataset, &mut locks, &mut journal).await;
        release_plan_lease(plan_id, locks).await;
        self.old.clear();
        self.new.clear();

        match result {
            Ok(()) => {
                self.state = RepartitionState::Done;
                debug!(%plan_id, elapsed = ?start.elapsed(), "commit finished");
                Ok(())
            }
            Err(e @ Error::StalePlan { .. }) => {
                warn!(%plan_id, %e, "plan went stale, old partitions stay authoritative");
                self.state = RepartitionState::Failed;
                Err(e)
            }
            Err(e) => {
                error!(
                    %plan_id,
                    %e,
                    claimed = ?journal.claimed,
                    stored = ?journal.stored,
                    dropped = ?journal.dropped,
                    "commit failed, resuming journal"
                );
                match Recovery::new(self.dataset.clone()).resume(plan_id).await {
                    Ok(report) if report.completed == 1 => {
                        info!(%plan_id, "journal resumed, repartition committed");
                        self.state = RepartitionState::Done;
                        Ok(())
                    }
                    Ok(_) => {
                        self.state = RepartitionState::Failed;
                        Err(e)
                    }
                    Err(retry) => {
                        warn!(%plan_id, %retry, "journal left for recovery");
                        self.state = RepartitionState::Failed;
                        Err(e)
                    }
                }
            }
        }
    }
}

/// Give up the plan lease and close its session. The journal, if any, is
/// now open to recovery.
async fn release_plan_lease(plan_id: uuid::Uuid, mut locks: PartitionLock) {
    if let Err(e) = locks.unlock(&plan_lock_name(plan_id)).await {
        warn!(%plan_id, %e, "unable to release plan lease");
    }
    if let Err(e) = locks.close().await {
        warn!(%plan_id, %e, "unable to close coordination session");
    }
}
