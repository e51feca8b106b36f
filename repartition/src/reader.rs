//! Readers for scan and filter splits.
//!
//! A split is planned against one index version and may be executed after
//! a concurrent commit dropped some of its partitions. The records of a
//! dropped partition live on in its successors, which the readers look up
//! and read instead.

use data_types::{PartitionId, Query, Record};
use observability_deps::tracing::{debug, trace};
use snafu::ResultExt;

use crate::{Dataset, KeySnafu, ListJournalsSnafu, ReadSnafu, RefreshIndexSnafu, Result};

/// Every record of `partitions`, in order.
pub async fn scan(dataset: &Dataset, partitions: &[PartitionId]) -> Result<Vec<Record>> {
    read_live(dataset, partitions, None).await
}

/// The records of `partitions` whose key satisfies `query`.
pub async fn filter(
    dataset: &Dataset,
    partitions: &[PartitionId],
    query: &Query,
) -> Result<Vec<Record>> {
    read_live(dataset, partitions, Some(query)).await
}

async fn read_live(
    dataset: &Dataset,
    partitions: &[PartitionId],
    query: Option<&Query>,
) -> Result<Vec<Record>> {
    let mut pending: Vec<_> = partitions.iter().rev().copied().collect();
    let mut out = vec![];
    while let Some(partition) = pending.pop() {
        let records = match dataset.store.read_partition(partition).await {
            Ok(records) => records,
            Err(source) if source.is_not_found() => match successors(dataset, partition).await? {
                Some(next) => {
                    debug!(partition_id = %partition, successors = ?next, "partition replaced, reading its successors");
                    pending.extend(next.into_iter().rev());
                    continue;
                }
                None => return Err(source).context(ReadSnafu { partition }),
            },
            Err(source) => return Err(source).context(ReadSnafu { partition }),
        };

        let before = out.len();
        match query {
            None => out.extend(records),
            Some(query) => {
                for record in records {
                    let key = dataset
                        .schema
                        .key_of(&record)
                        .context(KeySnafu { partition })?;
                    if query.matches(&key) {
                        out.push(record);
                    }
                }
            }
        }
        trace!(partition_id = %partition, records = out.len() - before, "partition read");
    }
    Ok(out)
}

/// The partitions that took over the records of `partition`, or `None` if
/// nothing is known to have replaced it.
///
/// A commit that dropped `partition` either still has a journal claiming
/// it, or has already persisted the index that replaces it. Journals are
/// consulted first because a journal is only deleted after that index was
/// saved. A newer persisted index is published to this process on the way.
pub async fn successors(dataset: &Dataset, partition: PartitionId) -> Result<Option<Vec<PartitionId>>> {
    let journals = dataset
        .store
        .list_journals()
        .await
        .context(ListJournalsSnafu)?;
    let claimed = journals
        .iter()
        .filter(|j| j.claimed.contains(&partition))
        .flat_map(|j| j.splits.iter())
        .find(|s| s.partition == partition);
    if let Some(split) = claimed {
        return Ok(Some(split.new_partitions().to_vec()));
    }

    let persisted = dataset
        .store
        .load_index()
        .await
        .context(RefreshIndexSnafu)?;
    Ok(dataset.index.publish(persisted).successors(partition))
}
