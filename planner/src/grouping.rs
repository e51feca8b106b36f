//! Batching relevant leaves into splits.
//!
//! Leaves arrive in left-to-right order together with their root-to-leaf
//! path. A subtree whose estimated size fits into one split becomes one
//! split (per read strategy); a larger one is divided between its children.
//! When both children of a divided node end up as a single split each, the
//! two are merged again if they read the same way and either is below the
//! minimum split size. Splits from different parents are never merged, so
//! every split covers a contiguous run of leaves below one index node.

use data_types::PartitionId;
use observability_deps::tracing::trace;

use crate::{PartitionSplit, PlannerConfig, ReadStrategy};

/// A relevant leaf with its estimated size and chosen read strategy.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub partition: PartitionId,
    pub path: Vec<bool>,
    pub records: u64,
    pub strategy: ReadStrategy,
}

#[derive(Debug)]
struct Group {
    partitions: Vec<PartitionId>,
    records: u64,
    strategy: ReadStrategy,
}

impl Group {
    fn new(c: &Candidate) -> Self {
        Self {
            partitions: vec![c.partition],
            records: c.records,
            strategy: c.strategy.clone(),
        }
    }

    fn absorb(&mut self, other: Self) {
        self.partitions.extend(other.partitions);
        self.records = self.records.saturating_add(other.records);
    }

    fn can_merge(&self, other: &Self, config: &PlannerConfig) -> bool {
        if !self.strategy.mergeable(&other.strategy) {
            return false;
        }
        let merged = self.records.saturating_add(other.records);
        merged <= config.max_split_records
            || self.records < config.min_split_records
            || other.records < config.min_split_records
    }
}

pub(crate) fn group_splits(candidates: &[Candidate], config: &PlannerConfig) -> Vec<PartitionSplit> {
    if candidates.is_empty() {
        return vec![];
    }
    group(candidates, 0, config)
        .into_iter()
        .map(|g| {
            trace!(
                partitions = g.partitions.len(),
                records = g.records,
                strategy = g.strategy.name(),
                "split formed"
            );
            PartitionSplit::new(g.partitions, g.strategy)
        })
        .collect()
}

fn group(candidates: &[Candidate], depth: usize, config: &PlannerConfig) -> Vec<Group> {
    let total = candidates
        .iter()
        .fold(0u64, |acc, c| acc.saturating_add(c.records));
    if candidates.len() == 1 || total <= config.max_split_records {
        return by_strategy(candidates);
    }

    // candidates share the path prefix up to `depth`; left turns come first
    let mid = candidates.partition_point(|c| !c.path.get(depth).copied().unwrap_or(false));
    let (left, right) = candidates.split_at(mid);

    let mut groups = group(left, depth + 1, config);
    let rest = if right.is_empty() {
        vec![]
    } else {
        group(right, depth + 1, config)
    };
    if groups.is_empty() {
        return rest;
    }
    merge_siblings(&mut groups, rest, config);
    groups
}

/// Runs of same-strategy candidates. Repartitioned leaves always stand
/// alone.
fn by_strategy(candidates: &[Candidate]) -> Vec<Group> {
    let mut groups: Vec<Group> = vec![];
    for c in candidates {
        match groups.last_mut() {
            Some(last) if last.strategy.mergeable(&c.strategy) => last.absorb(Group::new(c)),
            _ => groups.push(Group::new(c)),
        }
    }
    groups
}

/// Merge `right` into `left` only when each is one whole sibling subtree.
fn merge_siblings(left: &mut Vec<Group>, mut right: Vec<Group>, config: &PlannerConfig) {
    if left.len() == 1 && right.len() == 1 && left[0].can_merge(&right[0], config) {
        if let Some(sibling) = right.pop() {
            left[0].absorb(sibling);
        }
        return;
    }
    left.extend(right);
}
