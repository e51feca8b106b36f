//! The versioned index tree.

use std::fmt::Display;

use data_types::{Key, PartitionId, Query, Region, TypedValue};
use hashbrown::HashSet;
use observability_deps::tracing::debug;
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt};

use crate::{
    split::IndexSplit, CorruptSnafu, NoRefinementSnafu, Result, StaleSplitSnafu,
    UnknownAttributeSnafu, UnknownPartitionSnafu,
};

/// Position of a node in the index arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    Leaf {
        partition: PartitionId,
    },
    /// Keys with `key[attribute] <= value` descend into `left`.
    Internal {
        attribute: usize,
        value: TypedValue,
        left: NodeId,
        right: NodeId,
    },
}

/// A leaf together with the region it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafRegion {
    pub node: NodeId,
    pub partition: PartitionId,
    pub region: Region,
    /// Root-to-leaf path; `false` is a left turn.
    pub path: Vec<bool>,
}

/// One immutable version of the partition index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionIndex {
    version: u64,
    dimensions: usize,
    root: NodeId,
    nodes: Vec<Node>,
    next_partition_id: PartitionId,
    /// Keys sampled at bulk load, used to pick split boundaries and to
    /// estimate selectivity.
    sample: Vec<Key>,
    /// Partitions replaced by a split, with the node that held them.
    #[serde(default)]
    retired: Vec<(PartitionId, NodeId)>,
}

impl PartitionIndex {
    /// A single-leaf index covering the whole key space.
    pub fn single(dimensions: usize, partition: PartitionId, sample: Vec<Key>) -> Self {
        Self {
            version: 0,
            dimensions,
            root: NodeId(0),
            nodes: vec![Node::Leaf { partition }],
            next_partition_id: partition.next(),
            sample,
            retired: vec![],
        }
    }

    pub(crate) fn from_parts(
        dimensions: usize,
        nodes: Vec<Node>,
        root: NodeId,
        sample: Vec<Key>,
    ) -> Result<Self> {
        let next_partition_id = nodes
            .iter()
            .filter_map(|n| match n {
                Node::Leaf { partition } => Some(partition.next()),
                Node::Internal { .. } => None,
            })
            .max()
            .unwrap_or_else(|| PartitionId::new(0));
        let index = Self {
            version: 0,
            dimensions,
            root,
            nodes,
            next_partition_id,
            sample,
            retired: vec![],
        };
        index.validate()?;
        Ok(index)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// The lowest partition id not yet used by this index.
    pub fn next_partition_id(&self) -> PartitionId {
        self.next_partition_id
    }

    pub fn sample(&self) -> &[Key] {
        &self.sample
    }

    /// The region covered by the whole index.
    pub fn root_region(&self) -> Region {
        Region::unbounded(self.dimensions)
    }

    /// All leaves whose region may contain a key satisfying `query`, in
    /// left-to-right order.
    pub fn lookup(&self, query: &Query) -> Vec<LeafRegion> {
        let mut out = vec![];
        self.collect(self.root, self.root_region(), &mut vec![], query, &mut out);
        out
    }

    /// Every leaf of the index, in left-to-right order.
    pub fn leaves(&self) -> Vec<LeafRegion> {
        self.lookup(&Query::default())
    }

    fn collect(
        &self,
        id: NodeId,
        region: Region,
        path: &mut Vec<bool>,
        query: &Query,
        out: &mut Vec<LeafRegion>,
    ) {
        if !region.intersects(query) {
            return;
        }
        match &self.nodes[id.0] {
            Node::Leaf { partition } => out.push(LeafRegion {
                node: id,
                partition: *partition,
                region,
                path: path.clone(),
            }),
            Node::Internal {
                attribute,
                value,
                left,
                right,
            } => {
                let (l, r) = region.split(*attribute, value);
                path.push(false);
                self.collect(*left, l, path, query, out);
                path.pop();
                path.push(true);
                self.collect(*right, r, path, query, out);
                path.pop();
            }
        }
    }

    /// The partition a key belongs to.
    pub fn route(&self, key: &[TypedValue]) -> PartitionId {
        let mut id = self.root;
        loop {
            match &self.nodes[id.0] {
                Node::Leaf { partition } => return *partition,
                Node::Internal {
                    attribute,
                    value,
                    left,
                    right,
                } => {
                    id = match key.get(*attribute) {
                        Some(v) if v <= value => *left,
                        _ => *right,
                    };
                }
            }
        }
    }

    /// The leaf currently holding `partition`.
    pub fn leaf(&self, partition: PartitionId) -> Option<LeafRegion> {
        self.leaves().into_iter().find(|l| l.partition == partition)
    }

    /// The leaves that took over the data of `partition`, in left-to-right
    /// order. `None` if `partition` was never split in this index's history.
    pub fn successors(&self, partition: PartitionId) -> Option<Vec<PartitionId>> {
        let (_, node) = self.retired.iter().find(|(p, _)| *p == partition)?;
        let mut out = vec![];
        let mut stack = vec![*node];
        while let Some(id) = stack.pop() {
            match self.nodes.get(id.0)? {
                Node::Leaf { partition } => out.push(*partition),
                Node::Internal { left, right, .. } => {
                    stack.push(*right);
                    stack.push(*left);
                }
            }
        }
        Some(out)
    }

    fn find_leaf(&self, partition: PartitionId) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| matches!(n, Node::Leaf { partition: p } if *p == partition))
            .map(NodeId)
    }

    /// Sample keys falling inside `region`.
    fn sample_in<'a>(&'a self, region: &'a Region) -> impl Iterator<Item = &'a Key> + 'a {
        self.sample.iter().filter(move |k| region.contains_key(k))
    }

    /// Fraction of the leaf's sampled keys satisfying `query`, or `None` when
    /// no sampled key falls into the leaf.
    pub fn estimate_selectivity(&self, leaf: &LeafRegion, query: &Query) -> Option<f64> {
        let (mut total, mut matching) = (0usize, 0usize);
        for key in self.sample_in(&leaf.region) {
            total += 1;
            if query.matches(key) {
                matching += 1;
            }
        }
        (total > 0).then(|| matching as f64 / total as f64)
    }

    /// A boundary along `attribute` dividing the leaf's sampled keys into two
    /// roughly equal, non-empty groups. `None` means no refinement is
    /// possible: no sampled key falls into the leaf, or they all share the
    /// same value.
    pub fn median_boundary(&self, leaf: &LeafRegion, attribute: usize) -> Option<TypedValue> {
        let values: Vec<_> = self
            .sample_in(&leaf.region)
            .filter_map(|k| k.get(attribute))
            .cloned()
            .collect();
        crate::build::median_boundary(values)
    }

    /// Propose replacing the leaf holding `partition` with two children
    /// split at `boundary`, minting `first_id` and its successor as the new
    /// partition ids.
    pub fn plan_split(
        &self,
        partition: PartitionId,
        attribute: usize,
        boundary: TypedValue,
        first_id: PartitionId,
    ) -> Result<IndexSplit> {
        ensure!(
            attribute < self.dimensions,
            UnknownAttributeSnafu {
                attribute,
                dimensions: self.dimensions
            }
        );
        let leaf = self.leaf(partition).context(UnknownPartitionSnafu {
            partition,
            version: self.version,
        })?;
        let divides = leaf
            .region
            .range(attribute)
            .map(|r| r.splits_at(&boundary))
            .unwrap_or(false);
        ensure!(divides, NoRefinementSnafu { partition, attribute });

        Ok(IndexSplit {
            partition,
            attribute,
            value: boundary,
            left: first_id,
            right: first_id.next(),
        })
    }

    /// Derive the successor version with every split applied.
    ///
    /// A split whose leaf has already been replaced by exactly that split is
    /// skipped, so replaying a committed plan is harmless. A split whose leaf
    /// is gone for any other reason is stale and fails the whole call.
    pub fn apply(&self, splits: &[IndexSplit]) -> Result<Self> {
        let mut next = self.clone();
        for split in splits {
            match next.find_leaf(split.partition) {
                Some(id) => {
                    ensure!(
                        split.attribute < next.dimensions,
                        UnknownAttributeSnafu {
                            attribute: split.attribute,
                            dimensions: next.dimensions
                        }
                    );
                    let left = NodeId(next.nodes.len());
                    next.nodes.push(Node::Leaf {
                        partition: split.left,
                    });
                    let right = NodeId(next.nodes.len());
                    next.nodes.push(Node::Leaf {
                        partition: split.right,
                    });
                    next.nodes[id.0] = Node::Internal {
                        attribute: split.attribute,
                        value: split.value.clone(),
                        left,
                        right,
                    };
                    next.retired.push((split.partition, id));
                    next.next_partition_id = next
                        .next_partition_id
                        .max(split.left.next())
                        .max(split.right.next());
                }
                None if next.is_applied(split) => {
                    debug!(partition = %split.partition, "split already applied");
                }
                None => return StaleSplitSnafu {
                    partition: split.partition,
                }
                .fail(),
            }
        }
        next.version += 1;
        next.validate()?;
        Ok(next)
    }

    fn is_applied(&self, split: &IndexSplit) -> bool {
        self.nodes.iter().any(|n| match n {
            Node::Internal {
                attribute,
                value,
                left,
                right,
            } => {
                *attribute == split.attribute
                    && value == &split.value
                    && self.nodes.get(left.0) == Some(&Node::Leaf { partition: split.left })
                    && self.nodes.get(right.0)
                        == Some(&Node::Leaf {
                            partition: split.right,
                        })
            }
            Node::Leaf { .. } => false,
        })
    }

    /// Check the structural invariants: every node is reachable exactly
    /// once from the root, split attributes are in range, every split value
    /// divides its node's region and no partition id appears twice.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let mut partitions = HashSet::new();
        let mut stack = vec![(self.root, self.root_region())];

        while let Some((id, region)) = stack.pop() {
            let node = self.nodes.get(id.0).context(CorruptSnafu {
                reason: format!("dangling node reference {}", id),
            })?;
            ensure!(
                seen.insert(id),
                CorruptSnafu {
                    reason: format!("node {} reachable twice", id)
                }
            );
            match node {
                Node::Leaf { partition } => ensure!(
                    partitions.insert(*partition),
                    CorruptSnafu {
                        reason: format!("partition {} appears in two leaves", partition)
                    }
                ),
                Node::Internal {
                    attribute,
                    value,
                    left,
                    right,
                } => {
                    let range = region.range(*attribute).context(CorruptSnafu {
                        reason: format!("node {} splits on unknown attribute {}", id, attribute),
                    })?;
                    ensure!(
                        range.splits_at(value),
                        CorruptSnafu {
                            reason: format!("node {} split value {} outside its region", id, value)
                        }
                    );
                    let (l, r) = region.split(*attribute, value);
                    stack.push((*left, l));
                    stack.push((*right, r));
                }
            }
        }

        for (partition, node) in &self.retired {
            ensure!(
                matches!(self.nodes.get(node.0), Some(Node::Internal { .. }))
                    && !partitions.contains(partition),
                CorruptSnafu {
                    reason: format!("retired partition {} still referenced", partition)
                }
            );
        }

        ensure!(
            seen.len() == self.nodes.len(),
            CorruptSnafu {
                reason: format!(
                    "{} of {} nodes unreachable",
                    self.nodes.len() - seen.len(),
                    self.nodes.len()
                )
            }
        );
        Ok(())
    }
}
