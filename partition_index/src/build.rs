//! Bulk construction of the initial index from a key sample.

use data_types::{Key, PartitionId, Region, TypedValue};

use crate::{
    tree::{Node, NodeId, PartitionIndex},
    Result,
};

/// Median-style boundary over `values`.
///
/// Keys `<= boundary` go left, so the boundary must be strictly below the
/// largest value for the right side to be non-empty. When the median equals
/// the maximum the next smaller distinct value is used instead; when every
/// value is the same there is nothing to split.
pub(crate) fn median_boundary(mut values: Vec<TypedValue>) -> Option<TypedValue> {
    if values.is_empty() {
        return None;
    }
    values.sort();
    let max = values.last()?.clone();
    let median = values[(values.len() - 1) / 2].clone();
    if median < max {
        return Some(median);
    }
    values.into_iter().rev().find(|v| v < &max)
}

impl PartitionIndex {
    /// Build a balanced index over `sample` with at most `max_leaves` leaves.
    ///
    /// Levels cycle through the attributes; each internal node splits its
    /// share of the sample at the median. A subtree whose sample cannot be
    /// divided further stays a leaf. Partition ids are assigned left to
    /// right starting at zero.
    pub fn build(dimensions: usize, sample: Vec<Key>, max_leaves: usize) -> Result<Self> {
        let mut depth = 0;
        while dimensions > 0 && (1usize << depth) < max_leaves.max(1) {
            depth += 1;
        }

        let mut builder = Builder {
            dimensions,
            nodes: vec![],
            next_partition: 0,
        };
        let keys: Vec<&Key> = sample.iter().collect();
        let root = builder.node(keys, Region::unbounded(dimensions), 0, depth);
        Self::from_parts(dimensions, builder.nodes, root, sample)
    }
}

struct Builder {
    dimensions: usize,
    nodes: Vec<Node>,
    next_partition: i64,
}

impl Builder {
    fn node(&mut self, keys: Vec<&Key>, region: Region, level: usize, depth: usize) -> NodeId {
        let id = NodeId::from_index(self.nodes.len());
        self.nodes.push(Node::Leaf {
            partition: PartitionId::new(-1),
        });

        let split = (level < depth)
            .then(|| self.pick_split(&keys, &region, level))
            .flatten();

        match split {
            Some((attribute, value)) => {
                let (left_keys, right_keys): (Vec<&Key>, Vec<&Key>) = keys
                    .into_iter()
                    .partition(|k| k.get(attribute).map(|v| v <= &value).unwrap_or(false));
                let (l, r) = region.split(attribute, &value);
                let left = self.node(left_keys, l, level + 1, depth);
                let right = self.node(right_keys, r, level + 1, depth);
                self.nodes[id.get()] = Node::Internal {
                    attribute,
                    value,
                    left,
                    right,
                };
            }
            None => {
                self.nodes[id.get()] = Node::Leaf {
                    partition: PartitionId::new(self.next_partition),
                };
                self.next_partition += 1;
            }
        }
        id
    }

    /// Try the level's attribute first, then the others in order.
    fn pick_split(&self, keys: &[&Key], region: &Region, level: usize) -> Option<(usize, TypedValue)> {
        (0..self.dimensions)
            .map(|offset| (level + offset) % self.dimensions)
            .find_map(|attribute| {
                let values = keys.iter().filter_map(|k| k.get(attribute)).cloned().collect();
                let value = median_boundary(values)?;
                region
                    .range(attribute)
                    .filter(|r| r.splits_at(&value))
                    .map(|_| (attribute, value))
            })
    }
}
