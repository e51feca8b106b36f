use data_types::{PartitionId, TypedValue};
use serde::{Deserialize, Serialize};

/// A proposed refinement: replace the leaf holding `partition` by an
/// internal node on `(attribute, value)` whose children hold the fresh
/// partitions `left` and `right`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSplit {
    pub partition: PartitionId,
    pub attribute: usize,
    pub value: TypedValue,
    pub left: PartitionId,
    pub right: PartitionId,
}

impl IndexSplit {
    /// The new partition a key falls into. Keys with fewer attributes than
    /// the split attribute go right, matching the index's own routing.
    pub fn route(&self, key: &[TypedValue]) -> PartitionId {
        match key.get(self.attribute) {
            Some(v) if v <= &self.value => self.left,
            _ => self.right,
        }
    }

    pub fn new_partitions(&self) -> [PartitionId; 2] {
        [self.left, self.right]
    }
}
