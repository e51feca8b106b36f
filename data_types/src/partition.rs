use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Unique identifier of a physical partition.
///
/// Identifiers are never reused: refining the index retires the old id and
/// mints fresh ones for the children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(i64);

impl PartitionId {
    pub const fn new(v: i64) -> Self {
        Self(v)
    }

    pub fn get(&self) -> i64 {
        self.0
    }

    /// The identifier following this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for PartitionId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}
