use serde::{Deserialize, Serialize};

use crate::value::TypedValue;

/// A stored row. Values are in the dataset's real attribute order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record(pub Vec<TypedValue>);

impl Record {
    pub fn new(values: Vec<TypedValue>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[TypedValue] {
        &self.0
    }

    pub fn get(&self, real_attribute: usize) -> Option<&TypedValue> {
        self.0.get(real_attribute)
    }
}

/// The projection of a record onto the index's virtual attribute space.
pub type Key = Vec<TypedValue>;
