//! The key schema: which real attributes the index is built over, and in
//! which (virtual) order.

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, Snafu};

use crate::{
    predicate::{Predicate, Query},
    record::{Key, Record},
    value::DataType,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("attribute {} is not part of the index key", attribute))]
    UnknownAttribute { attribute: usize },

    #[snafu(display("record has no value for key attribute '{}' (column {})", name, real_index))]
    MissingValue { name: String, real_index: usize },

    #[snafu(display(
        "key attribute '{}' expects {} values, got {}",
        name,
        expected,
        actual
    ))]
    ValueType {
        name: String,
        expected: DataType,
        actual: DataType,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One indexed attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyAttribute {
    pub name: String,
    /// Column position in stored records.
    pub real_index: usize,
    pub data_type: DataType,
}

/// Ordered list of indexed attributes; the position of an attribute in this
/// list is its virtual index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeySchema {
    attributes: Vec<KeyAttribute>,
}

impl KeySchema {
    pub fn new(attributes: Vec<KeyAttribute>) -> Self {
        Self { attributes }
    }

    pub fn attributes(&self) -> &[KeyAttribute] {
        &self.attributes
    }

    /// Number of virtual attributes.
    pub fn dimensions(&self) -> usize {
        self.attributes.len()
    }

    pub fn attribute(&self, virtual_index: usize) -> Option<&KeyAttribute> {
        self.attributes.get(virtual_index)
    }

    pub fn virtual_attribute(&self, real_index: usize) -> Option<usize> {
        self.attributes
            .iter()
            .position(|a| a.real_index == real_index)
    }

    pub fn real_attribute(&self, virtual_index: usize) -> Option<usize> {
        self.attributes.get(virtual_index).map(|a| a.real_index)
    }

    /// Translate a predicate from real into virtual attribute numbering.
    pub fn to_virtual(&self, predicate: &Predicate) -> Result<Predicate> {
        let attribute = self
            .virtual_attribute(predicate.attribute)
            .context(UnknownAttributeSnafu {
                attribute: predicate.attribute,
            })?;
        Ok(predicate.with_attribute(attribute))
    }

    /// Translate every predicate of `query` into virtual attribute numbering.
    pub fn to_virtual_query(&self, query: &Query) -> Result<Query> {
        let predicates = query
            .predicates
            .iter()
            .map(|p| self.to_virtual(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Query::new(predicates))
    }

    /// Project a record onto the virtual key space.
    pub fn key_of(&self, record: &Record) -> Result<Key> {
        self.attributes
            .iter()
            .map(|a| {
                let v = record.get(a.real_index).context(MissingValueSnafu {
                    name: &a.name,
                    real_index: a.real_index,
                })?;
                if v.data_type() != a.data_type {
                    return ValueTypeSnafu {
                        name: &a.name,
                        expected: a.data_type,
                        actual: v.data_type(),
                    }
                    .fail();
                }
                Ok(v.clone())
            })
            .collect()
    }
}
