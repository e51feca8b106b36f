//! Filter predicates and queries.
//!
//! A [`Predicate`] names its attribute by index. Whether that index is in
//! the dataset's real attribute numbering or the index's virtual numbering
//! depends on where the predicate came from; translation between the two
//! happens only through [`crate::KeySchema`].

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{region::AttributeRange, value::TypedValue};

/// The comparison a predicate applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PredicateType {
    Eq,
    Gt,
    Geq,
    Lt,
    Leq,
}

impl Display for PredicateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Eq => "=",
            Self::Gt => ">",
            Self::Geq => ">=",
            Self::Lt => "<",
            Self::Leq => "<=",
        };
        write!(f, "{}", s)
    }
}

/// `attribute <predicate_type> value`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Predicate {
    pub attribute: usize,
    pub predicate_type: PredicateType,
    pub value: TypedValue,
}

impl Predicate {
    pub fn new(attribute: usize, predicate_type: PredicateType, value: impl Into<TypedValue>) -> Self {
        Self {
            attribute,
            predicate_type,
            value: value.into(),
        }
    }

    /// Returns the same predicate on a different attribute index.
    pub fn with_attribute(&self, attribute: usize) -> Self {
        Self {
            attribute,
            ..self.clone()
        }
    }

    /// Returns true if `v` satisfies this predicate. A value of a different
    /// type never does.
    pub fn is_relevant(&self, v: &TypedValue) -> bool {
        let ord = match v.try_cmp(&self.value) {
            Ok(ord) => ord,
            Err(_) => return false,
        };
        match self.predicate_type {
            PredicateType::Eq => ord.is_eq(),
            PredicateType::Gt => ord.is_gt(),
            PredicateType::Geq => ord.is_ge(),
            PredicateType::Lt => ord.is_lt(),
            PredicateType::Leq => ord.is_le(),
        }
    }

    /// Returns true if some value inside `range` may satisfy this predicate.
    ///
    /// Conservative: a `true` answer does not guarantee a satisfying value
    /// exists (e.g. between two adjacent integers), but a `false` answer
    /// guarantees none does.
    pub fn intersects(&self, range: &AttributeRange) -> bool {
        let v = &self.value;
        let above_low = || match &range.low {
            None => true,
            Some(low) => low.try_cmp(v).map(|o| o.is_lt()).unwrap_or(true),
        };
        match self.predicate_type {
            PredicateType::Eq => {
                above_low()
                    && match &range.high {
                        None => true,
                        Some(high) => v.try_cmp(high).map(|o| o.is_le()).unwrap_or(true),
                    }
            }
            PredicateType::Lt | PredicateType::Leq => above_low(),
            PredicateType::Gt => match &range.high {
                None => true,
                Some(high) => high.try_cmp(v).map(|o| o.is_gt()).unwrap_or(true),
            },
            PredicateType::Geq => match &range.high {
                None => true,
                Some(high) => high.try_cmp(v).map(|o| o.is_ge()).unwrap_or(true),
            },
        }
    }

    /// Returns true only if every value inside `range` satisfies this
    /// predicate.
    pub fn contains(&self, range: &AttributeRange) -> bool {
        let cmp = |bound: &Option<TypedValue>| {
            bound
                .as_ref()
                .and_then(|b| b.try_cmp(&self.value).ok())
        };
        match self.predicate_type {
            PredicateType::Eq => false,
            PredicateType::Lt => cmp(&range.high).map(|o| o.is_lt()).unwrap_or(false),
            PredicateType::Leq => cmp(&range.high).map(|o| o.is_le()).unwrap_or(false),
            // the low bound is exclusive
            PredicateType::Gt | PredicateType::Geq => {
                cmp(&range.low).map(|o| o.is_ge()).unwrap_or(false)
            }
        }
    }
}

impl Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {} {}", self.attribute, self.predicate_type, self.value)
    }
}

/// A conjunction of predicates. The empty query selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    pub predicates: Vec<Predicate>,
}

impl Query {
    pub fn new(predicates: Vec<Predicate>) -> Self {
        Self { predicates }
    }

    /// Evaluate the query against `values`, where predicate attribute
    /// indexes address positions in `values`. A predicate on a position
    /// beyond the end of `values` never matches.
    pub fn matches(&self, values: &[TypedValue]) -> bool {
        self.predicates.iter().all(|p| {
            values
                .get(p.attribute)
                .map(|v| p.is_relevant(v))
                .unwrap_or(false)
        })
    }
}

impl Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<_> = self.predicates.iter().map(ToString::to_string).collect();
        if parts.is_empty() {
            write!(f, "true")
        } else {
            write!(f, "{}", parts.join(" AND "))
        }
    }
}
