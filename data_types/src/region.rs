//! Hyper-rectangular regions of the virtual key space.

use serde::{Deserialize, Serialize};

use crate::{predicate::Query, value::TypedValue};

/// The half-open interval `(low, high]` of one attribute. A missing bound is
/// unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeRange {
    pub low: Option<TypedValue>,
    pub high: Option<TypedValue>,
}

impl AttributeRange {
    pub fn contains(&self, v: &TypedValue) -> bool {
        let above = match &self.low {
            None => true,
            Some(low) => v.try_cmp(low).map(|o| o.is_gt()).unwrap_or(false),
        };
        let below = match &self.high {
            None => true,
            Some(high) => v.try_cmp(high).map(|o| o.is_le()).unwrap_or(false),
        };
        above && below
    }

    /// Returns true if `v` lies strictly inside the interval, i.e. splitting
    /// at `v` leaves both halves non-empty in the continuous sense.
    pub fn splits_at(&self, v: &TypedValue) -> bool {
        let above = match &self.low {
            None => true,
            Some(low) => v.try_cmp(low).map(|o| o.is_gt()).unwrap_or(false),
        };
        let below = match &self.high {
            None => true,
            Some(high) => v.try_cmp(high).map(|o| o.is_lt()).unwrap_or(false),
        };
        above && below
    }
}

/// One [`AttributeRange`] per virtual attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region(pub Vec<AttributeRange>);

impl Region {
    /// The whole key space of `dimensions` attributes.
    pub fn unbounded(dimensions: usize) -> Self {
        Self(vec![AttributeRange::default(); dimensions])
    }

    pub fn dimensions(&self) -> usize {
        self.0.len()
    }

    pub fn range(&self, attribute: usize) -> Option<&AttributeRange> {
        self.0.get(attribute)
    }

    /// Divide the region at `value` along `attribute`. Keys with
    /// `key[attribute] <= value` fall into the first region.
    pub fn split(&self, attribute: usize, value: &TypedValue) -> (Self, Self) {
        let mut left = self.clone();
        let mut right = self.clone();
        if let Some(r) = left.0.get_mut(attribute) {
            r.high = Some(value.clone());
        }
        if let Some(r) = right.0.get_mut(attribute) {
            r.low = Some(value.clone());
        }
        (left, right)
    }

    pub fn contains_key(&self, key: &[TypedValue]) -> bool {
        self.0.len() == key.len() && self.0.iter().zip(key).all(|(r, v)| r.contains(v))
    }

    /// Returns true if some key in this region may satisfy `query`.
    /// Predicates on attributes outside the region are treated as matching.
    pub fn intersects(&self, query: &Query) -> bool {
        query.predicates.iter().all(|p| match self.range(p.attribute) {
            Some(r) => p.intersects(r),
            None => true,
        })
    }

    /// Returns true if every key in this region satisfies `query`.
    pub fn within(&self, query: &Query) -> bool {
        query.predicates.iter().all(|p| match self.range(p.attribute) {
            Some(r) => p.contains(r),
            None => false,
        })
    }
}
