//! Typed attribute values.

use std::{cmp::Ordering, fmt::Display};

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cannot compare {} value with {} value", left, right))]
    TypeMismatch { left: DataType, right: DataType },

    #[snafu(display("cannot parse '{}' as an integer: {}", text, source))]
    ParseInt {
        text: String,
        source: std::num::ParseIntError,
    },

    #[snafu(display("cannot parse '{}' as a float: {}", text, source))]
    ParseFloat {
        text: String,
        source: std::num::ParseFloatError,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The type of an indexed attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Int,
    Float,
    Str,
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::Str => write!(f, "string"),
        }
    }
}

impl DataType {
    /// Parse `text` into a value of this type.
    pub fn parse(&self, text: &str) -> Result<TypedValue> {
        let text = text.trim();
        match self {
            Self::Int => text
                .parse::<i64>()
                .map(TypedValue::Int)
                .context(ParseIntSnafu { text }),
            Self::Float => text
                .parse::<f64>()
                .map(|v| TypedValue::Float(OrderedFloat(v)))
                .context(ParseFloatSnafu { text }),
            Self::Str => Ok(TypedValue::Str(text.to_string())),
        }
    }
}

/// A single attribute value.
///
/// Values of the same type are totally ordered. Values of different types
/// are never compared implicitly; see [`TypedValue::try_cmp`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypedValue {
    Int(i64),
    Float(OrderedFloat<f64>),
    Str(String),
}

impl TypedValue {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Int(_) => DataType::Int,
            Self::Float(_) => DataType::Float,
            Self::Str(_) => DataType::Str,
        }
    }

    /// Compare two values of the same type.
    pub fn try_cmp(&self, other: &Self) -> Result<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => Ok(a.cmp(b)),
            (Self::Str(a), Self::Str(b)) => Ok(a.cmp(b)),
            (a, b) => TypeMismatchSnafu {
                left: a.data_type(),
                right: b.data_type(),
            }
            .fail(),
        }
    }
}

/// Orders values of the same type; values of different types order by
/// their type tag so that sorting mixed input never panics.
impl PartialOrd for TypedValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TypedValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.try_cmp(other)
            .unwrap_or_else(|_| type_rank(self).cmp(&type_rank(other)))
    }
}

fn type_rank(v: &TypedValue) -> u8 {
    match v {
        TypedValue::Int(_) => 0,
        TypedValue::Float(_) => 1,
        TypedValue::Str(_) => 2,
    }
}

impl Display for TypedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Str(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for TypedValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for TypedValue {
    fn from(v: f64) -> Self {
        Self::Float(OrderedFloat(v))
    }
}

impl From<&str> for TypedValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}
