//! Search-after cursors and their JSON codec.
//!
//! A cursor is the ordered tuple of sort values of the last hit handed
//! downstream. It is opaque to consumers: the only thing done with it is to
//! echo it back to the index as `search_after`. On the wire it is a JSON array
//! of scalars, e.g. `["c", 42, null]`.
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};
use crate::types::{SortDirection, SortKey};

/// A single scalar sort value as returned by the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum SortValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
}

impl SortValue {
    fn type_rank(&self) -> u8 {
        match self {
            SortValue::Null => 0,
            SortValue::Bool(_) => 1,
            SortValue::Number(_) => 2,
            SortValue::String(_) => 3,
        }
    }

    /// Total order used when comparing tuples locally. Values of different
    /// types order as `null < bool < number < string`.
    pub fn compare(&self, other: &SortValue) -> Ordering {
        match (self, other) {
            (SortValue::Null, SortValue::Null) => Ordering::Equal,
            (SortValue::Bool(a), SortValue::Bool(b)) => a.cmp(b),
            (SortValue::Number(a), SortValue::Number(b)) => compare_numbers(a, b),
            (SortValue::String(a), SortValue::String(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

fn compare_numbers(a: &Number, b: &Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x.cmp(&y);
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        _ => Ordering::Equal,
    }
}

impl TryFrom<Value> for SortValue {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(SortValue::Null),
            Value::Bool(b) => Ok(SortValue::Bool(b)),
            Value::Number(n) => Ok(SortValue::Number(n)),
            Value::String(s) => Ok(SortValue::String(s)),
            Value::Array(_) => Err(Error::Codec(
                "unsupported sort value type: array".into(),
            )),
            Value::Object(_) => Err(Error::Codec(
                "unsupported sort value type: object".into(),
            )),
        }
    }
}

impl From<SortValue> for Value {
    fn from(value: SortValue) -> Self {
        match value {
            SortValue::Null => Value::Null,
            SortValue::Bool(b) => Value::Bool(b),
            SortValue::Number(n) => Value::Number(n),
            SortValue::String(s) => Value::String(s),
        }
    }
}

impl From<&str> for SortValue {
    fn from(s: &str) -> Self {
        SortValue::String(s.to_string())
    }
}

impl From<String> for SortValue {
    fn from(s: String) -> Self {
        SortValue::String(s)
    }
}

impl From<bool> for SortValue {
    fn from(b: bool) -> Self {
        SortValue::Bool(b)
    }
}

impl From<i64> for SortValue {
    fn from(n: i64) -> Self {
        SortValue::Number(n.into())
    }
}

impl From<u64> for SortValue {
    fn from(n: u64) -> Self {
        SortValue::Number(n.into())
    }
}

/// Non-finite floats have no JSON form and become `Null`.
impl From<f64> for SortValue {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(SortValue::Null, SortValue::Number)
    }
}

/// Ordered sort-key values of the last emitted hit. Never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Cursor(Vec<SortValue>);

impl Cursor {
    pub fn new(values: Vec<SortValue>) -> Result<Self> {
        if values.is_empty() {
            return Err(Error::Codec(
                "cursor must contain at least one sort value".into(),
            ));
        }
        Ok(Self(values))
    }

    /// Compare two tuples under `keys`. Positions beyond the key list sort
    /// ascending; a strict prefix sorts first.
    pub fn compare(&self, other: &Cursor, keys: &[SortKey]) -> Ordering {
        compare_sort_tuples(&self.0, &other.0, keys)
    }
}

impl TryFrom<Vec<SortValue>> for Cursor {
    type Error = Error;

    fn try_from(values: Vec<SortValue>) -> Result<Self> {
        Self::new(values)
    }
}

impl TryFrom<Value> for Cursor {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        CursorCodec::from_value(value)
    }
}

impl From<Cursor> for Value {
    fn from(cursor: Cursor) -> Self {
        Value::Array(cursor.0.into_iter().map(Value::from).collect())
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&CursorCodec::encode(self))
    }
}

pub fn compare_sort_tuples(
    a: &[SortValue],
    b: &[SortValue],
    keys: &[SortKey],
) -> Ordering {
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        let ord = x.compare(y);
        let ord = match keys.get(i).map(|k| k.direction) {
            Some(SortDirection::Desc) => ord.reverse(),
            _ => ord,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// JSON-array codec for [`Cursor`].
pub struct CursorCodec;

impl CursorCodec {
    pub fn encode(cursor: &Cursor) -> String {
        Value::from(cursor.clone()).to_string()
    }

    pub fn decode(text: &str) -> Result<Cursor> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Cursor> {
        let Value::Array(items) = value else {
            return Err(Error::Codec("cursor must be a JSON array".into()));
        };
        let values = items
            .into_iter()
            .map(SortValue::try_from)
            .collect::<Result<Vec<_>>>()?;
        Cursor::new(values)
    }
}
