//! Lossless tagged serde representation.
//!
//! Plain JSON cannot tell `undefined` from `null` or a datetime from a string,
//! so checkpoints serialize values through [`ValueRepr`]:
//!
//! ```json
//! {"type": "object", "value": {"frozen": false, "entries": [["n", {"type": "number", "value": 1.0}]]}}
//! ```
//!
//! Container sharing is not preserved; a container reachable twice is written
//! twice. Cyclic values are rejected with [`ValueError::Cyclic`].

use crate::container::{DataArray, DataObject};
use crate::error::ValueError;
use crate::value::DataValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Serializable mirror of [`DataValue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ValueRepr {
    Undefined,
    Null,
    String(String),
    Number(f64),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    Object {
        frozen: bool,
        entries: Vec<(String, ValueRepr)>,
    },
    Array {
        frozen: bool,
        items: Vec<ValueRepr>,
    },
}

impl ValueRepr {
    /// Captures a value, failing on cycles.
    pub fn capture(value: &DataValue) -> Result<Self, ValueError> {
        let mut path = Vec::new();
        Self::capture_inner(value, &mut path)
    }

    fn capture_inner(value: &DataValue, path: &mut Vec<usize>) -> Result<Self, ValueError> {
        Ok(match value {
            DataValue::Undefined => ValueRepr::Undefined,
            DataValue::Null => ValueRepr::Null,
            DataValue::String(s) => ValueRepr::String(s.clone()),
            DataValue::Number(n) => ValueRepr::Number(*n),
            DataValue::Boolean(b) => ValueRepr::Boolean(*b),
            DataValue::DateTime(dt) => ValueRepr::DateTime(*dt),
            DataValue::Object(o) => {
                let key = o.key();
                if path.contains(&key) {
                    return Err(ValueError::Cyclic);
                }
                path.push(key);
                let mut entries = Vec::with_capacity(o.len());
                for (k, v) in o.entries() {
                    entries.push((k, Self::capture_inner(&v, path)?));
                }
                path.pop();
                ValueRepr::Object {
                    frozen: o.is_frozen(),
                    entries,
                }
            }
            DataValue::Array(a) => {
                let key = a.key();
                if path.contains(&key) {
                    return Err(ValueError::Cyclic);
                }
                path.push(key);
                let mut items = Vec::with_capacity(a.len());
                for v in a.to_vec() {
                    items.push(Self::capture_inner(&v, path)?);
                }
                path.pop();
                ValueRepr::Array {
                    frozen: a.is_frozen(),
                    items,
                }
            }
        })
    }

    /// Rebuilds a live value, restoring frozen flags.
    pub fn restore(self) -> DataValue {
        match self {
            ValueRepr::Undefined => DataValue::Undefined,
            ValueRepr::Null => DataValue::Null,
            ValueRepr::String(s) => DataValue::String(s),
            ValueRepr::Number(n) => DataValue::Number(n),
            ValueRepr::Boolean(b) => DataValue::Boolean(b),
            ValueRepr::DateTime(dt) => DataValue::DateTime(dt),
            ValueRepr::Object { frozen, entries } => {
                let obj =
                    DataObject::from_entries(entries.into_iter().map(|(k, v)| (k, v.restore())));
                if frozen {
                    obj.freeze();
                }
                DataValue::Object(obj)
            }
            ValueRepr::Array { frozen, items } => {
                let arr: DataArray = items.into_iter().map(ValueRepr::restore).collect();
                if frozen {
                    arr.freeze();
                }
                DataValue::Array(arr)
            }
        }
    }
}

impl Serialize for DataValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ValueRepr::capture(self)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DataValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        ValueRepr::deserialize(deserializer).map(ValueRepr::restore)
    }
}
