//! The data value tagged union.

use crate::container::{ContainerKey, DataArray, DataObject};
use crate::error::ValueError;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Nesting beyond which recursive walks stop descending.
pub(crate) const MAX_NESTING: usize = 256;

/// A value flowing through events, parameters, data stores and done data.
///
/// Scalars are immutable. `Object` and `Array` are shared handles to mutable
/// storage which can be frozen; see [`DataValue::deep_clone`].
#[derive(Clone, Default)]
pub enum DataValue {
    #[default]
    Undefined,
    Null,
    String(String),
    Number(f64),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    Object(DataObject),
    Array(DataArray),
}

impl DataValue {
    /// Creates a new, empty, mutable object value.
    pub fn object() -> Self {
        DataValue::Object(DataObject::new())
    }

    /// Creates a new, empty, mutable array value.
    pub fn array() -> Self {
        DataValue::Array(DataArray::new())
    }

    /// Returns the variant name.
    pub fn type_name(&self) -> &'static str {
        match self {
            DataValue::Undefined => "undefined",
            DataValue::Null => "null",
            DataValue::String(_) => "string",
            DataValue::Number(_) => "number",
            DataValue::Boolean(_) => "boolean",
            DataValue::DateTime(_) => "datetime",
            DataValue::Object(_) => "object",
            DataValue::Array(_) => "array",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, DataValue::Undefined)
    }

    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, DataValue::Undefined | DataValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DataValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DataValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            DataValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&DataObject> {
        match self {
            DataValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&DataArray> {
        match self {
            DataValue::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Returns the object handle or a type mismatch error.
    pub fn try_object(&self) -> Result<&DataObject, ValueError> {
        self.as_object().ok_or(ValueError::TypeMismatch {
            expected: "object",
            found: self.type_name(),
        })
    }

    /// Truthiness used by conditions: empty strings, zero, empty containers,
    /// null and undefined are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            DataValue::Undefined | DataValue::Null => false,
            DataValue::Boolean(b) => *b,
            DataValue::Number(n) => *n != 0.0 && !n.is_nan(),
            DataValue::String(s) => !s.is_empty(),
            DataValue::DateTime(_) => true,
            DataValue::Object(o) => !o.is_empty(),
            DataValue::Array(a) => !a.is_empty(),
        }
    }

    /// Returns true for scalars and for frozen containers.
    pub fn is_frozen(&self) -> bool {
        match self {
            DataValue::Object(o) => o.is_frozen(),
            DataValue::Array(a) => a.is_frozen(),
            _ => true,
        }
    }

    /// Freezes containers recursively. No-op for scalars.
    pub fn freeze(&self) {
        match self {
            DataValue::Object(o) => o.freeze(),
            DataValue::Array(a) => a.freeze(),
            _ => {}
        }
    }

    /// Produces a fully independent copy of this value, optionally frozen.
    ///
    /// Containers reachable more than once (including cycles) are copied once
    /// and the copy reproduces the same sharing.
    pub fn deep_clone(&self, frozen: bool) -> DataValue {
        let mut seen = HashMap::new();
        self.deep_clone_with(frozen, &mut seen)
    }

    pub(crate) fn deep_clone_with(
        &self,
        frozen: bool,
        seen: &mut HashMap<ContainerKey, DataValue>,
    ) -> DataValue {
        match self {
            DataValue::Object(o) => DataValue::Object(o.deep_clone_with(frozen, seen)),
            DataValue::Array(a) => DataValue::Array(a.deep_clone_with(frozen, seen)),
            scalar => scalar.clone(),
        }
    }

    /// Looks up a dot-separated path (`a.b.0.c`). Missing segments yield `Undefined`.
    pub fn path(&self, path: &str) -> DataValue {
        if path.is_empty() {
            return self.clone();
        }
        let mut current = self.clone();
        for part in path.split('.') {
            current = match &current {
                DataValue::Object(o) => o.get(part).unwrap_or_default(),
                DataValue::Array(a) => part
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| a.get(i))
                    .unwrap_or_default(),
                _ => return DataValue::Undefined,
            };
        }
        current
    }

    /// Converts to plain JSON. Datetimes become RFC 3339 strings and
    /// `undefined` becomes `null`.
    pub fn to_json(&self) -> serde_json::Value {
        self.to_json_depth(0)
    }

    fn to_json_depth(&self, depth: usize) -> serde_json::Value {
        use serde_json::Value;

        // Cyclic structures are cut off instead of overflowing the stack.
        if depth > MAX_NESTING {
            return Value::Null;
        }
        match self {
            DataValue::Undefined | DataValue::Null => Value::Null,
            DataValue::String(s) => Value::String(s.clone()),
            DataValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
                    Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            DataValue::Boolean(b) => Value::Bool(*b),
            DataValue::DateTime(dt) => Value::String(dt.to_rfc3339()),
            DataValue::Object(o) => Value::Object(
                o.entries()
                    .into_iter()
                    .map(|(k, v)| (k, v.to_json_depth(depth + 1)))
                    .collect(),
            ),
            DataValue::Array(a) => Value::Array(
                a.to_vec()
                    .iter()
                    .map(|v| v.to_json_depth(depth + 1))
                    .collect(),
            ),
        }
    }

    /// Builds a mutable value from plain JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        use serde_json::Value;

        match json {
            Value::Null => DataValue::Null,
            Value::Bool(b) => DataValue::Boolean(*b),
            Value::Number(n) => DataValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => DataValue::String(s.clone()),
            Value::Array(items) => {
                DataValue::Array(items.iter().map(DataValue::from_json).collect())
            }
            Value::Object(map) => DataValue::Object(DataObject::from_entries(
                map.iter().map(|(k, v)| (k.clone(), DataValue::from_json(v))),
            )),
        }
    }

    pub(crate) fn fmt_depth(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        match self {
            DataValue::Undefined => f.write_str("undefined"),
            DataValue::Null => f.write_str("null"),
            DataValue::String(s) => write!(f, "{:?}", s),
            DataValue::Number(n) => write!(f, "{}", n),
            DataValue::Boolean(b) => write!(f, "{}", b),
            DataValue::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
            DataValue::Object(o) => o.fmt_depth(f, depth),
            DataValue::Array(a) => a.fmt_depth(f, depth),
        }
    }
}

impl fmt::Debug for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_depth(f, 0)
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::String(s) => f.write_str(s),
            DataValue::Object(_) | DataValue::Array(_) => write!(f, "{}", self.to_json()),
            other => other.fmt_depth(f, 0),
        }
    }
}

/// Container pairs already under comparison.
pub(crate) type SeenPairs = HashSet<(ContainerKey, ContainerKey)>;

impl PartialEq for DataValue {
    fn eq(&self, other: &Self) -> bool {
        self.eq_nested(other, &mut SeenPairs::new(), 0)
    }
}

impl DataValue {
    /// Structural equality. A container pair met again during the walk is
    /// taken as equal, so cyclic values compare in bounded time. Below
    /// [`MAX_NESTING`] containers only compare by identity.
    pub(crate) fn eq_nested(&self, other: &Self, seen: &mut SeenPairs, depth: usize) -> bool {
        match (self, other) {
            (DataValue::Undefined, DataValue::Undefined) => true,
            (DataValue::Null, DataValue::Null) => true,
            (DataValue::String(a), DataValue::String(b)) => a == b,
            (DataValue::Number(a), DataValue::Number(b)) => a == b,
            (DataValue::Boolean(a), DataValue::Boolean(b)) => a == b,
            (DataValue::DateTime(a), DataValue::DateTime(b)) => a == b,
            (DataValue::Object(a), DataValue::Object(b)) => a.eq_nested(b, seen, depth),
            (DataValue::Array(a), DataValue::Array(b)) => a.eq_nested(b, seen, depth),
            _ => false,
        }
    }
}

impl From<&str> for DataValue {
    fn from(s: &str) -> Self {
        DataValue::String(s.to_string())
    }
}

impl From<String> for DataValue {
    fn from(s: String) -> Self {
        DataValue::String(s)
    }
}

impl From<f64> for DataValue {
    fn from(n: f64) -> Self {
        DataValue::Number(n)
    }
}

impl From<i64> for DataValue {
    fn from(n: i64) -> Self {
        DataValue::Number(n as f64)
    }
}

impl From<i32> for DataValue {
    fn from(n: i32) -> Self {
        DataValue::Number(f64::from(n))
    }
}

impl From<u32> for DataValue {
    fn from(n: u32) -> Self {
        DataValue::Number(f64::from(n))
    }
}

impl From<bool> for DataValue {
    fn from(b: bool) -> Self {
        DataValue::Boolean(b)
    }
}

impl From<DateTime<Utc>> for DataValue {
    fn from(dt: DateTime<Utc>) -> Self {
        DataValue::DateTime(dt)
    }
}

impl From<DataObject> for DataValue {
    fn from(o: DataObject) -> Self {
        DataValue::Object(o)
    }
}

impl From<DataArray> for DataValue {
    fn from(a: DataArray) -> Self {
        DataValue::Array(a)
    }
}

impl From<serde_json::Value> for DataValue {
    fn from(json: serde_json::Value) -> Self {
        DataValue::from_json(&json)
    }
}
