//! Shared, freezable containers.
//!
//! [`DataObject`] and [`DataArray`] are reference types: cloning the handle
//! shares the underlying storage, the same way the data model of a running
//! session shares nested objects between variables. Use
//! [`DataValue::deep_clone`] to obtain an independent copy.

use crate::error::ValueError;
use crate::value::{DataValue, SeenPairs, MAX_NESTING};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Maximum nesting printed by `Debug` before eliding.
const DEBUG_DEPTH: usize = 8;

struct Cell<T> {
    frozen: AtomicBool,
    items: RwLock<T>,
}

impl<T> Cell<T> {
    fn new(items: T) -> Self {
        Self {
            frozen: AtomicBool::new(false),
            items: RwLock::new(items),
        }
    }

    fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Sets the frozen flag. Returns false if it was already set.
    fn mark_frozen(&self) -> bool {
        let _guard = self.items.write();
        !self.frozen.swap(true, Ordering::AcqRel)
    }
}

/// Identity of a container, used to preserve aliasing during deep clones.
pub(crate) type ContainerKey = usize;

/// An insertion-ordered, string-keyed map of values.
#[derive(Clone)]
pub struct DataObject {
    inner: Arc<Cell<IndexMap<String, DataValue>>>,
}

impl DataObject {
    /// Creates an empty object.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Cell::new(IndexMap::new())),
        }
    }

    /// Creates an object from key/value pairs.
    pub fn from_entries<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, DataValue)>,
    {
        let map = entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Self {
            inner: Arc::new(Cell::new(map)),
        }
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<DataValue> {
        self.inner.items.read().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.items.read().contains_key(key)
    }

    /// Inserts or replaces a value, keeping the original position of an existing key.
    pub fn set(&self, key: impl Into<String>, value: DataValue) -> Result<(), ValueError> {
        let mut items = self.inner.items.write();
        if self.inner.is_frozen() {
            return Err(ValueError::Frozen);
        }
        items.insert(key.into(), value);
        Ok(())
    }

    /// Removes a key, preserving the order of the remaining entries.
    pub fn remove(&self, key: &str) -> Result<Option<DataValue>, ValueError> {
        let mut items = self.inner.items.write();
        if self.inner.is_frozen() {
            return Err(ValueError::Frozen);
        }
        Ok(items.shift_remove(key))
    }

    pub fn len(&self) -> usize {
        self.inner.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.items.read().keys().cloned().collect()
    }

    /// Returns a snapshot of all entries in insertion order.
    pub fn entries(&self) -> Vec<(String, DataValue)> {
        self.inner
            .items
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.is_frozen()
    }

    /// Makes this object and everything reachable from it permanently read-only.
    pub fn freeze(&self) {
        if self.inner.mark_frozen() {
            for (_, value) in self.entries() {
                value.freeze();
            }
        }
    }

    /// Returns true if both handles share the same storage.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn key(&self) -> ContainerKey {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub(crate) fn deep_clone_with(
        &self,
        frozen: bool,
        seen: &mut HashMap<ContainerKey, DataValue>,
    ) -> DataObject {
        if let Some(DataValue::Object(existing)) = seen.get(&self.key()) {
            return existing.clone();
        }

        let copy = DataObject::new();
        seen.insert(self.key(), DataValue::Object(copy.clone()));

        let entries = self.entries();
        {
            let mut target = copy.inner.items.write();
            for (key, value) in entries {
                target.insert(key, value.deep_clone_with(frozen, seen));
            }
        }

        if frozen {
            copy.inner.mark_frozen();
        }
        copy
    }

    pub(crate) fn fmt_depth(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        if depth >= DEBUG_DEPTH {
            return f.write_str("{..}");
        }
        f.write_str("{")?;
        for (i, (key, value)) in self.entries().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:?}: ", key)?;
            value.fmt_depth(f, depth + 1)?;
        }
        f.write_str("}")
    }
}

impl Default for DataObject {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DataObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_depth(f, 0)
    }
}

impl PartialEq for DataObject {
    fn eq(&self, other: &Self) -> bool {
        self.eq_nested(other, &mut SeenPairs::new(), 0)
    }
}

impl DataObject {
    pub(crate) fn eq_nested(&self, other: &Self, seen: &mut SeenPairs, depth: usize) -> bool {
        if self.ptr_eq(other) || !seen.insert((self.key(), other.key())) {
            return true;
        }
        if depth >= MAX_NESTING {
            return false;
        }
        let entries = self.entries();
        entries.len() == other.len()
            && entries.iter().all(|(key, value)| {
                other
                    .get(key)
                    .is_some_and(|theirs| value.eq_nested(&theirs, seen, depth + 1))
            })
    }
}

/// An index-addressed sequence of values.
#[derive(Clone)]
pub struct DataArray {
    inner: Arc<Cell<Vec<DataValue>>>,
}

impl DataArray {
    /// Creates an empty array.
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    pub fn from_vec(items: Vec<DataValue>) -> Self {
        Self {
            inner: Arc::new(Cell::new(items)),
        }
    }

    pub fn get(&self, index: usize) -> Option<DataValue> {
        self.inner.items.read().get(index).cloned()
    }

    pub fn push(&self, value: DataValue) -> Result<(), ValueError> {
        let mut items = self.inner.items.write();
        if self.inner.is_frozen() {
            return Err(ValueError::Frozen);
        }
        items.push(value);
        Ok(())
    }

    /// Stores a value at `index`, padding any gap with `undefined`.
    pub fn set(&self, index: usize, value: DataValue) -> Result<(), ValueError> {
        let mut items = self.inner.items.write();
        if self.inner.is_frozen() {
            return Err(ValueError::Frozen);
        }
        if index >= items.len() {
            items.resize(index + 1, DataValue::Undefined);
        }
        items[index] = value;
        Ok(())
    }

    /// Removes and returns the element at `index`.
    pub fn remove(&self, index: usize) -> Result<DataValue, ValueError> {
        let mut items = self.inner.items.write();
        if self.inner.is_frozen() {
            return Err(ValueError::Frozen);
        }
        if index >= items.len() {
            return Err(ValueError::IndexOutOfRange {
                index,
                len: items.len(),
            });
        }
        Ok(items.remove(index))
    }

    pub fn len(&self) -> usize {
        self.inner.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.read().is_empty()
    }

    /// Returns a snapshot of the elements.
    pub fn to_vec(&self) -> Vec<DataValue> {
        self.inner.items.read().clone()
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.is_frozen()
    }

    /// Makes this array and everything reachable from it permanently read-only.
    pub fn freeze(&self) {
        if self.inner.mark_frozen() {
            for value in self.to_vec() {
                value.freeze();
            }
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn key(&self) -> ContainerKey {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub(crate) fn deep_clone_with(
        &self,
        frozen: bool,
        seen: &mut HashMap<ContainerKey, DataValue>,
    ) -> DataArray {
        if let Some(DataValue::Array(existing)) = seen.get(&self.key()) {
            return existing.clone();
        }

        let copy = DataArray::new();
        seen.insert(self.key(), DataValue::Array(copy.clone()));

        let items = self.to_vec();
        {
            let mut target = copy.inner.items.write();
            for value in items {
                target.push(value.deep_clone_with(frozen, seen));
            }
        }

        if frozen {
            copy.inner.mark_frozen();
        }
        copy
    }

    pub(crate) fn fmt_depth(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        if depth >= DEBUG_DEPTH {
            return f.write_str("[..]");
        }
        f.write_str("[")?;
        for (i, value) in self.to_vec().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            value.fmt_depth(f, depth + 1)?;
        }
        f.write_str("]")
    }
}

impl Default for DataArray {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DataArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_depth(f, 0)
    }
}

impl PartialEq for DataArray {
    fn eq(&self, other: &Self) -> bool {
        self.eq_nested(other, &mut SeenPairs::new(), 0)
    }
}

impl DataArray {
    pub(crate) fn eq_nested(&self, other: &Self, seen: &mut SeenPairs, depth: usize) -> bool {
        if self.ptr_eq(other) || !seen.insert((self.key(), other.key())) {
            return true;
        }
        if depth >= MAX_NESTING {
            return false;
        }
        let (ours, theirs) = (self.to_vec(), other.to_vec());
        ours.len() == theirs.len()
            && ours
                .iter()
                .zip(&theirs)
                .all(|(a, b)| a.eq_nested(b, seen, depth + 1))
    }
}

impl FromIterator<DataValue> for DataArray {
    fn from_iter<T: IntoIterator<Item = DataValue>>(iter: T) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}
