//! Immutable, path-addressable parameter records.
//!
//! A [`Params`] value is used both for the data flowing through a machine and
//! for per-state settings. Keys may be dotted paths (`video.codec`) which
//! address nested JSON objects.
//!
//! Every mutator returns a new record and leaves the receiver untouched. The
//! underlying map is shared until one of the copies is modified.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// A copy-on-write mapping from dotted paths to JSON values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Params {
    inner: Arc<Map<String, Value>>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a record from a JSON value. Only objects (and null) are accepted.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(map.into()),
            Value::Null => Some(Self::new()),
            _ => None,
        }
    }

    /// Looks up a value by dotted path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.inner.get(path) {
            return Some(value);
        }

        let mut parts = path.split('.');
        let mut current = self.inner.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Returns a copy with `value` stored under `path`, creating intermediate
    /// objects as needed. Non-object intermediates are replaced.
    #[must_use]
    pub fn with_param(&self, path: &str, value: Value) -> Self {
        let mut next = self.clone();
        next.set(path, value);
        next
    }

    /// Returns a copy with all of `params` applied in order.
    #[must_use]
    pub fn with_params<I, K>(&self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let mut next = self.clone();
        for (path, value) in params {
            next.set(path.as_ref(), value);
        }
        next
    }

    /// Returns a copy without the value at `path`.
    #[must_use]
    pub fn without_param(&self, path: &str) -> Self {
        if !self.has(path) {
            return self.clone();
        }
        let mut next = self.clone();
        next.remove(path);
        next
    }

    #[must_use]
    pub fn without_params<I, K>(&self, paths: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut next = self.clone();
        for path in paths {
            next.remove(path.as_ref());
        }
        next
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.inner
    }

    /// Returns the record as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(self.inner.as_ref().clone())
    }

    fn set(&mut self, path: &str, value: Value) {
        let map = Arc::make_mut(&mut self.inner);
        // A literal key shadows the dotted walk, same as in `get`
        if let Some(slot) = map.get_mut(path) {
            *slot = value;
            return;
        }

        let mut parts: Vec<&str> = path.split('.').collect();
        let Some(leaf) = parts.pop() else {
            return;
        };

        let mut current = map;
        for part in parts {
            let slot = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            let Value::Object(inner) = slot else {
                return;
            };
            current = inner;
        }
        current.insert(leaf.to_string(), value);
    }

    fn remove(&mut self, path: &str) {
        if self.inner.contains_key(path) {
            Arc::make_mut(&mut self.inner).remove(path);
            return;
        }

        let mut parts: Vec<&str> = path.split('.').collect();
        let Some(leaf) = parts.pop() else {
            return;
        };

        let mut current = Arc::make_mut(&mut self.inner);
        for part in parts {
            current = match current.get_mut(part) {
                Some(Value::Object(inner)) => inner,
                _ => return,
            };
        }
        current.remove(leaf);
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(map),
        }
    }
}

impl From<Params> for Map<String, Value> {
    fn from(params: Params) -> Self {
        Arc::try_unwrap(params.inner).unwrap_or_else(|shared| shared.as_ref().clone())
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Params {
    fn from_iter<T: IntoIterator<Item = (K, Value)>>(iter: T) -> Self {
        let map: Map<String, Value> = iter.into_iter().map(|(k, v)| (k.into(), v)).collect();
        map.into()
    }
}
