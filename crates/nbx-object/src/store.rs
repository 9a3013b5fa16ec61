//! Single-scope object store
//!
//! [`ObjectStore`] is plain data with no locking of its own. The binder keeps
//! one store per scope behind that scope's lock, which is what makes every
//! operation on a scope linearizable.
//!
//! # Versions
//!
//! Versions start at 1 and grow by one on every `put`. When a key is removed
//! its last version is retired, and a later `put` of the same key continues
//! from there, so a version is never handed out twice for the same key.

use crate::error::ObjectError;
use crate::scope::Scope;
use crate::value::AngularValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A named value bound in a scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundObject {
    /// Object name
    pub key: String,
    /// Current value
    pub value: AngularValue,
    /// Owning scope
    pub scope: Scope,
    /// Monotonic per-key version
    pub version: u64,
}

/// Result of a [`ObjectStore::put`]
#[derive(Debug, Clone, PartialEq)]
pub struct PutOutcome {
    /// Value replaced by this put, `None` when the key was unbound
    pub previous: Option<AngularValue>,
    /// Version assigned to the new value
    pub version: u64,
}

impl PutOutcome {
    /// Check if the put created the object
    #[inline]
    #[must_use]
    pub fn created(&self) -> bool {
        self.previous.is_none()
    }
}

/// Key/value table of one scope
#[derive(Debug)]
pub struct ObjectStore {
    scope: Scope,
    objects: HashMap<String, BoundObject>,
    /// Last version of each removed key
    ///
    /// One entry per key that is currently unbound; a rebind takes the entry
    /// back out. Lives as long as the store, which the binder drops on scope
    /// teardown.
    retired: HashMap<String, u64>,
}

impl ObjectStore {
    /// Create empty store for a scope
    #[inline]
    #[must_use]
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            objects: HashMap::new(),
            retired: HashMap::new(),
        }
    }

    /// Scope served by this store
    #[inline]
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Bind or replace a value
    pub fn put(&mut self, key: &str, value: AngularValue) -> PutOutcome {
        if let Some(object) = self.objects.get_mut(key) {
            object.version += 1;
            let previous = std::mem::replace(&mut object.value, value);
            return PutOutcome {
                previous: Some(previous),
                version: object.version,
            };
        }

        let version = self.retired.remove(key).unwrap_or(0) + 1;
        self.objects.insert(
            key.to_owned(),
            BoundObject {
                key: key.to_owned(),
                value,
                scope: self.scope.clone(),
                version,
            },
        );

        PutOutcome {
            previous: None,
            version,
        }
    }

    /// Lookup object by key
    ///
    /// # Errors
    /// - `ObjectError::NotFound` if nothing is bound under `key`
    pub fn get(&self, key: &str) -> Result<&BoundObject, ObjectError> {
        self.objects
            .get(key)
            .ok_or_else(|| ObjectError::not_found(&self.scope, key))
    }

    /// Remove object by key
    ///
    /// # Errors
    /// - `ObjectError::NotFound` if nothing is bound under `key`
    pub fn remove(&mut self, key: &str) -> Result<BoundObject, ObjectError> {
        let removed = self
            .objects
            .remove(key)
            .ok_or_else(|| ObjectError::not_found(&self.scope, key))?;
        self.retired.insert(key.to_owned(), removed.version);
        Ok(removed)
    }

    /// Check if a key is bound
    #[inline]
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    /// Highest version ever issued for `key`, bound or retired
    #[must_use]
    pub fn last_version(&self, key: &str) -> Option<u64> {
        self.objects
            .get(key)
            .map(|object| object.version)
            .or_else(|| self.retired.get(key).copied())
    }

    /// All bound objects, ordered by key
    #[must_use]
    pub fn snapshot(&self) -> Vec<BoundObject> {
        let mut objects: Vec<BoundObject> = self.objects.values().cloned().collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        objects
    }

    /// All bound keys, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Remove every object, ordered by key
    pub fn drain(&mut self) -> Vec<BoundObject> {
        let mut drained: Vec<BoundObject> = self.objects.drain().map(|(_, object)| object).collect();
        drained.sort_by(|a, b| a.key.cmp(&b.key));
        for object in &drained {
            self.retired.insert(object.key.clone(), object.version);
        }
        drained
    }

    /// Number of unbound keys whose version is remembered
    #[inline]
    #[must_use]
    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    /// Number of bound objects
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Check if no object is bound
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> ObjectStore {
        ObjectStore::new(Scope::note("n1"))
    }

    #[test]
    fn put_new_key_starts_at_version_one() {
        let mut store = store();
        let outcome = store.put("myVar", AngularValue::from(0));

        assert!(outcome.created());
        assert_eq!(outcome.version, 1);
        assert_eq!(store.get("myVar").unwrap().value, AngularValue::from(0));
    }

    #[test]
    fn put_existing_key_replaces_and_bumps() {
        let mut store = store();
        store.put("myVar", AngularValue::from(0));
        let outcome = store.put("myVar", AngularValue::from(1));

        assert_eq!(outcome.previous, Some(AngularValue::from(0)));
        assert_eq!(outcome.version, 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn get_missing_key_is_not_found() {
        let store = store();
        assert!(matches!(
            store.get("missing"),
            Err(ObjectError::NotFound { .. })
        ));
    }

    #[test]
    fn remove_missing_key_is_not_found() {
        let mut store = store();
        assert!(store.remove("missing").is_err());
    }

    #[test]
    fn rebind_after_remove_continues_versions() {
        let mut store = store();
        store.put("myVar", AngularValue::from(0));
        store.put("myVar", AngularValue::from(1));

        let removed = store.remove("myVar").unwrap();
        assert_eq!(removed.version, 2);
        assert!(!store.contains("myVar"));
        assert_eq!(store.last_version("myVar"), Some(2));

        let outcome = store.put("myVar", AngularValue::from(1));
        assert!(outcome.created());
        assert_eq!(outcome.version, 3);
    }

    #[test]
    fn snapshot_is_sorted_by_key() {
        let mut store = store();
        store.put("b", AngularValue::from(2));
        store.put("a", AngularValue::from(1));
        store.put("c", AngularValue::from(3));

        let keys: Vec<String> = store.snapshot().into_iter().map(|o| o.key).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(store.keys(), vec!["a", "b", "c"]);
    }

    #[test]
    fn drain_empties_and_retires() {
        let mut store = store();
        store.put("a", AngularValue::from(1));
        store.put("a", AngularValue::from(2));
        store.put("b", AngularValue::from(1));

        let drained = store.drain();
        assert_eq!(drained.len(), 2);
        assert!(store.is_empty());
        assert_eq!(store.put("a", AngularValue::from(0)).version, 3);
    }

    #[test]
    fn retired_versions_track_unbound_keys_only() {
        let mut store = store();
        for _ in 0..10 {
            store.put("a", AngularValue::from(1));
            store.remove("a").unwrap();
        }
        store.put("b", AngularValue::from(1));
        store.remove("b").unwrap();
        assert_eq!(store.retired_len(), 2);

        store.put("a", AngularValue::from(1));
        assert_eq!(store.retired_len(), 1);
        assert_eq!(store.last_version("a"), Some(11));
    }
}
