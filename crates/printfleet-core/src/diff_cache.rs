//! Keyed store that remembers what changed since the last flush.
//!
//! Consumers push values as they arrive and periodically `flush` to get only
//! the keys that were updated or deleted in between, which keeps broadcasts
//! incremental instead of shipping full snapshots.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Result of a flush.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffSnapshot<T> {
    pub updated_keys: BTreeSet<String>,
    /// Current values of the updated keys
    pub updated_values: BTreeMap<String, T>,
    pub deleted_keys: BTreeSet<String>,
}

impl<T> DiffSnapshot<T> {
    /// Whether nothing changed since the previous flush.
    pub fn is_empty(&self) -> bool {
        self.updated_keys.is_empty() && self.deleted_keys.is_empty()
    }
}

struct Inner<T> {
    values: HashMap<String, T>,
    updated: BTreeSet<String>,
    deleted: BTreeSet<String>,
}

/// Diff-aware keyed cache.
///
/// A key is never in both the updated and deleted sets. All mutation goes
/// through one lock, so a flush sees a consistent snapshot.
pub struct DiffCache<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> DiffCache<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                values: HashMap::new(),
                updated: BTreeSet::new(),
                deleted: BTreeSet::new(),
            }),
        }
    }

    /// Store `value` under `key` and mark the key updated.
    pub fn set_value(&self, key: impl Into<String>, value: T) {
        let key = key.into();
        let mut inner = self.inner.lock();
        inner.deleted.remove(&key);
        inner.updated.insert(key.clone());
        inner.values.insert(key, value);
    }

    /// Remove `key` from the store and mark it deleted.
    ///
    /// Returns the removed value, if any.
    pub fn delete_value(&self, key: &str) -> Option<T> {
        let mut inner = self.inner.lock();
        inner.updated.remove(key);
        inner.deleted.insert(key.to_string());
        inner.values.remove(key)
    }

    /// Current value of `key`.
    pub fn get_value(&self, key: &str) -> Option<T> {
        self.inner.lock().values.get(key).cloned()
    }

    /// Every stored value, regardless of diff state.
    pub fn get_all_values(&self) -> BTreeMap<String, T> {
        self.inner
            .lock()
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.inner.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take everything accumulated since the previous flush and reset the sets.
    pub fn flush(&self) -> DiffSnapshot<T> {
        let mut inner = self.inner.lock();
        let updated_keys = std::mem::take(&mut inner.updated);
        let deleted_keys = std::mem::take(&mut inner.deleted);
        let updated_values = updated_keys
            .iter()
            .filter_map(|key| inner.values.get(key).map(|v| (key.clone(), v.clone())))
            .collect();
        DiffSnapshot {
            updated_keys,
            updated_values,
            deleted_keys,
        }
    }
}

impl<T: Clone> Default for DiffCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_delete_reports_deleted_only() {
        let cache = DiffCache::new();
        cache.set_value("p1", 1);
        cache.delete_value("p1");

        let snapshot = cache.flush();
        assert!(snapshot.deleted_keys.contains("p1"));
        assert!(!snapshot.updated_keys.contains("p1"));
        assert!(snapshot.updated_values.is_empty());
        assert!(cache.get_value("p1").is_none());
    }

    #[test]
    fn test_delete_then_set_reports_updated_only() {
        let cache = DiffCache::new();
        cache.set_value("p1", 1);
        cache.flush();

        cache.delete_value("p1");
        cache.set_value("p1", 2);

        let snapshot = cache.flush();
        assert!(snapshot.deleted_keys.is_empty());
        assert_eq!(snapshot.updated_values.get("p1"), Some(&2));
    }

    #[test]
    fn test_second_flush_is_empty() {
        let cache = DiffCache::new();
        cache.set_value("p1", "a".to_string());
        cache.set_value("p2", "b".to_string());
        cache.delete_value("p3");

        let first = cache.flush();
        assert_eq!(first.updated_keys.len(), 2);
        assert_eq!(first.deleted_keys.len(), 1);

        let second = cache.flush();
        assert!(second.is_empty());
        // Values survive a flush
        assert_eq!(cache.get_value("p1").as_deref(), Some("a"));
    }

    #[test]
    fn test_flush_returns_latest_value() {
        let cache = DiffCache::new();
        cache.set_value("p1", 1);
        cache.set_value("p1", 2);
        cache.set_value("p1", 3);

        let snapshot = cache.flush();
        assert_eq!(snapshot.updated_keys.len(), 1);
        assert_eq!(snapshot.updated_values["p1"], 3);
    }

    #[test]
    fn test_get_all_values_ignores_diff_state() {
        let cache = DiffCache::new();
        cache.set_value("a", 1);
        cache.set_value("b", 2);
        cache.flush();
        cache.set_value("c", 3);

        let all = cache.get_all_values();
        assert_eq!(all.len(), 3);
        assert_eq!(cache.len(), 3);
    }
}
