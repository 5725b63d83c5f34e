//! Reactive map with string keys.
//!
//! Like arrays, maps are tracked as a single coarse unit rather than per
//! entry: reads register the container, mutations broadcast one confirmed
//! change. Insertion order is preserved.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::observable::obx::{Obx, ObxFlag};
use crate::value::{wrap_for_flag, Value};

struct MapInner {
    entries: RwLock<IndexMap<String, Value>>,
    obx: RwLock<Option<Arc<Obx>>>,
}

/// A shared handle to a reactive map. Clones share identity.
#[derive(Clone)]
pub struct ObxMap {
    inner: Arc<MapInner>,
}

impl ObxMap {
    pub fn new() -> Self {
        Self::from_entries(std::iter::empty())
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            inner: Arc::new(MapInner {
                entries: RwLock::new(entries.into_iter().collect()),
                obx: RwLock::new(None),
            }),
        }
    }

    pub fn ptr_eq(&self, other: &ObxMap) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn obx(&self) -> Option<Arc<Obx>> {
        self.inner.obx.read().clone()
    }

    pub(crate) fn ensure_obx(&self, flag: ObxFlag) {
        {
            let mut obx = self.inner.obx.write();
            if obx.is_some() {
                return;
            }
            *obx = Some(Obx::new("ObxMap", flag));
        }
        if let Some(child) = flag.child_flag() {
            let entries = self.inner.entries.read();
            for value in entries.values() {
                crate::value::ensure_reactive(value, child);
            }
        }
    }

    fn wrap_child(&self, value: Value) -> Value {
        match self.obx().and_then(|o| o.flag().child_flag()) {
            Some(child) => wrap_for_flag(value, child),
            None => value,
        }
    }

    fn report_observed(&self) {
        if let Some(obx) = self.obx() {
            obx.report_observed();
        }
    }

    fn report_change(&self) {
        if let Some(obx) = self.obx() {
            obx.report_change(false);
        }
    }

    /// Read an entry; missing keys read as `Null`. Tracked.
    pub fn get(&self, key: &str) -> Value {
        self.report_observed();
        self.inner.entries.read().get(key).cloned().unwrap_or(Value::Null)
    }

    /// Insert or replace an entry. Writing a value identical (by identity)
    /// to the current one is a no-op.
    pub fn set(&self, key: &str, value: impl Into<Value>) {
        let value = self.wrap_child(value.into());
        let changed = {
            let mut entries = self.inner.entries.write();
            match entries.get(key) {
                Some(existing) if Value::is(existing, &value) => false,
                _ => {
                    entries.insert(key.to_string(), value);
                    true
                }
            }
        };
        if changed {
            self.report_change();
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        let removed = self.inner.entries.write().shift_remove(key).is_some();
        if removed {
            self.report_change();
        }
        removed
    }

    pub fn has(&self, key: &str) -> bool {
        self.report_observed();
        self.inner.entries.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.report_observed();
        self.inner.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.report_observed();
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let was_empty = {
            let mut entries = self.inner.entries.write();
            let was_empty = entries.is_empty();
            entries.clear();
            was_empty
        };
        if !was_empty {
            self.report_change();
        }
    }

    /// Untracked deep snapshot.
    pub fn to_json(&self) -> serde_json::Value {
        let entries = self.inner.entries.read();
        let mut out = serde_json::Map::with_capacity(entries.len());
        for (key, value) in entries.iter() {
            out.insert(key.clone(), value.to_json());
        }
        serde_json::Value::Object(out)
    }
}

impl Default for ObxMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn basic_entry_operations() {
        let map = ObxMap::new();
        map.set("a", 1);
        map.set("b", "x");
        assert_eq!(map.get("a"), Value::Int(1));
        assert_eq!(map.get("missing"), Value::Null);
        assert!(map.has("b"));
        assert_eq!(map.keys(), vec!["a".to_string(), "b".to_string()]);
        assert!(map.delete("a"));
        assert!(!map.delete("a"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn identical_write_is_not_a_change() {
        let map = ObxMap::new();
        map.ensure_obx(ObxFlag::Deep);
        map.set("a", 1);
        let obx = map.obx().unwrap();
        let version = obx.version();
        map.set("a", 1);
        assert_eq!(obx.version(), version);
        map.set("a", 2);
        assert_eq!(obx.version(), version + 1);
    }

    #[test]
    fn snapshot_preserves_insertion_order() {
        let map = ObxMap::new();
        map.set("z", 1);
        map.set("a", 2);
        assert_eq!(map.to_json(), json!({ "z": 1, "a": 2 }));
    }
}
