//! Reactive array.
//!
//! Arrays are tracked as a single coarse unit: any read (index, length,
//! iteration) registers the container, and any mutation bumps its version
//! and broadcasts one confirmed change. Under a deep flag, inserted
//! aggregates are wrapped on the way in.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::observable::obx::{Obx, ObxFlag};
use crate::value::{wrap_for_flag, Value};

struct ArrayInner {
    items: RwLock<Vec<Value>>,
    obx: RwLock<Option<Arc<Obx>>>,
}

/// A shared handle to a reactive array. Clones share identity.
#[derive(Clone)]
pub struct ObxArray {
    inner: Arc<ArrayInner>,
}

impl ObxArray {
    pub fn new() -> Self {
        Self::from_items(Vec::new())
    }

    pub fn from_items(items: Vec<Value>) -> Self {
        Self {
            inner: Arc::new(ArrayInner {
                items: RwLock::new(items),
                obx: RwLock::new(None),
            }),
        }
    }

    pub fn ptr_eq(&self, other: &ObxArray) -> bool {
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
            *obx = Some(Obx::new("ObxArray", flag));
        }
        if let Some(child) = flag.child_flag() {
            let items = self.inner.items.read();
            for item in items.iter() {
                crate::value::ensure_reactive(item, child);
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

    /// Read by index; out of bounds reads as `Null`. Tracked.
    pub fn get(&self, index: usize) -> Value {
        self.report_observed();
        self.inner.items.read().get(index).cloned().unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.report_observed();
        self.inner.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tracked snapshot of the elements.
    pub fn to_vec(&self) -> Vec<Value> {
        self.report_observed();
        self.inner.items.read().clone()
    }

    /// Write by index, padding with `Null` past the current end.
    pub fn set(&self, index: usize, value: impl Into<Value>) {
        let value = self.wrap_child(value.into());
        {
            let mut items = self.inner.items.write();
            if index >= items.len() {
                items.resize(index + 1, Value::Null);
            }
            items[index] = value;
        }
        self.report_change();
    }

    pub fn push(&self, value: impl Into<Value>) {
        let value = self.wrap_child(value.into());
        self.inner.items.write().push(value);
        self.report_change();
    }

    pub fn pop(&self) -> Option<Value> {
        let removed = self.inner.items.write().pop();
        if removed.is_some() {
            self.report_change();
        }
        removed
    }

    /// Remove and return the first element.
    pub fn shift(&self) -> Option<Value> {
        let removed = {
            let mut items = self.inner.items.write();
            if items.is_empty() {
                None
            } else {
                Some(items.remove(0))
            }
        };
        if removed.is_some() {
            self.report_change();
        }
        removed
    }

    /// Prepend an element.
    pub fn unshift(&self, value: impl Into<Value>) {
        let value = self.wrap_child(value.into());
        self.inner.items.write().insert(0, value);
        self.report_change();
    }

    /// Insert at `index`, clamped to the current length.
    pub fn insert(&self, index: usize, value: impl Into<Value>) {
        let value = self.wrap_child(value.into());
        {
            let mut items = self.inner.items.write();
            let at = index.min(items.len());
            items.insert(at, value);
        }
        self.report_change();
    }

    pub fn remove(&self, index: usize) -> Option<Value> {
        let removed = {
            let mut items = self.inner.items.write();
            if index < items.len() {
                Some(items.remove(index))
            } else {
                None
            }
        };
        if removed.is_some() {
            self.report_change();
        }
        removed
    }

    /// Remove `delete_count` elements at `start` (both clamped) and insert
    /// `replacements` in their place. Returns the removed elements. A single
    /// change is broadcast even when nothing was removed but something was
    /// inserted.
    pub fn splice(&self, start: usize, delete_count: usize, replacements: Vec<Value>) -> Vec<Value> {
        let replacements: Vec<Value> = replacements
            .into_iter()
            .map(|v| self.wrap_child(v))
            .collect();
        let (removed, changed) = {
            let mut items = self.inner.items.write();
            let start = start.min(items.len());
            let end = (start + delete_count).min(items.len());
            let inserted = !replacements.is_empty();
            let removed: Vec<Value> = items.splice(start..end, replacements).collect();
            let changed = inserted || !removed.is_empty();
            (removed, changed)
        };
        if changed {
            self.report_change();
        }
        removed
    }

    pub fn clear(&self) {
        let was_empty = {
            let mut items = self.inner.items.write();
            let was_empty = items.is_empty();
            items.clear();
            was_empty
        };
        if !was_empty {
            self.report_change();
        }
    }

    /// Untracked deep snapshot.
    pub fn to_json(&self) -> serde_json::Value {
        let items = self.inner.items.read();
        serde_json::Value::Array(items.iter().map(Value::to_json).collect())
    }
}

impl Default for ObxArray {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn index_write_pads_with_null() {
        let arr = ObxArray::new();
        arr.set(2, 7);
        assert_eq!(arr.to_json(), json!([null, null, 7]));
        assert_eq!(arr.get(5), Value::Null);
    }

    #[test]
    fn stack_and_queue_operations() {
        let arr = ObxArray::from_items(vec![Value::Int(1), Value::Int(2)]);
        arr.push(3);
        assert_eq!(arr.pop(), Some(Value::Int(3)));
        assert_eq!(arr.shift(), Some(Value::Int(1)));
        arr.unshift(0);
        assert_eq!(arr.to_json(), json!([0, 2]));
    }

    #[test]
    fn splice_removes_and_inserts() {
        let arr = ObxArray::from_items(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let removed = arr.splice(1, 1, vec![Value::Int(9), Value::Int(8)]);
        assert_eq!(removed, vec![Value::Int(2)]);
        assert_eq!(arr.to_json(), json!([1, 9, 8, 3]));
        // Clamped past the end.
        let removed = arr.splice(10, 5, vec![Value::Int(0)]);
        assert!(removed.is_empty());
        assert_eq!(arr.to_json(), json!([1, 9, 8, 3, 0]));
    }

    #[test]
    fn mutations_bump_version_once() {
        let arr = ObxArray::new();
        arr.ensure_obx(ObxFlag::Deep);
        let obx = arr.obx().unwrap();
        let before = obx.version();
        arr.push(1);
        assert_eq!(obx.version(), before + 1);
        assert_eq!(arr.pop(), Some(Value::Int(1)));
        assert_eq!(obx.version(), before + 2);
        // Removing from an empty array is not a change.
        assert_eq!(arr.pop(), None);
        assert_eq!(obx.version(), before + 2);
    }

    #[test]
    fn deep_array_wraps_inserted_aggregates() {
        let arr = ObxArray::new();
        arr.ensure_obx(ObxFlag::Deep);
        let child = crate::observable::object::ObxObject::new();
        arr.push(child.clone());
        assert!(Value::Object(child).is_reactive());
    }
}
