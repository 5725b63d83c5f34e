//! Reactive set.
//!
//! Membership uses the same identity semantics as the rest of the engine
//! (`Value::is`), so `NaN` is a member equal to itself and containers are
//! members by pointer identity. Element count is small in practice and
//! identity comparison is not hashable for containers, so membership is a
//! linear scan over an insertion-ordered list.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::observable::obx::{Obx, ObxFlag};
use crate::value::{wrap_for_flag, Value};

struct SetInner {
    items: RwLock<Vec<Value>>,
    obx: RwLock<Option<Arc<Obx>>>,
}

/// A shared handle to a reactive set. Clones share identity.
#[derive(Clone)]
pub struct ObxSet {
    inner: Arc<SetInner>,
}

impl ObxSet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SetInner {
                items: RwLock::new(Vec::new()),
                obx: RwLock::new(None),
            }),
        }
    }

    pub fn from_items(items: impl IntoIterator<Item = Value>) -> Self {
        let set = Self::new();
        {
            let mut stored = set.inner.items.write();
            for item in items {
                if !stored.iter().any(|v| Value::is(v, &item)) {
                    stored.push(item);
                }
            }
        }
        set
    }

    pub fn ptr_eq(&self, other: &ObxSet) -> bool {
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
            *obx = Some(Obx::new("ObxSet", flag));
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

    /// Add a member; returns whether the set changed.
    pub fn add(&self, value: impl Into<Value>) -> bool {
        let value = self.wrap_child(value.into());
        let added = {
            let mut items = self.inner.items.write();
            if items.iter().any(|v| Value::is(v, &value)) {
                false
            } else {
                items.push(value);
                true
            }
        };
        if added {
            self.report_change();
        }
        added
    }

    /// Remove a member; returns whether it was present.
    pub fn delete(&self, value: &Value) -> bool {
        let removed = {
            let mut items = self.inner.items.write();
            match items.iter().position(|v| Value::is(v, value)) {
                Some(at) => {
                    items.remove(at);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.report_change();
        }
        removed
    }

    pub fn has(&self, value: &Value) -> bool {
        self.report_observed();
        self.inner.items.read().iter().any(|v| Value::is(v, value))
    }

    pub fn len(&self) -> usize {
        self.report_observed();
        self.inner.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
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

    /// Tracked snapshot of the members in insertion order.
    pub fn to_vec(&self) -> Vec<Value> {
        self.report_observed();
        self.inner.items.read().clone()
    }

    /// Untracked deep snapshot.
    pub fn to_json(&self) -> serde_json::Value {
        let items = self.inner.items.read();
        serde_json::Value::Array(items.iter().map(Value::to_json).collect())
    }
}

impl Default for ObxSet {
    fn default() -> Self {
        Self::new()
    }
}
