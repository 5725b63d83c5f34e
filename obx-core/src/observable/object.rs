//! Reactive object: string keys to reactive slots.
//!
//! An [`ObxObject`] starts plain. Once wrapped (directly or by insertion
//! under a deep parent), each key is backed by an [`ObxProperty`] cell, so
//! per-key reads and writes are tracked independently, and the container's
//! own `Obx` covers structural shape: key addition, deletion, and key-set
//! enumeration.
//!
//! Keys starting with the engine-reserved prefix cannot be written or
//! deleted. A sealed object keeps its current key set: existing keys stay
//! writable, adding or removing keys fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::error::{ObxError, Result};
use crate::observable::obx::{Obx, ObxFlag};
use crate::observable::property::ObxProperty;
use crate::observable::{propagate_changed, transaction, Observable};
use crate::value::Value;

/// Keys with this prefix are reserved for engine bookkeeping.
pub(crate) const RESERVED_KEY_PREFIX: &str = "__obx";

enum Slot {
    Plain(Value),
    Cell(Arc<ObxProperty>),
}

struct ObjectInner {
    slots: RwLock<IndexMap<String, Slot>>,
    obx: RwLock<Option<Arc<Obx>>>,
    sealed: AtomicBool,
}

/// A shared handle to a reactive object. Clones share identity.
#[derive(Clone)]
pub struct ObxObject {
    inner: Arc<ObjectInner>,
}

impl ObxObject {
    pub fn new() -> Self {
        Self::from_entries(std::iter::empty())
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        let slots = entries
            .into_iter()
            .map(|(k, v)| (k, Slot::Plain(v)))
            .collect();
        Self {
            inner: Arc::new(ObjectInner {
                slots: RwLock::new(slots),
                obx: RwLock::new(None),
                sealed: AtomicBool::new(false),
            }),
        }
    }

    pub fn ptr_eq(&self, other: &ObxObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn obx(&self) -> Option<Arc<Obx>> {
        self.inner.obx.read().clone()
    }

    /// Attach instrumentation, upgrading existing plain slots to cells.
    ///
    /// The `Obx` is stored before any slot is visited, so self-referential
    /// structures terminate.
    pub(crate) fn ensure_obx(&self, flag: ObxFlag) {
        {
            let mut obx = self.inner.obx.write();
            if obx.is_some() {
                return;
            }
            *obx = Some(Obx::new("ObxObject", flag));
        }
        if !flag.tracks() {
            return;
        }
        let cell_flag = flag.child_flag().unwrap_or(ObxFlag::Ref);
        let mut slots = self.inner.slots.write();
        for (key, slot) in slots.iter_mut() {
            if let Slot::Plain(value) = slot {
                let cell = ObxProperty::new_plain(key, std::mem::replace(value, Value::Null), cell_flag);
                *slot = Slot::Cell(cell);
            }
        }
    }

    fn is_wrapped(&self) -> bool {
        self.obx().map(|o| o.flag().tracks()).unwrap_or(false)
    }

    fn cell_flag(&self) -> ObxFlag {
        self.obx()
            .and_then(|o| o.flag().child_flag())
            .unwrap_or(ObxFlag::Ref)
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

    /// Read a key. Tracked per key; a missing key registers the container
    /// itself, so a later insertion retriggers the reader.
    pub fn get(&self, key: &str) -> Result<Value> {
        let slot = {
            let slots = self.inner.slots.read();
            match slots.get(key) {
                Some(Slot::Cell(cell)) => Some(Ok(cell.clone())),
                Some(Slot::Plain(value)) => Some(Err(value.clone())),
                None => None,
            }
        };
        match slot {
            Some(Ok(cell)) => cell.get(),
            Some(Err(plain)) => Ok(plain),
            None => {
                self.report_observed();
                Ok(Value::Null)
            }
        }
    }

    /// Write a key. Existing keys route through their cell (staged write);
    /// a new key is a structural change and fails on a sealed object.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        if key.starts_with(RESERVED_KEY_PREFIX) {
            return Err(ObxError::ProtectedKey(key.to_string()));
        }
        let value = value.into();

        enum Action {
            Done,
            Cell(Arc<ObxProperty>),
            Added,
        }
        let action = {
            let mut slots = self.inner.slots.write();
            match slots.get_mut(key) {
                Some(Slot::Cell(cell)) => Action::Cell(cell.clone()),
                Some(Slot::Plain(existing)) => {
                    *existing = value.clone();
                    Action::Done
                }
                None => {
                    if self.inner.sealed.load(Ordering::SeqCst) {
                        return Err(ObxError::SealedObject(key.to_string()));
                    }
                    if self.is_wrapped() {
                        let cell = ObxProperty::new_plain(key, value.clone(), self.cell_flag());
                        slots.insert(key.to_string(), Slot::Cell(cell));
                        Action::Added
                    } else {
                        slots.insert(key.to_string(), Slot::Plain(value.clone()));
                        Action::Done
                    }
                }
            }
        };
        match action {
            Action::Done => Ok(()),
            Action::Cell(cell) => cell.set(value),
            Action::Added => {
                self.report_change();
                Ok(())
            }
        }
    }

    /// Delete a key. Observers of the removed cell are marked stale so they
    /// re-read (and now see the container's missing-key behavior); the
    /// container broadcasts the shape change.
    pub fn del(&self, key: &str) -> Result<bool> {
        if key.starts_with(RESERVED_KEY_PREFIX) {
            return Err(ObxError::ProtectedKey(key.to_string()));
        }
        let removed = {
            let mut slots = self.inner.slots.write();
            if !slots.contains_key(key) {
                return Ok(false);
            }
            if self.inner.sealed.load(Ordering::SeqCst) {
                return Err(ObxError::SealedObject(key.to_string()));
            }
            slots.shift_remove(key)
        };
        match removed {
            None => Ok(false),
            Some(slot) => {
                if let Slot::Cell(cell) = slot {
                    let obs: Arc<dyn Observable> = cell;
                    propagate_changed(&obs, false);
                }
                self.report_change();
                Ok(true)
            }
        }
    }

    /// Whether a key exists. Tracked against the container shape.
    pub fn has(&self, key: &str) -> bool {
        self.report_observed();
        self.inner.slots.read().contains_key(key)
    }

    /// Current key set, in insertion order. Tracked against the container
    /// shape.
    pub fn keys(&self) -> Vec<String> {
        self.report_observed();
        self.inner.slots.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.report_observed();
        self.inner.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Freeze the key set. Existing keys remain writable.
    pub fn seal(&self) {
        self.inner.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.sealed.load(Ordering::SeqCst)
    }

    /// Merge entries in one transaction, so downstream reactions observe a
    /// single coalesced update.
    pub fn extend(&self, entries: impl IntoIterator<Item = (String, Value)>) -> Result<()> {
        transaction(|| {
            for (key, value) in entries {
                self.set(&key, value)?;
            }
            Ok(())
        })
    }

    /// Install a computed member backed by a getter over this object.
    ///
    /// The getter holds a weak handle back to the object; the cell never
    /// keeps its own container alive.
    pub fn define_computed(
        &self,
        key: &str,
        getter: impl Fn(&ObxObject) -> Value + Send + Sync + 'static,
    ) -> Result<()> {
        if key.starts_with(RESERVED_KEY_PREFIX) {
            return Err(ObxError::ProtectedKey(key.to_string()));
        }
        if self.inner.sealed.load(Ordering::SeqCst) && !self.inner.slots.read().contains_key(key) {
            return Err(ObxError::SealedObject(key.to_string()));
        }
        let weak = Arc::downgrade(&self.inner);
        let cell = ObxProperty::new_computed(
            key,
            Box::new(move || {
                let inner = weak.upgrade().expect("object outlives its member cells");
                getter(&ObxObject { inner })
            }),
            None,
            self.cell_flag(),
        );
        let added = {
            let mut slots = self.inner.slots.write();
            slots.insert(key.to_string(), Slot::Cell(cell)).is_none()
        };
        if added {
            self.report_change();
        }
        Ok(())
    }

    /// Untracked deep snapshot of committed state. Computed members are
    /// rendered from their last committed value without recomputing.
    pub fn to_json(&self) -> serde_json::Value {
        let slots = self.inner.slots.read();
        let mut out = serde_json::Map::with_capacity(slots.len());
        for (key, slot) in slots.iter() {
            let value = match slot {
                Slot::Plain(v) => v.clone(),
                Slot::Cell(cell) => cell.peek(),
            };
            out.insert(key.clone(), value.to_json());
        }
        serde_json::Value::Object(out)
    }
}

impl Default for ObxObject {
    fn default() -> Self {
        Self::new()
    }
}
