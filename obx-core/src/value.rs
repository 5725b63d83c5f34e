//! Dynamic value tree and identity/version equality.
//!
//! The engine instruments a dynamic tree of values: primitives plus four
//! aggregate kinds. Container handles are cheap `Arc`-backed clones sharing
//! identity; an aggregate is *plain* until an `Obx` is attached to it, after
//! which its reads and mutators are instrumented according to its flag.
//!
//! Equality follows `Object.is`-style identity semantics: primitives by
//! value (floats by bit pattern, so NaN equals itself), strings by content,
//! containers by pointer identity — never deep equality. Version-aware
//! comparison additionally checks the container version recorded at the
//! last settle, so in-place mutation of the same aggregate still counts as
//! a change.

use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};

use crate::observable::array::ObxArray;
use crate::observable::map::ObxMap;
use crate::observable::object::ObxObject;
use crate::observable::obx::{Obx, ObxFlag};
use crate::observable::set::ObxSet;

/// A value in the reactive tree.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Object(ObxObject),
    Array(ObxArray),
    Map(ObxMap),
    Set(ObxSet),
}

impl Value {
    /// `Object.is`-style identity comparison. Containers compare by
    /// pointer identity, never by contents.
    pub fn is(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
            (Value::Str(x), Value::Str(y)) => x == y,
            (Value::Object(x), Value::Object(y)) => x.ptr_eq(y),
            (Value::Array(x), Value::Array(y)) => x.ptr_eq(y),
            (Value::Map(x), Value::Map(y)) => x.ptr_eq(y),
            (Value::Set(x), Value::Set(y)) => x.ptr_eq(y),
            _ => false,
        }
    }

    pub fn is_primitive(&self) -> bool {
        !matches!(
            self,
            Value::Object(_) | Value::Array(_) | Value::Map(_) | Value::Set(_)
        )
    }

    /// Explicit capability predicate: has this value been wrapped as an
    /// observable?
    pub fn is_reactive(&self) -> bool {
        self.obx().is_some()
    }

    pub(crate) fn obx(&self) -> Option<Arc<Obx>> {
        match self {
            Value::Object(o) => o.obx(),
            Value::Array(a) => a.obx(),
            Value::Map(m) => m.obx(),
            Value::Set(s) => s.obx(),
            _ => None,
        }
    }

    /// Container version, or 0 for primitives and plain aggregates.
    pub(crate) fn version(&self) -> u64 {
        self.obx().map(|o| o.version()).unwrap_or(0)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Object(_) => "object",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Set(_) => "set",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObxObject> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ObxArray> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ObxMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&ObxSet> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Untracked deep snapshot of the committed state.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.to_string()),
            Value::Object(o) => o.to_json(),
            Value::Array(a) => a.to_json(),
            Value::Map(m) => m.to_json(),
            Value::Set(s) => s.to_json(),
        }
    }
}

/// Attach reactive instrumentation to an aggregate in place.
///
/// Already-wrapped aggregates are left as they are, which also terminates
/// recursion through self-referential structures: the `Obx` is attached
/// before children are visited.
pub(crate) fn ensure_reactive(value: &Value, flag: ObxFlag) {
    match value {
        Value::Object(o) => o.ensure_obx(flag),
        Value::Array(a) => a.ensure_obx(flag),
        Value::Map(m) => m.ensure_obx(flag),
        Value::Set(s) => s.ensure_obx(flag),
        _ => {}
    }
}

/// Wrap `value` for storage under a slot or container carrying `flag`.
pub(crate) fn wrap_for_flag(value: Value, flag: ObxFlag) -> Value {
    if flag.tracks() {
        ensure_reactive(&value, flag);
    }
    value
}

/// Return an unwrapped deep snapshot with no tracking side effects, for
/// interop with code that must not create spurious dependencies.
pub fn raw(value: &Value) -> serde_json::Value {
    value.to_json()
}

/// Bump the value's container version so the next identity comparison sees
/// a change, without broadcasting anything. Escape hatch for handing the
/// same aggregate back as a "new" value.
pub fn as_new_value(value: Value) -> Value {
    if let Some(obx) = value.obx() {
        obx.bump_version();
    }
    value
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        Value::is(self, other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Object(_) => write!(f, "Object({})", self.to_json()),
            Value::Array(_) => write!(f, "Array({})", self.to_json()),
            Value::Map(_) => write!(f, "Map({})", self.to_json()),
            Value::Set(_) => write!(f, "Set({})", self.to_json()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(Arc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(Arc::from(v.as_str()))
    }
}

impl From<ObxObject> for Value {
    fn from(v: ObxObject) -> Self {
        Value::Object(v)
    }
}

impl From<ObxArray> for Value {
    fn from(v: ObxArray) -> Self {
        Value::Array(v)
    }
}

impl From<ObxMap> for Value {
    fn from(v: ObxMap) -> Self {
        Value::Map(v)
    }
}

impl From<ObxSet> for Value {
    fn from(v: ObxSet) -> Self {
        Value::Set(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(ObxArray::from_items(items))
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::from(s),
            serde_json::Value::Array(items) => {
                Value::Array(ObxArray::from_items(items.into_iter().map(Value::from).collect()))
            }
            serde_json::Value::Object(entries) => Value::Object(ObxObject::from_entries(
                entries.into_iter().map(|(k, v)| (k, Value::from(v))),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_semantics() {
        assert!(Value::is(&Value::Int(1), &Value::Int(1)));
        assert!(!Value::is(&Value::Int(1), &Value::Float(1.0)));
        assert!(Value::is(&Value::Float(f64::NAN), &Value::Float(f64::NAN)));
        assert!(Value::is(&Value::from("a"), &Value::from("a")));

        let a = Value::from(json!({ "x": 1 }));
        let b = Value::from(json!({ "x": 1 }));
        // Structurally equal but distinct identity.
        assert!(!Value::is(&a, &b));
        assert!(Value::is(&a, &a.clone()));
    }

    #[test]
    fn json_roundtrip() {
        let v = Value::from(json!({ "a": 1, "b": [true, "x"], "c": null }));
        assert_eq!(raw(&v), json!({ "a": 1, "b": [true, "x"], "c": null }));
    }

    #[test]
    fn plain_aggregates_are_not_reactive() {
        let v = Value::from(json!({ "a": 1 }));
        assert!(!v.is_reactive());
        assert_eq!(v.version(), 0);
    }

    #[test]
    fn as_new_value_bumps_version() {
        let v = Value::from(json!([1, 2]));
        ensure_reactive(&v, ObxFlag::Deep);
        let before = v.version();
        let v = as_new_value(v);
        assert_eq!(v.version(), before + 1);
    }
}
