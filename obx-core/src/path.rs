//! Slash-separated path access over a value tree.
//!
//! Paths address nested values: `"a/b/0/c"` hops through objects and maps
//! by key and through arrays by decimal index. Empty segments are skipped,
//! so `"/a//b"` equals `"a/b"`. Reads through a dead end (missing key,
//! scalar hop, non-numeric index) produce `Null` rather than an error;
//! writes through a missing hop auto-create intermediate objects, while a
//! scalar in the way turns the write into a no-op.

use crate::error::Result;
use crate::observable::transaction;
use crate::value::Value;

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// One read hop. `None` means a dead end.
fn hop(current: &Value, segment: &str) -> Result<Option<Value>> {
    match current {
        Value::Object(obj) => {
            let next = obj.get(segment)?;
            Ok(if next.is_null() { None } else { Some(next) })
        }
        Value::Map(map) => {
            let next = map.get(segment);
            Ok(if next.is_null() { None } else { Some(next) })
        }
        Value::Array(arr) => match segment.parse::<usize>() {
            Ok(index) => {
                let next = arr.get(index);
                Ok(if next.is_null() { None } else { Some(next) })
            }
            Err(_) => Ok(None),
        },
        _ => Ok(None),
    }
}

/// Read the value at `path`. Dead ends read as `Null`.
pub fn get_path(target: &Value, path: &str) -> Result<Value> {
    let mut current = target.clone();
    for segment in segments(path) {
        match hop(&current, segment)? {
            Some(next) => current = next,
            None => return Ok(Value::Null),
        }
    }
    Ok(current)
}

/// Whether `path` resolves to an existing entry.
///
/// Unlike [`get_path`], the final hop is a membership test, so a key
/// explicitly holding `Null` still counts as present. An empty path names
/// no entry and reports absent.
pub fn has_path(target: &Value, path: &str) -> Result<bool> {
    let segs = segments(path);
    let Some((last, front)) = segs.split_last() else {
        return Ok(false);
    };
    let mut current = target.clone();
    for segment in front {
        match hop(&current, segment)? {
            Some(next) => current = next,
            None => return Ok(false),
        }
    }
    Ok(match &current {
        Value::Object(obj) => obj.has(last),
        Value::Map(map) => map.has(last),
        Value::Array(arr) => last
            .parse::<usize>()
            .map(|index| index < arr.len())
            .unwrap_or(false),
        _ => false,
    })
}

/// Write `value` at `path`, creating missing intermediate objects.
///
/// An empty path, or a scalar sitting where a container hop is needed,
/// makes the write a no-op.
pub fn set_path(target: &Value, path: &str, value: impl Into<Value>) -> Result<()> {
    let segs = segments(path);
    let Some((last, front)) = segs.split_last() else {
        return Ok(());
    };
    let mut current = target.clone();
    for segment in front {
        let next = hop(&current, segment)?;
        let next_container = match next {
            Some(v) if !v.is_primitive() => Some(v),
            Some(_) => None,
            None => {
                let child = crate::observable::object::ObxObject::new();
                let created = Value::Object(child);
                match &current {
                    Value::Object(obj) => {
                        obj.set(segment, created.clone())?;
                        // Re-read: a deep parent wraps on the way in.
                        Some(obj.get(segment)?)
                    }
                    Value::Map(map) => {
                        map.set(segment, created.clone());
                        Some(map.get(segment))
                    }
                    Value::Array(arr) => match segment.parse::<usize>() {
                        Ok(index) => {
                            arr.set(index, created.clone());
                            Some(arr.get(index))
                        }
                        Err(_) => None,
                    },
                    _ => None,
                }
            }
        };
        match next_container {
            Some(next) => current = next,
            None => return Ok(()),
        }
    }
    let value = value.into();
    match &current {
        Value::Object(obj) => obj.set(last, value),
        Value::Map(map) => {
            map.set(last, value);
            Ok(())
        }
        Value::Array(arr) => {
            if let Ok(index) = last.parse::<usize>() {
                arr.set(index, value);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Delete the entry at `path`. Returns whether something was removed;
/// missing hops are not an error.
pub fn del_path(target: &Value, path: &str) -> Result<bool> {
    let segs = segments(path);
    let Some((last, front)) = segs.split_last() else {
        return Ok(false);
    };
    let mut current = target.clone();
    for segment in front {
        match hop(&current, segment)? {
            Some(next) => current = next,
            None => return Ok(false),
        }
    }
    match &current {
        Value::Object(obj) => obj.del(last),
        Value::Map(map) => Ok(map.delete(last)),
        Value::Array(arr) => Ok(last
            .parse::<usize>()
            .ok()
            .and_then(|index| arr.remove(index))
            .is_some()),
        _ => Ok(false),
    }
}

/// Apply several path writes as one transaction, so observers see a single
/// coalesced update.
pub fn extend(
    target: &Value,
    entries: impl IntoIterator<Item = (String, Value)>,
) -> Result<()> {
    transaction(|| {
        for (path, value) in entries {
            set_path(target, &path, value)?;
        }
        Ok(())
    })
}
