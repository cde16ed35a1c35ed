//! Slash-separated paths into a JSON document tree.
//!
//! The store follows the Realtime Database conventions: an absent node and a
//! `null` node are the same thing, and writing `null` (or an empty object)
//! removes the node and any parents left empty by the removal.

use crate::error::RealtimeError;
use serde_json::{Map, Value};

/// Characters a single path segment may not contain.
const FORBIDDEN: &[char] = &['.', '$', '#', '[', ']', '/'];

/// Split a path into its non-empty segments.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Canonical form of a path: no leading, trailing or doubled slashes.
pub fn normalize(path: &str) -> String {
    segments(path).join("/")
}

/// Append `child` below `base`.
pub fn join(base: &str, child: &str) -> String {
    let mut segs = segments(base);
    segs.extend(segments(child));
    segs.join("/")
}

/// True when one path is an ancestor of (or equal to) the other, i.e. a write
/// at one of them can change the value observed at the other.
pub fn overlaps(a: &str, b: &str) -> bool {
    segments(a)
        .iter()
        .zip(segments(b).iter())
        .all(|(x, y)| x == y)
}

/// Value stored at `path`, `None` when absent.
pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = root;
    for seg in segments(path) {
        node = match node {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if node.is_null() {
        None
    } else {
        Some(node)
    }
}

/// Overwrite the node at `path`. `null` deletes it.
pub fn set(root: &mut Value, path: &str, value: Value) {
    let segs = segments(path);
    set_at(root, &segs, prune(value));
}

/// Apply a partial update: every key of `partial` is written below `path`.
/// Keys may themselves be multi-segment paths.
pub fn merge(root: &mut Value, path: &str, partial: Value) -> Result<(), RealtimeError> {
    let Value::Object(children) = partial else {
        return Err(RealtimeError::PathError(format!(
            "merge at '{}' expects an object",
            path
        )));
    };
    for (key, value) in children {
        set(root, &join(path, &key), value);
    }
    Ok(())
}

fn prune(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let map: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, prune(v)))
                .filter(|(_, v)| !v.is_null())
                .collect();
            if map.is_empty() {
                Value::Null
            } else {
                Value::Object(map)
            }
        }
        other => other,
    }
}

fn set_at(node: &mut Value, segs: &[&str], value: Value) {
    let Some((head, rest)) = segs.split_first() else {
        *node = value;
        return;
    };

    if value.is_null() {
        let now_empty = match node {
            Value::Object(map) => {
                if let Some(child) = map.get_mut(*head) {
                    set_at(child, rest, Value::Null);
                    if child.is_null() {
                        map.remove(*head);
                    }
                }
                map.is_empty()
            }
            Value::Array(_) => {
                to_object(node);
                set_at(node, segs, Value::Null);
                false
            }
            _ => false,
        };
        if now_empty {
            *node = Value::Null;
        }
        return;
    }

    to_object(node);
    if let Some(map) = node.as_object_mut() {
        let child = map.entry(head.to_string()).or_insert(Value::Null);
        set_at(child, rest, value);
    }
}

/// Arrays are index-keyed objects in this model; anything else is replaced.
fn to_object(node: &mut Value) {
    match node {
        Value::Object(_) => {}
        Value::Array(items) => {
            let map = std::mem::take(items)
                .into_iter()
                .enumerate()
                .filter(|(_, v)| !v.is_null())
                .map(|(i, v)| (i.to_string(), v))
                .collect();
            *node = Value::Object(map);
        }
        _ => *node = Value::Object(Map::new()),
    }
}

/// A path with `{name}` placeholders, e.g. `users/{uid}/tasks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate(String);

impl PathTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Substitute every placeholder. A missing parameter, or a value that is
    /// not a valid single segment, is an error rather than a silently wrong
    /// path.
    pub fn render(&self, params: &[(&str, &str)]) -> Result<String, RealtimeError> {
        let mut out = Vec::new();
        for seg in segments(&self.0) {
            match seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) => {
                    let value = params
                        .iter()
                        .find(|(key, _)| *key == name)
                        .map(|(_, value)| *value)
                        .ok_or_else(|| {
                            RealtimeError::PathError(format!(
                                "missing parameter '{}' for '{}'",
                                name, self.0
                            ))
                        })?;
                    if value.is_empty() || value.contains(FORBIDDEN) {
                        return Err(RealtimeError::PathError(format!(
                            "invalid value '{}' for parameter '{}'",
                            value, name
                        )));
                    }
                    out.push(value.to_string());
                }
                None => out.push(seg.to_string()),
            }
        }
        Ok(out.join("/"))
    }
}

impl std::fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
