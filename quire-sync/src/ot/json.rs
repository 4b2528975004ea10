//! Path-addressed operations over JSON documents.
//!
//! An operation is an ordered list of components. Each component either sets
//! the value at a path or deletes it. Array elements can be replaced in place
//! but an array only changes length when it is set as a whole, so indices are
//! stable under concurrent edits and transform never has to shift them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// One step of a path: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSeg {
    Key(String),
    Index(usize),
}

impl From<&str> for PathSeg {
    fn from(key: &str) -> Self {
        PathSeg::Key(key.to_string())
    }
}

impl From<usize> for PathSeg {
    fn from(index: usize) -> Self {
        PathSeg::Index(index)
    }
}

impl std::fmt::Display for PathSeg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathSeg::Key(k) => write!(f, "{k}"),
            PathSeg::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// Build a path from string keys, e.g. `path(&["translateConfig", "shareEnabled"])`.
pub fn path(keys: &[&str]) -> Vec<PathSeg> {
    keys.iter().map(|k| PathSeg::from(*k)).collect()
}

fn display_path(path: &[PathSeg]) -> String {
    if path.is_empty() {
        return "<root>".to_string();
    }
    path.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(".")
}

/// Read the value at `path`, if present.
pub fn lookup<'a>(value: &'a Value, path: &[PathSeg]) -> Option<&'a Value> {
    path.iter().try_fold(value, |node, seg| match (node, seg) {
        (Value::Object(map), PathSeg::Key(k)) => map.get(k),
        (Value::Array(items), PathSeg::Index(i)) => items.get(*i),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum JsonComponent {
    Set { path: Vec<PathSeg>, value: Value },
    Delete { path: Vec<PathSeg> },
}

impl JsonComponent {
    pub fn path(&self) -> &[PathSeg] {
        match self {
            JsonComponent::Set { path, .. } | JsonComponent::Delete { path } => path,
        }
    }

    fn apply_to(&self, doc: &mut Value) -> Result<(), SyncError> {
        match self {
            JsonComponent::Set { path, value } => {
                let Some((last, parent_path)) = path.split_last() else {
                    *doc = value.clone();
                    return Ok(());
                };
                let parent = lookup_mut(doc, parent_path).ok_or_else(|| {
                    SyncError::InvalidOp(format!("set: no parent at {}", display_path(path)))
                })?;
                match (parent, last) {
                    (Value::Object(map), PathSeg::Key(k)) => {
                        map.insert(k.clone(), value.clone());
                        Ok(())
                    }
                    (Value::Array(items), PathSeg::Index(i)) if *i < items.len() => {
                        items[*i] = value.clone();
                        Ok(())
                    }
                    _ => Err(SyncError::InvalidOp(format!(
                        "set: cannot address {}",
                        display_path(path)
                    ))),
                }
            }
            JsonComponent::Delete { path } => {
                let Some((last, parent_path)) = path.split_last() else {
                    return Err(SyncError::InvalidOp("delete: empty path".into()));
                };
                let removed = match (lookup_mut(doc, parent_path), last) {
                    (Some(Value::Object(map)), PathSeg::Key(k)) => map.remove(k),
                    _ => None,
                };
                removed.map(|_| ()).ok_or_else(|| {
                    SyncError::InvalidOp(format!("delete: nothing at {}", display_path(path)))
                })
            }
        }
    }
}

fn lookup_mut<'a>(value: &'a mut Value, path: &[PathSeg]) -> Option<&'a mut Value> {
    let mut node = value;
    for seg in path {
        node = match (node, seg) {
            (Value::Object(map), PathSeg::Key(k)) => map.get_mut(k)?,
            (Value::Array(items), PathSeg::Index(i)) => items.get_mut(*i)?,
            _ => return None,
        };
    }
    Some(node)
}

/// Whether `prefix` is a strict ancestor of `path`.
fn is_strict_prefix(prefix: &[PathSeg], path: &[PathSeg]) -> bool {
    prefix.len() < path.len() && path.starts_with(prefix)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonOp(pub Vec<JsonComponent>);

impl JsonOp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: Vec<PathSeg>, value: Value) -> Self {
        self.0.push(JsonComponent::Set { path, value });
        self
    }

    pub fn delete(mut self, path: Vec<PathSeg>) -> Self {
        self.0.push(JsonComponent::Delete { path });
        self
    }

    pub fn components(&self) -> &[JsonComponent] {
        &self.0
    }

    pub fn is_noop(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply all components in order. Fails without touching `doc` if any
    /// component cannot be applied.
    pub fn apply(&self, doc: &Value) -> Result<Value, SyncError> {
        let mut out = doc.clone();
        for component in &self.0 {
            component.apply_to(&mut out)?;
        }
        Ok(out)
    }

    /// Rewrite `self` so it applies after `applied`, which was committed
    /// first against the same base.
    ///
    /// Writes to the same path resolve in favour of `self`. A component whose
    /// ancestor was replaced or removed by `applied` cannot be rebased and
    /// yields `VersionConflict`.
    pub fn transform(&self, applied: &JsonOp) -> Result<JsonOp, SyncError> {
        let mut out = Vec::with_capacity(self.0.len());
        'components: for component in &self.0 {
            for prior in &applied.0 {
                if is_strict_prefix(prior.path(), component.path()) {
                    return Err(SyncError::VersionConflict(format!(
                        "{} was replaced concurrently",
                        display_path(prior.path())
                    )));
                }
                if prior.path() == component.path()
                    && matches!(prior, JsonComponent::Delete { .. })
                    && matches!(component, JsonComponent::Delete { .. })
                {
                    continue 'components;
                }
            }
            out.push(component.clone());
        }
        Ok(JsonOp(out))
    }

    /// Smallest op turning `old` into `new`.
    pub fn diff(old: &Value, new: &Value) -> JsonOp {
        let mut op = JsonOp::new();
        diff_into(&mut Vec::new(), old, new, &mut op.0);
        op
    }
}

fn diff_into(at: &mut Vec<PathSeg>, old: &Value, new: &Value, out: &mut Vec<JsonComponent>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            for key in a.keys().filter(|k| !b.contains_key(*k)) {
                let mut path = at.clone();
                path.push(PathSeg::Key(key.clone()));
                out.push(JsonComponent::Delete { path });
            }
            for (key, new_value) in b {
                at.push(PathSeg::Key(key.clone()));
                match a.get(key) {
                    Some(old_value) => diff_into(at, old_value, new_value, out),
                    None => out.push(JsonComponent::Set {
                        path: at.clone(),
                        value: new_value.clone(),
                    }),
                }
                at.pop();
            }
        }
        (Value::Array(a), Value::Array(b)) if a.len() == b.len() => {
            for (i, (old_item, new_item)) in a.iter().zip(b).enumerate() {
                at.push(PathSeg::Index(i));
                diff_into(at, old_item, new_item, out);
                at.pop();
            }
        }
        _ => out.push(JsonComponent::Set {
            path: at.clone(),
            value: new.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_and_delete() {
        let doc = json!({"name": "A", "tagIcon": "star", "tags": ["x", "y"]});
        let op = JsonOp::new()
            .set(path(&["name"]), json!("B"))
            .delete(path(&["tagIcon"]))
            .set(vec!["tags".into(), 1.into()], json!("z"));
        let out = op.apply(&doc).unwrap();
        assert_eq!(out, json!({"name": "B", "tags": ["x", "z"]}));
        // Input untouched
        assert_eq!(doc["name"], "A");
    }

    #[test]
    fn test_set_root() {
        let op = JsonOp::new().set(vec![], json!({"fresh": true}));
        assert_eq!(op.apply(&json!({"old": 1})).unwrap(), json!({"fresh": true}));
    }

    #[test]
    fn test_invalid_components() {
        let doc = json!({"tags": ["x"]});
        assert!(JsonOp::new().set(path(&["missing", "leaf"]), json!(1)).apply(&doc).is_err());
        assert!(JsonOp::new().set(vec!["tags".into(), 1.into()], json!(1)).apply(&doc).is_err());
        assert!(JsonOp::new().delete(path(&["nope"])).apply(&doc).is_err());
        assert!(JsonOp::new().delete(vec!["tags".into(), 0.into()]).apply(&doc).is_err());
        assert!(JsonOp::new().delete(vec![]).apply(&doc).is_err());
    }

    #[test]
    fn test_transform_disjoint_paths_commute() {
        let base = json!({"name": "A", "status": "draft"});
        let a = JsonOp::new().set(path(&["name"]), json!("B"));
        let b = JsonOp::new().set(path(&["status"]), json!("final"));

        let b2 = b.transform(&a).unwrap();
        let via_a = b2.apply(&a.apply(&base).unwrap()).unwrap();
        let a2 = a.transform(&b).unwrap();
        let via_b = a2.apply(&b.apply(&base).unwrap()).unwrap();

        assert_eq!(via_a, json!({"name": "B", "status": "final"}));
        assert_eq!(via_a, via_b);
    }

    #[test]
    fn test_transform_same_path_incoming_wins() {
        let applied = JsonOp::new().set(path(&["name"]), json!("first"));
        let incoming = JsonOp::new().set(path(&["name"]), json!("second"));
        let rebased = incoming.transform(&applied).unwrap();
        assert_eq!(rebased, incoming);
    }

    #[test]
    fn test_transform_double_delete_dropped() {
        let applied = JsonOp::new().delete(path(&["tagIcon"]));
        let incoming = JsonOp::new()
            .delete(path(&["tagIcon"]))
            .set(path(&["name"]), json!("x"));
        let rebased = incoming.transform(&applied).unwrap();
        assert_eq!(rebased, JsonOp::new().set(path(&["name"]), json!("x")));
    }

    #[test]
    fn test_transform_replaced_ancestor_conflicts() {
        let applied = JsonOp::new().set(path(&["config"]), json!(null));
        let incoming = JsonOp::new().set(path(&["config", "shareEnabled"]), json!(true));
        assert!(matches!(
            incoming.transform(&applied),
            Err(SyncError::VersionConflict(_))
        ));

        // Overwriting the ancestor of a concurrent write is fine.
        let applied = JsonOp::new().set(path(&["config", "shareEnabled"]), json!(true));
        let incoming = JsonOp::new().set(path(&["config"]), json!({}));
        assert_eq!(incoming.transform(&applied).unwrap(), incoming);
    }

    #[test]
    fn test_diff_reproduces_target() {
        let old = json!({"name": "A", "drop": 1, "nested": {"a": 1, "b": [1, 2]}, "list": [1]});
        let new = json!({"name": "B", "nested": {"a": 1, "b": [1, 3], "c": true}, "list": [1, 2]});
        let op = JsonOp::diff(&old, &new);
        assert_eq!(op.apply(&old).unwrap(), new);
        assert!(JsonOp::diff(&new, &new).is_noop());
    }

    #[test]
    fn test_wire_shape() {
        let op = JsonOp::new().set(vec!["tags".into(), 0.into()], json!("x"));
        let text = serde_json::to_string(&op).unwrap();
        assert_eq!(text, r#"[{"action":"set","path":["tags",0],"value":"x"}]"#);
        let back: JsonOp = serde_json::from_str(&text).unwrap();
        assert_eq!(back, op);
    }
}
