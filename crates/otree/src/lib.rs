//! Order-preserving nested tree (component A).
//!
//! Mirrors the role of `OTree` in the original `nanostate/compiler/otree.go`:
//! a mapping from string keys to values that remembers insertion order, with
//! values limited to a small set of scalar/sequence/tree shapes.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unsupported leaf type encountered while loading document: {0}")]
    UnsupportedType(String),
}

/// A scalar leaf value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Str(String),
    Bool(bool),
    Int(i64),
    Null,
}

/// A value stored at a key: either a scalar, an ordered sequence, or a nested tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(Scalar),
    Sequence(Vec<Value>),
    Tree(OTree),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Scalar(Scalar::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_tree(&self) -> Option<&OTree> {
        match self {
            Value::Tree(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Sequence(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Scalar(Scalar::Str(s.to_owned()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Scalar(Scalar::Str(s))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Scalar(Scalar::Bool(b))
    }
}

/// An order-preserving mapping from string keys to [`Value`]s.
///
/// Reassigning an existing key keeps its original position; deleting a key
/// removes it from both the key-order list and the value map in the same
/// step, so the two never drift apart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OTree {
    keys: Vec<String>,
    data: HashMap<String, Value>,
}

impl OTree {
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            data: HashMap::new(),
        }
    }

    /// Insert or update `key`. Updating an existing key preserves its
    /// original position in [`OTree::keys`].
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        let key = key.into();
        if !self.data.contains_key(&key) {
            self.keys.push(key.clone());
        }
        self.data.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.data.get(key).cloned().unwrap_or(default)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Remove `key`, compacting both the key order and the value map.
    /// A no-op if the key isn't present.
    pub fn delete(&mut self, key: &str) -> &mut Self {
        if self.data.remove(key).is_some() {
            if let Some(pos) = self.keys.iter().position(|k| k == key) {
                self.keys.remove(pos);
            }
        }
        self
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn get_branch(&self, key: &str) -> Option<&OTree> {
        self.get(key).and_then(Value::as_tree)
    }

    pub fn get_list(&self, key: &str) -> Option<&[Value]> {
        self.get(key).and_then(Value::as_sequence)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Render this tree as a nested `serde_json::Value`, preserving key
    /// order: the workspace enables `serde_json`'s `preserve_order` feature,
    /// which backs `serde_json::Map` with an `IndexMap` instead of a
    /// `BTreeMap`, so insertion order here survives into the built value
    /// instead of being alphabetized.
    pub fn to_serializable(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for key in &self.keys {
            map.insert(key.clone(), value_to_json(&self.data[key]));
        }
        serde_json::Value::Object(map)
    }

    /// Render this tree as a YAML document, for `--debug` tracing dumps.
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(&self.to_serializable()).unwrap_or_default()
    }

    /// Parse a `serde_yaml::Value` (as produced by parsing a state file) into
    /// an `OTree`. Only mappings, sequences, strings, bools, integers, and
    /// null are supported; anything else is `Error::UnsupportedType`.
    pub fn from_ordered_document(doc: &serde_yaml::Value) -> Result<OTree, Error> {
        match doc {
            serde_yaml::Value::Mapping(map) => {
                let mut tree = OTree::new();
                for (k, v) in map {
                    let key = yaml_scalar_to_string(k)?;
                    tree.set(key, yaml_to_value(v)?);
                }
                Ok(tree)
            }
            other => Err(Error::UnsupportedType(format!(
                "top-level document must be a mapping, found {other:?}"
            ))),
        }
    }
}

fn yaml_scalar_to_string(v: &serde_yaml::Value) -> Result<String, Error> {
    match v {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        other => Err(Error::UnsupportedType(format!(
            "keys must be strings, found {other:?}"
        ))),
    }
}

fn yaml_to_value(v: &serde_yaml::Value) -> Result<Value, Error> {
    match v {
        serde_yaml::Value::Null => Ok(Value::Scalar(Scalar::Null)),
        serde_yaml::Value::Bool(b) => Ok(Value::Scalar(Scalar::Bool(*b))),
        serde_yaml::Value::Number(n) => n
            .as_i64()
            .map(|i| Value::Scalar(Scalar::Int(i)))
            .ok_or_else(|| Error::UnsupportedType(format!("non-integer number: {n:?}"))),
        serde_yaml::Value::String(s) => Ok(Value::Scalar(Scalar::Str(s.clone()))),
        serde_yaml::Value::Sequence(seq) => {
            let mut out = Vec::with_capacity(seq.len());
            for item in seq {
                out.push(yaml_to_value(item)?);
            }
            Ok(Value::Sequence(out))
        }
        serde_yaml::Value::Mapping(map) => {
            let mut tree = OTree::new();
            for (k, v) in map {
                let key = yaml_scalar_to_string(k)?;
                tree.set(key, yaml_to_value(v)?);
            }
            Ok(Value::Tree(tree))
        }
        serde_yaml::Value::Tagged(t) => Err(Error::UnsupportedType(format!(
            "tagged values are not supported: {:?}",
            t.tag
        ))),
    }
}

fn value_to_json(v: &Value) -> serde_json::Value {
    match v {
        Value::Scalar(Scalar::Str(s)) => serde_json::Value::String(s.clone()),
        Value::Scalar(Scalar::Bool(b)) => serde_json::Value::Bool(*b),
        Value::Scalar(Scalar::Int(i)) => serde_json::Value::Number((*i).into()),
        Value::Scalar(Scalar::Null) => serde_json::Value::Null,
        Value::Sequence(seq) => serde_json::Value::Array(seq.iter().map(value_to_json).collect()),
        Value::Tree(tree) => tree.to_serializable(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_preserves_insertion_order() {
        let mut tree = OTree::new();
        tree.set("b", Value::from("2"));
        tree.set("a", Value::from("1"));
        tree.set("c", Value::from("3"));
        assert_eq!(tree.keys(), &["b", "a", "c"]);
    }

    #[test]
    fn reassignment_preserves_position() {
        let mut tree = OTree::new();
        tree.set("a", Value::from("1"));
        tree.set("b", Value::from("2"));
        tree.set("a", Value::from("updated"));
        assert_eq!(tree.keys(), &["a", "b"]);
        assert_eq!(tree.get_string("a"), Some("updated"));
    }

    #[test]
    fn delete_compacts_order_and_map() {
        let mut tree = OTree::new();
        tree.set("a", Value::from("1"));
        tree.set("b", Value::from("2"));
        tree.delete("a");
        assert_eq!(tree.keys(), &["b"]);
        assert!(!tree.exists("a"));
    }

    #[test]
    fn to_yaml_round_trips_through_serde_yaml() {
        let mut tree = OTree::new();
        tree.set("id", Value::from("s1"));
        let yaml = tree.to_yaml();
        assert!(yaml.contains("id: s1"));
    }

    #[test]
    fn from_document_rejects_unsupported_leaf() {
        let doc: serde_yaml::Value = serde_yaml::from_str("a: 1.5").unwrap();
        let err = OTree::from_ordered_document(&doc).unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)));
    }

    #[test]
    fn from_document_builds_nested_tree_in_order() {
        let doc: serde_yaml::Value = serde_yaml::from_str(
            r#"
id: s1
description: d
state:
  g1:
    - shell:
        - c1: echo hi
"#,
        )
        .unwrap();
        let tree = OTree::from_ordered_document(&doc).unwrap();
        assert_eq!(tree.keys(), &["id", "description", "state"]);
        let state = tree.get_branch("state").unwrap();
        assert_eq!(state.keys(), &["g1"]);
    }
}
