//! CUD actions - single insert/update/delete mutations addressed by key path

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CudType {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for CudType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CudType::Insert => write!(f, "insert"),
            CudType::Update => write!(f, "update"),
            CudType::Delete => write!(f, "delete"),
        }
    }
}

/// Application-defined code attached to an action or a close/reload event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Code {
    Number(i64),
    Text(String),
}

impl From<i64> for Code {
    fn from(n: i64) -> Self {
        Code::Number(n)
    }
}

impl From<&str> for Code {
    fn from(s: &str) -> Self {
        Code::Text(s.to_string())
    }
}

impl From<String> for Code {
    fn from(s: String) -> Self {
        Code::Text(s)
    }
}

/// Optional extras for a mutation.
///
/// `if_contains` is only meaningful for inserts and is dropped otherwise.
/// `timestamp` overrides the package timestamp when a single action is
/// emitted directly; sequences carry their own timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CudOptions {
    pub if_contains: Option<String>,
    pub code: Option<Code>,
    pub data: Option<Value>,
    pub timestamp: Option<i64>,
}

impl CudOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn if_contains(mut self, key: impl Into<String>) -> Self {
        self.if_contains = Some(key.into());
        self
    }

    pub fn code(mut self, code: impl Into<Code>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// One mutation against the synchronized data.
///
/// An empty key path addresses the whole data root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CudAction {
    #[serde(rename = "t")]
    kind: CudType,
    #[serde(rename = "k")]
    key_path: Vec<String>,
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
    if_contains: Option<String>,
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    code: Option<Code>,
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CudAction {
    pub fn insert(key_path: KeyPath, value: Value, options: CudOptions) -> Self {
        Self {
            kind: CudType::Insert,
            key_path: key_path.0,
            value: Some(value),
            if_contains: options.if_contains,
            code: options.code,
            data: options.data,
        }
    }

    pub fn update(key_path: KeyPath, value: Value, options: CudOptions) -> Self {
        Self {
            kind: CudType::Update,
            key_path: key_path.0,
            value: Some(value),
            if_contains: None,
            code: options.code,
            data: options.data,
        }
    }

    pub fn delete(key_path: KeyPath, options: CudOptions) -> Self {
        Self {
            kind: CudType::Delete,
            key_path: key_path.0,
            value: None,
            if_contains: None,
            code: options.code,
            data: options.data,
        }
    }

    pub fn kind(&self) -> CudType {
        self.kind
    }

    pub fn key_path(&self) -> &[String] {
        &self.key_path
    }

    /// Whether the action targets the whole data root
    pub fn is_root(&self) -> bool {
        self.key_path.is_empty()
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn if_contains(&self) -> Option<&str> {
        self.if_contains.as_deref()
    }

    pub fn code(&self) -> Option<&Code> {
        self.code.as_ref()
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }
}

/// Ordered list of keys locating a value inside the synchronized structure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn into_inner(self) -> Vec<String> {
        self.0
    }
}

impl From<Vec<String>> for KeyPath {
    fn from(keys: Vec<String>) -> Self {
        Self(keys)
    }
}

impl From<&[&str]> for KeyPath {
    fn from(keys: &[&str]) -> Self {
        Self(keys.iter().map(|k| k.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for KeyPath {
    fn from(keys: [&str; N]) -> Self {
        Self(keys.iter().map(|k| k.to_string()).collect())
    }
}

/// Dotted paths are split into keys; the empty string is the root.
impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        if path.is_empty() {
            return Self::root();
        }
        Self(path.split('.').map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_keeps_if_contains() {
        let action = CudAction::insert(
            ["messages", "42"].into(),
            json!("hello"),
            CudOptions::new().if_contains("messages").code(7),
        );
        assert_eq!(action.kind(), CudType::Insert);
        assert_eq!(action.key_path(), &["messages".to_string(), "42".to_string()]);
        assert_eq!(action.if_contains(), Some("messages"));
        assert_eq!(action.code(), Some(&Code::Number(7)));
    }

    #[test]
    fn test_update_and_delete_drop_if_contains() {
        let opts = CudOptions::new().if_contains("x");
        let update = CudAction::update("a.b".into(), json!(1), opts.clone());
        let delete = CudAction::delete("a.b".into(), opts);
        assert!(update.if_contains().is_none());
        assert!(delete.if_contains().is_none());
        assert!(delete.value().is_none());
    }

    #[test]
    fn test_empty_path_is_root() {
        let action = CudAction::delete("".into(), CudOptions::default());
        assert!(action.is_root());
    }

    #[test]
    fn test_wire_form_uses_short_keys() {
        let action = CudAction::update(["user", "name"].into(), json!("Bob"), CudOptions::new().code("rename"));
        let wire = serde_json::to_value(&action).unwrap();
        assert_eq!(wire, json!({ "t": "update", "k": ["user", "name"], "v": "Bob", "c": "rename" }));
    }
}
