use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::value::Value;

/// Immutable name -> value environment. Writes return a new environment.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    entries: Arc<FxHashMap<String, Value>>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    /// Copy-on-write: later writes shadow earlier ones, `self` is untouched.
    pub fn with_binding(&self, name: impl Into<String>, value: Value) -> Bindings {
        let mut next = (*self.entries).clone();
        next.insert(name.into(), value);
        Bindings { entries: Arc::new(next) }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_do_not_alias() {
        let base = Bindings::new().with_binding("a", Value::string("1"));
        let left = base.with_binding("a", Value::string("2"));
        let right = base.with_binding("b", Value::string("3"));
        assert_eq!(base.get("a").and_then(Value::as_str), Some("1"));
        assert_eq!(left.get("a").and_then(Value::as_str), Some("2"));
        assert!(left.get("b").is_none());
        assert_eq!(right.names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("client"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
    }
}
