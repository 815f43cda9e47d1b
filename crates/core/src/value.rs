use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::FnError;

/// Type-erased shared reference passed through bindings (clients, configs).
#[derive(Clone)]
pub struct Handle {
    type_name: &'static str,
    inner: Arc<dyn Any + Send + Sync>,
}

impl Handle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self { type_name: std::any::type_name::<T>(), inner: value }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    pub fn downcast_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner.clone().downcast::<T>().ok()
    }

    pub fn ptr_eq(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle<{}>", self.type_name)
    }
}

/// A value flowing through bindings and function arguments.
#[derive(Debug, Clone)]
pub enum Value {
    Json(serde_json::Value),
    Handle(Handle),
}

impl Value {
    pub fn null() -> Self {
        Value::Json(serde_json::Value::Null)
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::Json(serde_json::Value::String(s.into()))
    }

    pub fn handle<T: Any + Send + Sync>(value: T) -> Self {
        Value::Handle(Handle::new(value))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Json(serde_json::Value::Null))
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(v) => Some(v),
            Value::Handle(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_json().and_then(|v| v.as_str())
    }

    /// JSON form; handles render as their type name.
    pub fn into_json(self) -> serde_json::Value {
        match self {
            Value::Json(v) => v,
            Value::Handle(h) => serde_json::Value::String(format!("<{}>", h.type_name())),
        }
    }

    pub fn type_label(&self) -> String {
        match self {
            Value::Json(serde_json::Value::Null) => "null".into(),
            Value::Json(serde_json::Value::Bool(_)) => "boolean".into(),
            Value::Json(serde_json::Value::Number(_)) => "number".into(),
            Value::Json(serde_json::Value::String(_)) => "string".into(),
            Value::Json(serde_json::Value::Array(_)) => "array".into(),
            Value::Json(serde_json::Value::Object(_)) => "object".into(),
            Value::Handle(h) => h.type_name().to_string(),
        }
    }

    /// String form used when comparing against an expected literal.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Json(serde_json::Value::Null) => String::new(),
            Value::Json(serde_json::Value::String(s)) => s.clone(),
            Value::Json(other) => other.to_string(),
            Value::Handle(h) => format!("<{}>", h.type_name()),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<Handle> for Value {
    fn from(h: Handle) -> Self {
        Value::Handle(h)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Json(serde_json::Value::Bool(b))
    }
}

/// Positional argument accessor with typed extraction errors.
pub struct Args<'a> {
    items: &'a [Value],
}

impl<'a> Args<'a> {
    pub fn new(items: &'a [Value]) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&'a Value, FnError> {
        self.items.get(index).ok_or(FnError::IndexOutOfRange { index, len: self.items.len() })
    }

    pub fn string(&self, index: usize) -> Result<String, FnError> {
        match self.get(index)? {
            Value::Json(serde_json::Value::String(s)) => Ok(s.clone()),
            other => Err(FnError::InvalidType { index, expected: "string", actual: other.type_label() }),
        }
    }

    /// Trailing optional string: absent or null reads as empty.
    pub fn opt_string(&self, index: usize) -> Result<String, FnError> {
        match self.items.get(index) {
            None => Ok(String::new()),
            Some(v) if v.is_null() => Ok(String::new()),
            Some(_) => self.string(index),
        }
    }

    /// Typed handle; `null` yields `None` so callers can report a nil config.
    pub fn handle<T: Any + Send + Sync>(&self, index: usize) -> Result<Option<Arc<T>>, FnError> {
        match self.get(index)? {
            Value::Json(serde_json::Value::Null) => Ok(None),
            Value::Handle(h) => h
                .downcast_arc::<T>()
                .map(Some)
                .ok_or_else(|| FnError::InvalidType { index, expected: std::any::type_name::<T>(), actual: h.type_name().to_string() }),
            other => Err(FnError::InvalidType { index, expected: std::any::type_name::<T>(), actual: other.type_label() }),
        }
    }

    /// Like [`Args::handle`] but treats `null` as a type error.
    pub fn required_handle<T: Any + Send + Sync>(&self, index: usize) -> Result<Arc<T>, FnError> {
        self.handle::<T>(index)?
            .ok_or(FnError::InvalidType { index, expected: std::any::type_name::<T>(), actual: "null".into() })
    }

    pub fn json(&self, index: usize) -> Result<&'a serde_json::Value, FnError> {
        match self.get(index)? {
            Value::Json(v) => Ok(v),
            Value::Handle(h) => Err(FnError::InvalidType { index, expected: "json", actual: h.type_name().to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extraction_errors() {
        let items = vec![Value::string("a"), Value::Json(json!(3))];
        let args = Args::new(&items);
        assert_eq!(args.string(0).unwrap(), "a");
        assert!(matches!(args.string(1), Err(FnError::InvalidType { index: 1, .. })));
        assert!(matches!(args.string(2), Err(FnError::IndexOutOfRange { index: 2, len: 2 })));
        assert_eq!(args.opt_string(5).unwrap(), "");
    }

    #[test]
    fn handles_downcast() {
        let items = vec![Value::handle(42u32), Value::null(), Value::string("x")];
        let args = Args::new(&items);
        assert_eq!(*args.handle::<u32>(0).unwrap().unwrap(), 42);
        assert!(args.handle::<u32>(1).unwrap().is_none());
        assert!(args.required_handle::<u32>(1).is_err());
        assert!(args.handle::<String>(0).is_err());
        assert!(args.handle::<u32>(2).is_err());
    }

    #[test]
    fn display_string() {
        assert_eq!(Value::string("Running").to_display_string(), "Running");
        assert_eq!(Value::Json(json!(2)).to_display_string(), "2");
        assert_eq!(Value::Json(json!(true)).to_display_string(), "true");
        assert_eq!(Value::null().to_display_string(), "");
    }
}
