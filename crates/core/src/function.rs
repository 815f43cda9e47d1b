use std::sync::Arc;

use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::debug;

use crate::error::FnError;
use crate::value::Value;

/// Prefix carried by experimental function names.
pub const EXPERIMENTAL_PREFIX: &str = "x_";

pub fn stable(name: &str) -> String {
    name.to_string()
}

pub fn experimental(name: &str) -> String {
    format!("{EXPERIMENTAL_PREFIX}{name}")
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArgKind {
    /// Opaque handle or arbitrary JSON.
    Any,
    String,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ArgSpec {
    pub kind: ArgKind,
    pub optional: bool,
}

impl ArgSpec {
    pub const fn any() -> Self {
        Self { kind: ArgKind::Any, optional: false }
    }

    pub const fn string() -> Self {
        Self { kind: ArgKind::String, optional: false }
    }

    pub const fn opt_string() -> Self {
        Self { kind: ArgKind::String, optional: true }
    }
}

pub type Handler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, FnError>> + Send + Sync>;

#[derive(Clone)]
pub struct FunctionEntry {
    pub name: String,
    pub arguments: Vec<ArgSpec>,
    pub handler: Handler,
}

impl FunctionEntry {
    pub fn new<F>(name: String, arguments: Vec<ArgSpec>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, FnError>> + Send + Sync + 'static,
    {
        Self { name, arguments, handler: Arc::new(handler) }
    }

    /// Render as `name(any, string, string?)`.
    pub fn signature(&self) -> String {
        let args: Vec<&str> = self
            .arguments
            .iter()
            .map(|a| match (a.kind, a.optional) {
                (ArgKind::Any, false) => "any",
                (ArgKind::Any, true) => "any?",
                (ArgKind::String, false) => "string",
                (ArgKind::String, true) => "string?",
            })
            .collect();
        format!("{}({})", self.name, args.join(", "))
    }

    fn check(&self, args: &[Value]) -> Result<(), FnError> {
        let required = self.arguments.iter().filter(|a| !a.optional).count();
        if args.len() < required || args.len() > self.arguments.len() {
            let expected = if required == self.arguments.len() {
                required.to_string()
            } else {
                format!("{}..={}", required, self.arguments.len())
            };
            return Err(FnError::Arity { name: self.name.clone(), expected, actual: args.len() });
        }
        for (index, (spec, value)) in self.arguments.iter().zip(args).enumerate() {
            let ok = match spec.kind {
                ArgKind::Any => true,
                ArgKind::String => value.as_str().is_some() || (spec.optional && value.is_null()),
            };
            if !ok {
                return Err(FnError::InvalidType { index, expected: "string", actual: value.type_label() });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for FunctionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.signature())
    }
}

/// Name-indexed function table handed to an evaluator.
#[derive(Clone, Default)]
pub struct FunctionCaller {
    entries: Arc<FxHashMap<String, FunctionEntry>>,
}

impl FunctionCaller {
    pub fn new(entries: impl IntoIterator<Item = FunctionEntry>) -> Self {
        let map: FxHashMap<String, FunctionEntry> = entries.into_iter().map(|e| (e.name.clone(), e)).collect();
        Self { entries: Arc::new(map) }
    }

    pub fn get(&self, name: &str) -> Option<&FunctionEntry> {
        self.entries.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Arity and argument types are checked here, at call time.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, FnError> {
        let entry = self.entries.get(name).ok_or_else(|| FnError::UnknownFunction(name.to_string()))?;
        entry.check(&args)?;
        debug!(function = %name, args = args.len(), "fn call");
        (entry.handler)(args).await
    }
}

impl std::fmt::Debug for FunctionCaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn echo() -> FunctionEntry {
        FunctionEntry::new(experimental("echo"), vec![ArgSpec::string(), ArgSpec::opt_string()], |args| {
            async move { Ok(args.into_iter().next().unwrap_or_else(Value::null)) }.boxed()
        })
    }

    #[tokio::test]
    async fn call_checks_arity_and_types() {
        let caller = FunctionCaller::new(vec![echo()]);
        assert_eq!(caller.names(), vec!["x_echo".to_string()]);
        let out = caller.call("x_echo", vec![Value::string("hi")]).await.unwrap();
        assert_eq!(out.as_str(), Some("hi"));
        assert!(matches!(caller.call("x_echo", vec![]).await, Err(FnError::Arity { .. })));
        assert!(matches!(
            caller.call("x_echo", vec![Value::string("a"), Value::string("b"), Value::string("c")]).await,
            Err(FnError::Arity { .. })
        ));
        assert!(matches!(caller.call("x_echo", vec![Value::from(true)]).await, Err(FnError::InvalidType { index: 0, .. })));
        assert!(matches!(caller.call("echo", vec![]).await, Err(FnError::UnknownFunction(_))));
    }

    #[test]
    fn signature_marks_optional() {
        assert_eq!(echo().signature(), "x_echo(string, string?)");
    }
}
