//! Expression evaluation seam plus a small path evaluator.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value as Json;

use crate::bindings::{is_identifier, Bindings};
use crate::error::FnError;
use crate::function::FunctionCaller;
use crate::value::Value;

/// Evaluates an expression against an input, with bindings and callable functions.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, expression: &str, input: &Value, bindings: &Bindings, caller: &FunctionCaller) -> Result<Value, FnError>;
}

/// Minimal evaluator.
///
/// Supported forms:
/// - `@` (the input) and dotted paths with `[index]` segments (`items[0].status.phase`)
/// - `$name` and `$name.path` against bindings
/// - `'literal'` strings
/// - `fn(arg, ...)` calls through the function caller, arguments evaluated recursively
///
/// Missing path segments evaluate to `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathEvaluator;

#[async_trait]
impl Evaluator for PathEvaluator {
    async fn evaluate(&self, expression: &str, input: &Value, bindings: &Bindings, caller: &FunctionCaller) -> Result<Value, FnError> {
        eval_expr(expression.to_string(), input.clone(), bindings.clone(), caller.clone()).await
    }
}

fn eval_expr(expr: String, input: Value, bindings: Bindings, caller: FunctionCaller) -> BoxFuture<'static, Result<Value, FnError>> {
    async move {
        let e = expr.trim();
        if e.is_empty() {
            return Err(FnError::eval(&expr, "empty expression"));
        }
        if e == "@" {
            return Ok(input);
        }
        if e.len() >= 2 && e.starts_with('\'') && e.ends_with('\'') {
            return Ok(Value::string(&e[1..e.len() - 1]));
        }
        if let Some(open) = e.find('(') {
            let name = &e[..open];
            if is_identifier(name) && e.ends_with(')') {
                let inner = &e[open + 1..e.len() - 1];
                let mut args = Vec::new();
                for part in split_top_level(inner).map_err(|m| FnError::eval(e, m))? {
                    args.push(eval_expr(part, input.clone(), bindings.clone(), caller.clone()).await?);
                }
                return caller.call(name, args).await;
            }
        }
        if let Some(rest) = e.strip_prefix('$') {
            let end = rest.find(['.', '[']).unwrap_or(rest.len());
            let (name, path) = rest.split_at(end);
            let bound = bindings.get(name).ok_or_else(|| FnError::eval(e, format!("variable not defined: ${name}")))?;
            let path = path.strip_prefix('.').unwrap_or(path);
            if path.is_empty() {
                return Ok(bound.clone());
            }
            let root = bound.as_json().ok_or_else(|| FnError::eval(e, format!("${name} is not a JSON value")))?;
            return Ok(Value::Json(select(root, path, e)?.cloned().unwrap_or(Json::Null)));
        }
        let path = e.strip_prefix("@.").or_else(|| e.strip_prefix('.')).unwrap_or(e);
        let root = input.as_json().ok_or_else(|| FnError::eval(e, "input is not a JSON value"))?;
        Ok(Value::Json(select(root, path, e)?.cloned().unwrap_or(Json::Null)))
    }
    .boxed()
}

/// Walk `path` (`a.b[0].c`) from `root`. `Ok(None)` when a segment is missing.
fn select<'a>(root: &'a Json, path: &str, expr: &str) -> Result<Option<&'a Json>, FnError> {
    let mut cur = root;
    for seg in path.split('.') {
        if seg.is_empty() {
            return Err(FnError::eval(expr, "empty path segment"));
        }
        let (key, index) = match seg.find('[') {
            Some(brk) => {
                let close = seg.rfind(']').filter(|c| *c == seg.len() - 1 && *c > brk + 1);
                let close = close.ok_or_else(|| FnError::eval(expr, format!("malformed index in {seg:?}")))?;
                let idx: usize = seg[brk + 1..close].parse().map_err(|_| FnError::eval(expr, format!("invalid index in {seg:?}")))?;
                (&seg[..brk], Some(idx))
            }
            None => (seg, None),
        };
        if !key.is_empty() {
            if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                return Err(FnError::eval(expr, format!("unsupported path segment {seg:?}")));
            }
            match cur {
                Json::Object(map) => match map.get(key) {
                    Some(v) => cur = v,
                    None => return Ok(None),
                },
                _ => return Ok(None),
            }
        }
        if let Some(i) = index {
            match cur {
                Json::Array(arr) => match arr.get(i) {
                    Some(v) => cur = v,
                    None => return Ok(None),
                },
                _ => return Ok(None),
            }
        }
    }
    Ok(Some(cur))
}

/// Split call arguments on commas outside quotes, parens and brackets.
fn split_top_level(s: &str) -> Result<Vec<String>, String> {
    let mut out = Vec::new();
    if s.trim().is_empty() {
        return Ok(out);
    }
    let mut depth = 0i32;
    let mut quoted = false;
    let mut cur = String::new();
    for c in s.chars() {
        match c {
            '\'' => quoted = !quoted,
            '(' | '[' if !quoted => depth += 1,
            ')' | ']' if !quoted => depth -= 1,
            ',' if !quoted && depth == 0 => {
                out.push(std::mem::take(&mut cur));
                continue;
            }
            _ => {}
        }
        cur.push(c);
    }
    if quoted || depth != 0 {
        return Err("unbalanced quotes or brackets".into());
    }
    out.push(cur);
    Ok(out)
}

/// Resolve a template value: `"(expr)"` strings are evaluated, other strings are
/// literals, arrays and objects are resolved element-wise.
pub fn resolve_template<'a>(
    template: &'a Json,
    bindings: &'a Bindings,
    evaluator: &'a dyn Evaluator,
    caller: &'a FunctionCaller,
) -> BoxFuture<'a, Result<Value, FnError>> {
    async move {
        match template {
            Json::String(s) if s.len() >= 2 && s.starts_with('(') && s.ends_with(')') => {
                evaluator.evaluate(&s[1..s.len() - 1], &Value::null(), bindings, caller).await
            }
            Json::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(resolve_template(item, bindings, evaluator, caller).await?.into_json());
                }
                Ok(Value::Json(Json::Array(out)))
            }
            Json::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), resolve_template(v, bindings, evaluator, caller).await?.into_json());
                }
                Ok(Value::Json(Json::Object(out)))
            }
            other => Ok(Value::Json(other.clone())),
        }
    }
    .boxed()
}
