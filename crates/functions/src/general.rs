use kassert_core::{table, Args, Bindings, FnError, Value};
use serde_json::Value as Json;

use crate::FunctionLibrary;

pub(crate) async fn env(args: Vec<Value>) -> Result<Value, FnError> {
    let name = Args::new(&args).string(0)?;
    Ok(Value::string(std::env::var(name).unwrap_or_default()))
}

pub(crate) async fn trim_space(args: Vec<Value>) -> Result<Value, FnError> {
    let s = Args::new(&args).string(0)?;
    Ok(Value::string(s.trim()))
}

pub(crate) async fn as_string(args: Vec<Value>) -> Result<Value, FnError> {
    match Args::new(&args).get(0)? {
        Value::Json(Json::String(s)) => Ok(Value::string(s.clone())),
        _ => Ok(Value::null()),
    }
}

/// Print a name/status table of a list (its `items`) or a single object.
/// With a path, the second column is the path evaluated against each item.
pub(crate) async fn table_print(lib: FunctionLibrary, args: Vec<Value>) -> Result<Value, FnError> {
    let a = Args::new(&args);
    let input = a.json(0)?;
    let path = a.opt_string(1)?;
    let rendered = render_table(&lib, input, &path).await;
    println!("\n{rendered}\n");
    Ok(Value::string(""))
}

pub(crate) async fn render_table(lib: &FunctionLibrary, input: &Json, path: &str) -> String {
    let items: Vec<&Json> = match input.get("items").and_then(Json::as_array) {
        Some(items) => items.iter().collect(),
        None => vec![input],
    };
    let caller = lib.inner_caller();
    let mut rows = Vec::with_capacity(items.len());
    for item in items {
        let Some(obj) = item.as_object() else { continue };
        let name = obj.get("metadata").and_then(|m| m.get("name")).and_then(Json::as_str).unwrap_or("").to_string();
        let mut second = None;
        if !path.is_empty() {
            if let Ok(v) = lib.evaluator().evaluate(path, &Value::Json(item.clone()), &Bindings::new(), &caller).await {
                second = Some(v.to_display_string());
            }
        }
        let second = match second {
            Some(s) => s,
            None => serde_json::to_string_pretty(obj.get("status").unwrap_or(&Json::Null)).unwrap_or_default(),
        };
        rows.push(vec![name, second]);
    }
    table::render_with_name("", &["name", "status"], &rows)
}
