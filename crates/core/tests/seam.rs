#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use futures::FutureExt;
use kassert_core::{
    experimental, parse_selector, stable, ArgSpec, Args, Bindings, FnError, FunctionCaller, FunctionEntry, LabelSelector, Operator,
    Evaluator, PathEvaluator, Value,
};
use serde_json::json;

fn join_entry() -> FunctionEntry {
    FunctionEntry::new(experimental("join"), vec![ArgSpec::any(), ArgSpec::string(), ArgSpec::opt_string()], |args| {
        async move {
            let a = Args::new(&args);
            let sep = if a.len() > 2 { a.opt_string(2)? } else { String::new() };
            Ok(Value::string(format!("{}{sep}{}", a.get(0)?.to_display_string(), a.string(1)?)))
        }
        .boxed()
    })
}

#[tokio::test]
async fn arity_and_types_are_checked_at_call_time() {
    let caller = FunctionCaller::new(vec![join_entry()]);
    assert_eq!(caller.names(), vec!["x_join".to_string()]);
    assert_eq!(caller.get("x_join").unwrap().signature(), "x_join(any, string, string?)");

    let out = caller.call("x_join", vec![Value::Json(json!(1)), Value::string("b"), Value::string("-")]).await.unwrap();
    assert_eq!(out.as_str(), Some("1-b"));
    let out = caller.call("x_join", vec![Value::string("a"), Value::string("b"), Value::null()]).await.unwrap();
    assert_eq!(out.as_str(), Some("ab"));

    let err = caller.call("x_join", vec![Value::string("a")]).await.unwrap_err();
    assert!(matches!(err, FnError::Arity { ref expected, actual: 1, .. } if expected == "2..=3"));
    let err = caller.call("x_join", vec![Value::string("a"), Value::Json(json!(2))]).await.unwrap_err();
    assert!(matches!(err, FnError::InvalidType { index: 1, .. }));
    assert!(matches!(caller.call("join", vec![]).await, Err(FnError::UnknownFunction(_))));
    assert_eq!(stable("env"), "env");
}

#[tokio::test]
async fn evaluator_calls_through_caller() {
    let caller = FunctionCaller::new(vec![join_entry()]);
    let bindings = Bindings::new().with_binding("who", Value::string("web"));
    let v = PathEvaluator.evaluate("x_join($who, 'tier', '.')", &Value::null(), &bindings, &caller).await.unwrap();
    assert_eq!(v.as_str(), Some("web.tier"));
}

#[test]
fn selector_forms() {
    assert_eq!(parse_selector("app"), Some(LabelSelector::Equality(BTreeMap::from([("app".into(), "app".into())]))));
    assert_eq!(parse_selector(""), Some(LabelSelector::Everything));
    assert_eq!(parse_selector("nil"), None);

    let Some(LabelSelector::Requirements(reqs)) = parse_selector("env=prod,!tier") else { panic!("expected requirements") };
    let ops: Vec<(&str, Operator)> = reqs.iter().map(|r| (r.key.as_str(), r.operator)).collect();
    assert_eq!(ops, vec![("env", Operator::In), ("tier", Operator::DoesNotExist)]);
}
