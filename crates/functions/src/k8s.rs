//! Single-cluster queries against a bound client.

use kassert_core::{parse_selector, Args, Bindings, ClusterError, FnError, Gvk, Value};
use kassert_kubehub::{ClientOptions, SharedClient};
use kassert_ops::PollWaiter;
use serde_json::{json, Value as Json};
use tracing::{debug, info};

use crate::{client_arg, config_arg, FunctionLibrary};

fn ns_opt(namespace: &str) -> Option<&str> {
    if namespace.is_empty() {
        None
    } else {
        Some(namespace)
    }
}

/// `{apiVersion, kind: <Kind>List, metadata, items}`.
pub(crate) fn list_object(api_version: &str, kind: &str, items: Vec<Json>) -> Json {
    json!({
        "apiVersion": api_version,
        "kind": format!("{kind}List"),
        "metadata": {},
        "items": items,
    })
}

pub(crate) async fn get(args: Vec<Value>) -> Result<Value, FnError> {
    let a = Args::new(&args);
    let client = client_arg(&a, 0)?;
    let gvk = Gvk::from_api_version(&a.string(1)?, &a.string(2)?)?;
    let namespace = a.string(3)?;
    let name = a.string(4)?;
    let obj = client.get(&gvk, ns_opt(&namespace), &name).await?;
    Ok(Value::Json(obj))
}

pub(crate) async fn exists(args: Vec<Value>) -> Result<Value, FnError> {
    match get(args).await {
        Ok(_) => Ok(true.into()),
        Err(e) if e.is_not_found() => Ok(false.into()),
        Err(e) => Err(e),
    }
}

pub(crate) async fn resource_exists(args: Vec<Value>) -> Result<Value, FnError> {
    let a = Args::new(&args);
    let client = client_arg(&a, 0)?;
    let gvk = Gvk::from_api_version(&a.string(1)?, &a.string(2)?)?;
    match client.has_mapping(&gvk).await {
        Ok(found) => Ok(found.into()),
        Err(e) if e.is_no_match() => Ok(false.into()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn list_items(
    client: &SharedClient,
    api_version: &str,
    kind: &str,
    namespace: &str,
    selector: &str,
) -> Result<Vec<Json>, ClusterError> {
    let gvk = Gvk::from_api_version(api_version, kind)?;
    let selector = parse_selector(selector);
    client.list(&gvk, ns_opt(namespace), selector.as_ref()).await
}

pub(crate) async fn list(args: Vec<Value>) -> Result<Value, FnError> {
    let a = Args::new(&args);
    let client = client_arg(&a, 0)?;
    let (api_version, kind) = (a.string(1)?, a.string(2)?);
    let namespace = a.opt_string(3)?;
    let items = list_items(&client, &api_version, &kind, &namespace, "").await?;
    Ok(Value::Json(list_object(&api_version, &kind, items)))
}

pub(crate) async fn server_version(lib: FunctionLibrary, args: Vec<Value>) -> Result<Value, FnError> {
    let a = Args::new(&args);
    let config = config_arg(&a, 0)?;
    let client = lib.data_clusters().builder().build(&config, &ClientOptions::live())?;
    Ok(Value::Json(client.server_version().await?))
}

/// Evaluate `path` (backticks read as single quotes) against `input` and
/// compare its string form with `expect`.
pub(crate) async fn matches_expectation(lib: &FunctionLibrary, input: Json, path: &str, expect: &str) -> Result<bool, FnError> {
    let found = lib.evaluator().evaluate(path, &Value::Json(input), &Bindings::new(), &lib.inner_caller()).await?;
    let found = found.to_display_string();
    debug!(path = %path, found = %found, expect = %expect, "wait: evaluated");
    Ok(found == expect)
}

/// `x_k8s_wait(client, apiVersion?, kind?, namespace?, path?, expect?)`
pub(crate) async fn wait(lib: FunctionLibrary, args: Vec<Value>) -> Result<Value, FnError> {
    let a = Args::new(&args);
    let client = client_arg(&a, 0)?;
    let (api_version, kind, namespace) = (a.opt_string(1)?, a.opt_string(2)?, a.opt_string(3)?);
    let path = a.opt_string(4)?.replace('`', "'");
    let expect = a.opt_string(5)?;
    info!(api_version = %api_version, kind = %kind, namespace = %namespace, path = %path, expect = %expect, "x_k8s_wait");
    let waiter = PollWaiter::new(lib.poll_settings());
    let done = waiter
        .poll_until(|| async {
            let items = list_items(&client, &api_version, &kind, &namespace, "").await?;
            matches_expectation(&lib, list_object(&api_version, &kind, items), &path, &expect).await
        })
        .await?;
    Ok(done.into())
}
