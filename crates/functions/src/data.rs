//! Fan-out over data clusters reachable through the control cluster.
//!
//! Every function takes the control cluster's config first and a
//! comma-separated cluster list second; the factory is started on first use.

use std::sync::Arc;

use kassert_core::{Args, FnError, Gvk, Value};
use kassert_kubehub::SharedClient;
use kassert_ops::PollWaiter;
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

use crate::fanout::{per_cluster, per_index, split_clusters};
use crate::k8s::{list_items, list_object, matches_expectation};
use crate::{client_arg, client_value, config_arg, FunctionLibrary};

struct Target {
    clusters: Vec<String>,
    api_version: String,
    kind: String,
    namespace: String,
    selector: String,
}

impl Target {
    fn parse(a: &Args<'_>) -> Result<Self, FnError> {
        Ok(Self {
            clusters: split_clusters(&a.string(1)?),
            api_version: a.string(2)?,
            kind: a.string(3)?,
            namespace: a.opt_string(4)?,
            selector: a.opt_string(5)?,
        })
    }
}

async fn started(lib: &FunctionLibrary, a: &Args<'_>) -> Result<(), FnError> {
    let config = config_arg(a, 0)?;
    lib.data_clusters().start(&config).await;
    Ok(())
}

fn cached_client(lib: &FunctionLibrary, cluster: &str, api_version: &str, kind: &str) -> Result<SharedClient, FnError> {
    lib.data_clusters().get_client(cluster).ok_or_else(|| FnError::ClientNotFound {
        cluster: cluster.to_string(),
        api_version: api_version.to_string(),
        kind: kind.to_string(),
    })
}

/// Create a cached client per cluster, retrying until the wait deadline.
pub(crate) async fn init(lib: FunctionLibrary, args: Vec<Value>) -> Result<Value, FnError> {
    let a = Args::new(&args);
    started(&lib, &a).await?;
    let raw = a.string(1)?;
    let target = Target::parse(&a)?;
    info!(clusters = %raw, api_version = %target.api_version, kind = %target.kind, "x_data_cluster_init");
    let factory = lib.data_clusters().clone();
    let waiter = PollWaiter::new(lib.poll_settings());
    per_cluster("x_data_cluster_init", &target.clusters, move |cluster| {
        let factory = factory.clone();
        async move {
            let mut last = None;
            let ready = waiter
                .poll_until(|| {
                    let outcome = factory.create_client(&cluster);
                    let ok = match outcome {
                        Ok(_) => true,
                        Err(e) => {
                            debug!(cluster = %cluster, error = %e, "data cluster client not ready");
                            last = Some(e);
                            false
                        }
                    };
                    async move { Ok::<bool, FnError>(ok) }
                })
                .await?;
            match (ready, last) {
                (true, _) => Ok(()),
                (false, Some(e)) => Err(FnError::in_cluster(cluster, e.into())),
                (false, None) => Err(FnError::in_cluster(cluster, FnError::Aggregate("client not ready".into()))),
            }
        }
    })
    .await?;
    Ok(Value::string(raw))
}

pub(crate) async fn clean(lib: FunctionLibrary, args: Vec<Value>) -> Result<Value, FnError> {
    let a = Args::new(&args);
    started(&lib, &a).await?;
    let raw = a.string(1)?;
    let target = Target::parse(&a)?;
    let factory = lib.data_clusters().clone();
    per_cluster("x_data_cluster_clean", &target.clusters, move |cluster| {
        let factory = factory.clone();
        async move {
            factory.destroy_client(&cluster);
            Ok::<(), FnError>(())
        }
    })
    .await?;
    Ok(Value::string(raw))
}

/// Items of every cluster, concatenated in cluster-list order. A cluster
/// answering not-found contributes nothing.
async fn collect(lib: &FunctionLibrary, target: &Target) -> Result<Vec<Json>, FnError> {
    let t0 = std::time::Instant::now();
    let lib2 = lib.clone();
    let (api_version, kind, namespace, selector) =
        (target.api_version.clone(), target.kind.clone(), target.namespace.clone(), target.selector.clone());
    let per = per_cluster("x_data_cluster_list", &target.clusters, move |cluster| {
        let lib = lib2.clone();
        let (api_version, kind, namespace, selector) = (api_version.clone(), kind.clone(), namespace.clone(), selector.clone());
        async move {
            let client = cached_client(&lib, &cluster, &api_version, &kind)?;
            match list_items(&client, &api_version, &kind, &namespace, &selector).await {
                Ok(items) => Ok(items),
                Err(e) if e.is_not_found() => {
                    debug!(cluster = %cluster, "data cluster list: not found");
                    Ok(Vec::new())
                }
                Err(e) => Err(FnError::in_cluster(cluster, e.into())),
            }
        }
    })
    .await?;
    let items: Vec<Json> = per.into_iter().flatten().collect();
    info!(clusters = target.clusters.len(), items = items.len(), took_ms = %t0.elapsed().as_millis(), "x_data_cluster_list");
    Ok(items)
}

pub(crate) async fn list(lib: FunctionLibrary, args: Vec<Value>) -> Result<Value, FnError> {
    let a = Args::new(&args);
    started(&lib, &a).await?;
    let target = Target::parse(&a)?;
    let items = collect(&lib, &target).await?;
    Ok(Value::Json(list_object(&target.api_version, &target.kind, items)))
}

/// List per cluster, then merge-patch every matched item.
pub(crate) async fn patch(lib: FunctionLibrary, args: Vec<Value>) -> Result<Value, FnError> {
    let a = Args::new(&args);
    started(&lib, &a).await?;
    let target = Target::parse(&a)?;
    let raw_patch = a.opt_string(6)?;
    let body: Json = if raw_patch.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(&raw_patch).map_err(|e| FnError::eval(&raw_patch, format!("invalid merge patch: {e}")))?
    };
    let body = Arc::new(body);
    let gvk = Gvk::from_api_version(&target.api_version, &target.kind)?;
    let (lib2, api_version, kind, namespace, selector) =
        (lib.clone(), target.api_version.clone(), target.kind.clone(), target.namespace.clone(), target.selector.clone());
    per_cluster("x_data_cluster_patch", &target.clusters, move |cluster| {
        let lib = lib2.clone();
        let body = body.clone();
        let gvk = gvk.clone();
        let (api_version, kind, namespace, selector) = (api_version.clone(), kind.clone(), namespace.clone(), selector.clone());
        async move {
            let client = cached_client(&lib, &cluster, &api_version, &kind)?;
            let items = match list_items(&client, &api_version, &kind, &namespace, &selector).await {
                Ok(items) => items,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(FnError::in_cluster(cluster, e.into())),
            };
            debug!(cluster = %cluster, items = items.len(), "data cluster patch");
            per_index("data_cluster_patch_item", items, move |item: Json| {
                let client = client.clone();
                let body = body.clone();
                let gvk = gvk.clone();
                async move {
                    let meta = &item["metadata"];
                    let ns = meta["namespace"].as_str().filter(|s| !s.is_empty());
                    let name = meta["name"].as_str().unwrap_or_default();
                    client.patch_merge(&gvk, ns, name, &body).await?;
                    Ok::<(), FnError>(())
                }
            })
            .await
            .map_err(|e| FnError::in_cluster(cluster, e))?;
            Ok(())
        }
    })
    .await?;
    Ok(Value::null())
}

/// `[name, version, name, version, ...]` in cluster-list order.
pub(crate) async fn server_version(lib: FunctionLibrary, args: Vec<Value>) -> Result<Value, FnError> {
    let a = Args::new(&args);
    started(&lib, &a).await?;
    let clusters = split_clusters(&a.string(1)?);
    let factory = lib.data_clusters().clone();
    let versions = per_cluster("x_data_cluster_server_version", &clusters, move |cluster| {
        let factory = factory.clone();
        async move {
            let client = factory.direct_client(&cluster)?;
            match client.server_version().await {
                Ok(v) => Ok((cluster, v)),
                Err(e) => {
                    warn!(cluster = %cluster, error = %e, "server version failed");
                    Err(FnError::from(e))
                }
            }
        }
    })
    .await?;
    let flat: Vec<Json> = versions.into_iter().flat_map(|(name, v)| [Json::String(name), v]).collect();
    Ok(Value::Json(Json::Array(flat)))
}

pub(crate) async fn create_namespace(lib: FunctionLibrary, args: Vec<Value>) -> Result<Value, FnError> {
    let a = Args::new(&args);
    started(&lib, &a).await?;
    let raw = a.string(1)?;
    let namespace = a.string(2)?;
    let factory = lib.data_clusters().clone();
    per_cluster("x_data_cluster_create_namespace", &split_clusters(&raw), move |cluster| {
        let factory = factory.clone();
        let namespace = namespace.clone();
        async move {
            let client = factory.direct_client(&cluster)?;
            client.create_namespace(&namespace).await.map_err(|e| FnError::in_cluster(cluster, e.into()))
        }
    })
    .await?;
    Ok(Value::string(raw))
}

pub(crate) async fn delete_namespace(lib: FunctionLibrary, args: Vec<Value>) -> Result<Value, FnError> {
    let a = Args::new(&args);
    started(&lib, &a).await?;
    let namespace = a.string(2)?;
    let factory = lib.data_clusters().clone();
    per_cluster("x_data_cluster_delete_namespace", &split_clusters(&a.string(1)?), move |cluster| {
        let factory = factory.clone();
        let namespace = namespace.clone();
        async move {
            let client = factory.direct_client(&cluster)?;
            client.delete_namespace(&namespace).await.map_err(|e| FnError::delete_in_cluster(cluster, e.into()))
        }
    })
    .await?;
    Ok(Value::null())
}

/// `x_data_k8s_client(config, cluster, apiVersion, kind)`
pub(crate) async fn client(lib: FunctionLibrary, args: Vec<Value>) -> Result<Value, FnError> {
    let a = Args::new(&args);
    started(&lib, &a).await?;
    let cluster = a.string(1)?;
    let client = cached_client(&lib, cluster.trim(), &a.string(2)?, &a.string(3)?)?;
    Ok(client_value(client))
}

/// `x_data_k8s_list(client, apiVersion, kind, namespace?, selector?)`
pub(crate) async fn client_list(args: Vec<Value>) -> Result<Value, FnError> {
    let a = Args::new(&args);
    let client = client_arg(&a, 0)?;
    let (api_version, kind) = (a.string(1)?, a.string(2)?);
    let items = list_items(&client, &api_version, &kind, &a.opt_string(3)?, &a.opt_string(4)?).await?;
    Ok(Value::Json(list_object(&api_version, &kind, items)))
}

/// `x_data_cluster_wait(config, clusters, apiVersion, kind, namespace, selector, path, expect)`
pub(crate) async fn wait(lib: FunctionLibrary, args: Vec<Value>) -> Result<Value, FnError> {
    let a = Args::new(&args);
    started(&lib, &a).await?;
    let target = Target::parse(&a)?;
    let path = a.opt_string(6)?.replace('`', "'");
    let expect = a.opt_string(7)?;
    info!(clusters = target.clusters.len(), kind = %target.kind, path = %path, expect = %expect, "x_data_cluster_wait");
    let waiter = PollWaiter::new(lib.poll_settings());
    let done = waiter
        .poll_until(|| async {
            let items = collect(&lib, &target).await?;
            matches_expectation(&lib, list_object(&target.api_version, &target.kind, items), &path, &expect).await
        })
        .await?;
    Ok(done.into())
}
