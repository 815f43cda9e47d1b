//! Dynamic cluster client over kube-rs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kassert_core::{ClusterError, Gvk, LabelSelector};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
    discovery::{Discovery, Scope},
    Client,
};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::time::Instant;
use tracing::debug;

use crate::scheme::Scheme;

/// Object-level operations the function library needs from a cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> Result<Json, ClusterError>;
    /// `None` selector lists everything.
    async fn list(&self, gvk: &Gvk, namespace: Option<&str>, selector: Option<&LabelSelector>) -> Result<Vec<Json>, ClusterError>;
    async fn patch_merge(&self, gvk: &Gvk, namespace: Option<&str>, name: &str, patch: &Json) -> Result<Json, ClusterError>;
    async fn create_namespace(&self, name: &str) -> Result<(), ClusterError>;
    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError>;
    /// `Ok(false)` when the server has no REST mapping for `gvk`.
    async fn has_mapping(&self, gvk: &Gvk) -> Result<bool, ClusterError>;
    async fn server_version(&self) -> Result<Json, ClusterError>;
}

impl std::fmt::Debug for dyn ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClusterClient")
    }
}

pub type SharedClient = Arc<dyn ClusterClient>;

/// Client construction knobs.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Serve repeated `get`s from memory for this long. `None` disables the cache.
    pub read_cache_ttl: Option<Duration>,
    /// Kinds always read from the API server.
    pub live_kinds: Vec<Gvk>,
}

impl ClientOptions {
    pub fn live() -> Self {
        Self::default()
    }

    /// Read cache enabled, but ConfigMaps and Secrets always fetched live.
    pub fn sensitive(read_cache_ttl: Duration) -> Self {
        let core = |kind: &str| Gvk { group: String::new(), version: "v1".into(), kind: kind.into() };
        Self { read_cache_ttl: Some(read_cache_ttl), live_kinds: vec![core("ConfigMap"), core("Secret")] }
    }

    pub fn caches(&self, gvk: &Gvk) -> bool {
        self.read_cache_ttl.is_some() && !self.live_kinds.iter().any(|k| k.group == gvk.group && k.kind == gvk.kind)
    }
}

/// Builds clients from connection configs.
pub trait ClientBuilder: Send + Sync {
    fn build(&self, config: &kube::Config, options: &ClientOptions) -> Result<SharedClient, ClusterError>;
}

#[derive(Debug, Clone)]
pub struct KubeClientBuilder {
    scheme: Arc<Scheme>,
}

impl KubeClientBuilder {
    pub fn new(scheme: Arc<Scheme>) -> Self {
        Self { scheme }
    }
}

impl Default for KubeClientBuilder {
    fn default() -> Self {
        Self::new(Arc::new(Scheme::default_scheme()))
    }
}

impl ClientBuilder for KubeClientBuilder {
    fn build(&self, config: &kube::Config, options: &ClientOptions) -> Result<SharedClient, ClusterError> {
        let client = Client::try_from(config.clone()).map_err(|e| ClusterError::Config(e.to_string()))?;
        Ok(Arc::new(KubeClusterClient::new(client, self.scheme.clone(), options.clone())))
    }
}

type CacheKey = (Gvk, String, String);

pub struct KubeClusterClient {
    client: Client,
    scheme: Arc<Scheme>,
    options: ClientOptions,
    mappings: Mutex<FxHashMap<Gvk, (ApiResource, bool)>>,
    reads: Mutex<FxHashMap<CacheKey, (Instant, Json)>>,
}

impl KubeClusterClient {
    pub fn new(client: Client, scheme: Arc<Scheme>, options: ClientOptions) -> Self {
        Self { client, scheme, options, mappings: Mutex::new(FxHashMap::default()), reads: Mutex::new(FxHashMap::default()) }
    }

    /// Scheme first, then discovery of the kind's group. Hits are remembered
    /// only for group-versions bound in the scheme; other groups (CRDs a test
    /// may install or remove) are discovered on every call.
    async fn resolve(&self, gvk: &Gvk) -> Result<Option<(ApiResource, bool)>, ClusterError> {
        if let Some(found) = self.scheme.lookup(gvk) {
            return Ok(Some(found));
        }
        if let Some(known) = self.known_mapping(gvk) {
            return Ok(Some(known));
        }
        let groups = [gvk.group.as_str()];
        let discovery = Discovery::new(self.client.clone()).filter(&groups).run().await.map_err(map_kube_err)?;
        let key = GroupVersionKind { group: gvk.group.clone(), version: gvk.version.clone(), kind: gvk.kind.clone() };
        let Some((ar, caps)) = discovery.resolve_gvk(&key) else {
            debug!(gvk = %gvk, "no rest mapping");
            return Ok(None);
        };
        let found = (ar, matches!(caps.scope, Scope::Namespaced));
        self.remember_mapping(gvk, &found);
        Ok(Some(found))
    }

    fn known_mapping(&self, gvk: &Gvk) -> Option<(ApiResource, bool)> {
        self.mappings.lock().unwrap_or_else(PoisonError::into_inner).get(gvk).cloned()
    }

    fn remember_mapping(&self, gvk: &Gvk, found: &(ApiResource, bool)) {
        if self.scheme.recognizes(gvk) {
            self.mappings.lock().unwrap_or_else(PoisonError::into_inner).insert(gvk.clone(), found.clone());
        }
    }

    async fn api(&self, gvk: &Gvk, namespace: Option<&str>) -> Result<Api<DynamicObject>, ClusterError> {
        let (ar, namespaced) = self
            .resolve(gvk)
            .await?
            .ok_or_else(|| ClusterError::NoMatch { api_version: gvk.api_version(), kind: gvk.kind.clone() })?;
        Ok(match namespace.filter(|ns| namespaced && !ns.is_empty()) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        })
    }

    /// Fresh cached read, if any. An expired entry is dropped on the way.
    fn cached(&self, key: &CacheKey) -> Option<Json> {
        let ttl = self.options.read_cache_ttl?;
        let mut reads = self.reads.lock().unwrap_or_else(PoisonError::into_inner);
        match reads.get(key) {
            Some((at, v)) if at.elapsed() < ttl => Some(v.clone()),
            Some(_) => {
                reads.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a read and sweep every entry that outlived the TTL.
    fn store_read(&self, key: CacheKey, value: Json) {
        let Some(ttl) = self.options.read_cache_ttl else { return };
        let mut reads = self.reads.lock().unwrap_or_else(PoisonError::into_inner);
        reads.retain(|_, (at, _)| at.elapsed() < ttl);
        reads.insert(key, (Instant::now(), value));
    }

    #[cfg(test)]
    fn cached_reads(&self) -> usize {
        self.reads.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> Result<Json, ClusterError> {
        let key: CacheKey = (gvk.clone(), namespace.unwrap_or("").to_string(), name.to_string());
        let caches = self.options.caches(gvk);
        if caches {
            if let Some(hit) = self.cached(&key) {
                return Ok(hit);
            }
        }
        let api = self.api(gvk, namespace).await?;
        let obj = api.get(name).await.map_err(|e| match e {
            kube::Error::Api(resp) if resp.code == 404 => ClusterError::not_found(&gvk.kind, name),
            other => map_kube_err(other),
        })?;
        let value = to_json(obj, gvk)?;
        if caches {
            self.store_read(key, value.clone());
        }
        Ok(value)
    }

    async fn list(&self, gvk: &Gvk, namespace: Option<&str>, selector: Option<&LabelSelector>) -> Result<Vec<Json>, ClusterError> {
        let api = self.api(gvk, namespace).await?;
        let mut lp = ListParams::default();
        if let Some(sel) = selector.filter(|s| !s.is_everything()) {
            lp = lp.labels(&sel.to_query_string());
        }
        let list = api.list(&lp).await.map_err(map_kube_err)?;
        list.items.into_iter().map(|o| to_json(o, gvk)).collect()
    }

    async fn patch_merge(&self, gvk: &Gvk, namespace: Option<&str>, name: &str, patch: &Json) -> Result<Json, ClusterError> {
        let api = self.api(gvk, namespace).await?;
        let obj = api.patch(name, &PatchParams::default(), &Patch::Merge(patch)).await.map_err(map_kube_err)?;
        let key: CacheKey = (gvk.clone(), namespace.unwrap_or("").to_string(), name.to_string());
        self.reads.lock().unwrap_or_else(PoisonError::into_inner).remove(&key);
        to_json(obj, gvk)
    }

    async fn create_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace { metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() }, ..Default::default() };
        api.create(&PostParams::default(), &ns).await.map_err(map_kube_err)?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default()).await.map_err(|e| match e {
            kube::Error::Api(resp) if resp.code == 404 => ClusterError::not_found("Namespace", name),
            other => map_kube_err(other),
        })?;
        Ok(())
    }

    async fn has_mapping(&self, gvk: &Gvk) -> Result<bool, ClusterError> {
        Ok(self.resolve(gvk).await?.is_some())
    }

    async fn server_version(&self) -> Result<Json, ClusterError> {
        let info = self.client.apiserver_version().await.map_err(map_kube_err)?;
        serde_json::to_value(info).map_err(|e| ClusterError::Other(e.to_string()))
    }
}

pub(crate) fn map_kube_err(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(resp) => ClusterError::Api { code: resp.code, message: resp.message },
        other => ClusterError::Other(other.to_string()),
    }
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// List items come back without type meta; fill it from the request.
fn to_json(mut obj: DynamicObject, gvk: &Gvk) -> Result<Json, ClusterError> {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: gvk.api_version(), kind: gvk.kind.clone() });
    }
    let mut raw = serde_json::to_value(&obj).map_err(|e| ClusterError::Other(e.to_string()))?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

/// Labels of a raw object, for client-side selector matching.
pub fn object_labels(obj: &Json) -> BTreeMap<String, String> {
    obj.pointer("/metadata/labels")
        .and_then(|l| l.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}
