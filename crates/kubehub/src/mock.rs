//! In-memory clients, sources and directories for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use kassert_core::{ClusterError, Gvk, LabelSelector};
use rustc_hash::FxHashMap;
use serde_json::{json, Value as Json};

use crate::client::{object_labels, ClientBuilder, ClientOptions, ClusterClient, SharedClient};
use crate::factory::ClusterDirectory;
use crate::source::ConfigSource;

/// Config whose cluster URL host is `host`; mocks key clients by that host.
pub fn mock_config(host: &str) -> kube::Config {
    let url = format!("https://{host}").parse().unwrap_or_default();
    kube::Config::new(url)
}

fn host_of(config: &kube::Config) -> String {
    config.cluster_url.host().unwrap_or("").to_string()
}

type ObjKey = (String, String, String);

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Object store keyed by `(gvk key, namespace, name)`.
#[derive(Default)]
pub struct MockClusterClient {
    objects: Mutex<BTreeMap<ObjKey, Json>>,
    mappings: Mutex<BTreeSet<String>>,
    namespaces: Mutex<BTreeSet<String>>,
    scripted_lists: Mutex<VecDeque<Result<Vec<Json>, ClusterError>>>,
    failure: Mutex<Option<ClusterError>>,
    version: Mutex<Option<Json>>,
    list_calls: AtomicUsize,
}

impl MockClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `obj` under its apiVersion/kind/namespace/name; its kind becomes mapped.
    pub fn insert(&self, obj: Json) -> &Self {
        let api_version = obj["apiVersion"].as_str().unwrap_or("v1");
        let kind = obj["kind"].as_str().unwrap_or("");
        let key = format!("{api_version}/{kind}");
        let ns = obj.pointer("/metadata/namespace").and_then(Json::as_str).unwrap_or("").to_string();
        let name = obj.pointer("/metadata/name").and_then(Json::as_str).unwrap_or("").to_string();
        lock(&self.mappings).insert(key.clone());
        lock(&self.objects).insert((key, ns, name), obj);
        self
    }

    pub fn map_kind(&self, gvk: &Gvk) -> &Self {
        lock(&self.mappings).insert(gvk.key());
        self
    }

    /// Every operation fails with `err` until cleared.
    pub fn fail_with(&self, err: Option<ClusterError>) -> &Self {
        *lock(&self.failure) = err;
        self
    }

    /// Responses returned by successive `list` calls before falling back to the store.
    pub fn script_lists(&self, responses: Vec<Result<Vec<Json>, ClusterError>>) -> &Self {
        lock(&self.scripted_lists).extend(responses);
        self
    }

    pub fn set_version(&self, version: Json) -> &Self {
        *lock(&self.version) = Some(version);
        self
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn namespaces(&self) -> Vec<String> {
        lock(&self.namespaces).iter().cloned().collect()
    }

    pub fn object(&self, gvk: &Gvk, namespace: &str, name: &str) -> Option<Json> {
        lock(&self.objects).get(&(gvk.key(), namespace.to_string(), name.to_string())).cloned()
    }

    fn check(&self) -> Result<(), ClusterError> {
        match lock(&self.failure).clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn require_mapping(&self, gvk: &Gvk) -> Result<(), ClusterError> {
        if lock(&self.mappings).contains(&gvk.key()) {
            Ok(())
        } else {
            Err(ClusterError::NoMatch { api_version: gvk.api_version(), kind: gvk.kind.clone() })
        }
    }
}

#[async_trait]
impl ClusterClient for MockClusterClient {
    async fn get(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> Result<Json, ClusterError> {
        self.check()?;
        self.require_mapping(gvk)?;
        self.object(gvk, namespace.unwrap_or(""), name).ok_or_else(|| ClusterError::not_found(&gvk.kind, name))
    }

    async fn list(&self, gvk: &Gvk, namespace: Option<&str>, selector: Option<&LabelSelector>) -> Result<Vec<Json>, ClusterError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        if let Some(scripted) = lock(&self.scripted_lists).pop_front() {
            return scripted;
        }
        self.require_mapping(gvk)?;
        let key = gvk.key();
        let ns = namespace.filter(|n| !n.is_empty());
        let items = lock(&self.objects)
            .iter()
            .filter(|((k, n, _), _)| *k == key && ns.map(|want| want == n).unwrap_or(true))
            .filter(|(_, obj)| selector.map(|s| s.matches(&object_labels(obj))).unwrap_or(true))
            .map(|(_, obj)| obj.clone())
            .collect();
        Ok(items)
    }

    async fn patch_merge(&self, gvk: &Gvk, namespace: Option<&str>, name: &str, patch: &Json) -> Result<Json, ClusterError> {
        self.check()?;
        self.require_mapping(gvk)?;
        let key = (gvk.key(), namespace.unwrap_or("").to_string(), name.to_string());
        let mut objects = lock(&self.objects);
        let obj = objects.get_mut(&key).ok_or_else(|| ClusterError::not_found(&gvk.kind, name))?;
        merge_patch(obj, patch);
        Ok(obj.clone())
    }

    async fn create_namespace(&self, name: &str) -> Result<(), ClusterError> {
        self.check()?;
        if !lock(&self.namespaces).insert(name.to_string()) {
            return Err(ClusterError::Api { code: 409, message: format!("namespaces \"{name}\" already exists") });
        }
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        self.check()?;
        if !lock(&self.namespaces).remove(name) {
            return Err(ClusterError::not_found("Namespace", name));
        }
        Ok(())
    }

    async fn has_mapping(&self, gvk: &Gvk) -> Result<bool, ClusterError> {
        self.check()?;
        Ok(lock(&self.mappings).contains(&gvk.key()))
    }

    async fn server_version(&self) -> Result<Json, ClusterError> {
        self.check()?;
        Ok(lock(&self.version).clone().unwrap_or_else(|| json!({"major": "1", "minor": "29", "gitVersion": "v1.29.0"})))
    }
}

/// RFC 7386 JSON merge patch.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    match patch {
        Json::Object(p) => {
            if !target.is_object() {
                *target = Json::Object(Default::default());
            }
            if let Json::Object(t) = target {
                for (k, v) in p {
                    if v.is_null() {
                        t.remove(k);
                    } else {
                        merge_patch(t.entry(k.clone()).or_insert(Json::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// Hands out registered mock clients by config host.
#[derive(Default)]
pub struct MockClientBuilder {
    clients: Mutex<FxHashMap<String, Arc<MockClusterClient>>>,
    failures_left: AtomicUsize,
    builds: AtomicUsize,
}

impl MockClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(self, host: &str, client: Arc<MockClusterClient>) -> Self {
        lock(&self.clients).insert(host.to_string(), client);
        self
    }

    /// The next `n` builds fail.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl ClientBuilder for MockClientBuilder {
    fn build(&self, config: &kube::Config, _options: &ClientOptions) -> Result<SharedClient, ClusterError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(ClusterError::Other("client build failed".into()));
        }
        let host = host_of(config);
        let client = lock(&self.clients).get(&host).cloned();
        client.map(|c| c as SharedClient).ok_or_else(|| ClusterError::Config(format!("no mock client for host {host:?}")))
    }
}

/// Directory serving a fixed, replaceable set of cluster configs.
#[derive(Default)]
pub struct StaticDirectory {
    clusters: Mutex<FxHashMap<String, kube::Config>>,
    calls: AtomicUsize,
}

impl StaticDirectory {
    /// One config per name, each pointing at host `name`.
    pub fn with_clusters(names: &[&str]) -> Self {
        let map = names.iter().map(|n| (n.to_string(), mock_config(n))).collect();
        Self { clusters: Mutex::new(map), calls: AtomicUsize::new(0) }
    }

    pub fn set(&self, name: &str, config: kube::Config) {
        lock(&self.clusters).insert(name.to_string(), config);
    }

    pub fn remove(&self, name: &str) {
        lock(&self.clusters).remove(name);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterDirectory for StaticDirectory {
    async fn discover(&self, _control: &kube::Config) -> Result<FxHashMap<String, kube::Config>, ClusterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.clusters).clone())
    }
}

/// Config source that counts resolutions, optionally slow or failing first.
pub struct CountingSource {
    host: String,
    delay: Duration,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl CountingSource {
    pub fn new(host: &str) -> Self {
        Self { host: host.to_string(), delay: Duration::ZERO, failures_left: AtomicUsize::new(0), calls: AtomicUsize::new(0) }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_first(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigSource for CountingSource {
    async fn resolve(&self) -> Result<kube::Config, ClusterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(ClusterError::Config(format!("{} unavailable", self.host)));
        }
        Ok(mock_config(&self.host))
    }

    fn describe(&self) -> String {
        format!("counting {}", self.host)
    }
}
