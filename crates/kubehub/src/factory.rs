//! Data-cluster client factory.
//!
//! One instance per process, shared through `Arc`. It has to be started with
//! the control cluster's config before any data-cluster handle resolves;
//! `start` spawns the refresh loop and returns after the first refresh or the
//! warm-up interval, whichever comes first. `shutdown` (or drop) stops the loop.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kassert_core::ClusterError;
use kassert_ops::CancelHandle;
use kube::{
    api::{Api, ListParams},
    Client,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{map_kube_err, ClientBuilder, ClientOptions, SharedClient};
use crate::source::{config_from_kubeconfig_bytes, secret_kubeconfig};

/// Label marking data-cluster kubeconfig secrets; its value names the cluster.
pub const DATA_CLUSTER_LABEL: &str = "kassert.dev/data-cluster";

/// Lists the data clusters reachable from a control cluster.
#[async_trait]
pub trait ClusterDirectory: Send + Sync {
    async fn discover(&self, control: &kube::Config) -> Result<FxHashMap<String, kube::Config>, ClusterError>;
}

/// Kubeconfig secrets labelled [`DATA_CLUSTER_LABEL`] in one namespace of the control cluster.
#[derive(Debug, Clone)]
pub struct SecretDirectory {
    pub namespace: String,
}

#[async_trait]
impl ClusterDirectory for SecretDirectory {
    async fn discover(&self, control: &kube::Config) -> Result<FxHashMap<String, kube::Config>, ClusterError> {
        let client = Client::try_from(control.clone()).map_err(|e| ClusterError::Config(e.to_string()))?;
        let secrets: Api<Secret> = Api::namespaced(client, &self.namespace);
        let list = secrets.list(&ListParams::default().labels(DATA_CLUSTER_LABEL)).await.map_err(map_kube_err)?;
        let mut out = FxHashMap::default();
        for secret in list.items {
            let secret_name = secret.metadata.name.clone().unwrap_or_default();
            let cluster = secret
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(DATA_CLUSTER_LABEL))
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or_else(|| secret_name.clone());
            let Some(bytes) = secret_kubeconfig(&secret) else {
                warn!(secret = %secret_name, "data cluster secret without kubeconfig");
                continue;
            };
            match config_from_kubeconfig_bytes(&bytes).await {
                Ok(config) => {
                    out.insert(cluster, config);
                }
                Err(e) => warn!(secret = %secret_name, error = %e, "data cluster kubeconfig rejected"),
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct FactorySettings {
    pub namespace: String,
    pub warmup: Duration,
    pub refresh: Duration,
    pub read_cache_ttl: Duration,
}

impl Default for FactorySettings {
    fn default() -> Self {
        Self {
            namespace: "kassert-system".into(),
            warmup: Duration::from_secs(5),
            refresh: Duration::from_secs(30),
            read_cache_ttl: Duration::from_millis(2000),
        }
    }
}

impl FactorySettings {
    pub fn from_env() -> Self {
        let d = Self::default();
        let secs = |key: &str, default: Duration| {
            std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(default)
        };
        Self {
            namespace: std::env::var("KASSERT_DATA_CLUSTER_NAMESPACE").unwrap_or(d.namespace),
            warmup: secs("KASSERT_DATA_CLUSTER_WARMUP_SECS", d.warmup),
            refresh: secs("KASSERT_DATA_CLUSTER_REFRESH_SECS", d.refresh),
            read_cache_ttl: std::env::var("KASSERT_READ_CACHE_TTL_MS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(d.read_cache_ttl),
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions::sensitive(self.read_cache_ttl)
    }
}

type ConfigMap = FxHashMap<String, kube::Config>;
type ClientMap = FxHashMap<String, SharedClient>;

pub struct DataClusterFactory {
    directory: Arc<dyn ClusterDirectory>,
    builder: Arc<dyn ClientBuilder>,
    settings: FactorySettings,
    configs: Arc<ArcSwap<ConfigMap>>,
    clients: Arc<Mutex<ClientMap>>,
    started: OnceCell<()>,
    refresher: Mutex<Option<(CancelHandle, JoinHandle<()>)>>,
}

impl DataClusterFactory {
    pub fn new(directory: Arc<dyn ClusterDirectory>, builder: Arc<dyn ClientBuilder>, settings: FactorySettings) -> Self {
        Self {
            directory,
            builder,
            settings,
            configs: Arc::new(ArcSwap::from_pointee(ConfigMap::default())),
            clients: Arc::new(Mutex::new(ClientMap::default())),
            started: OnceCell::new(),
            refresher: Mutex::new(None),
        }
    }

    /// Secret-backed directory configured from the environment.
    pub fn from_env(builder: Arc<dyn ClientBuilder>) -> Self {
        let settings = FactorySettings::from_env();
        let directory = Arc::new(SecretDirectory { namespace: settings.namespace.clone() });
        Self::new(directory, builder, settings)
    }

    pub fn settings(&self) -> &FactorySettings {
        &self.settings
    }

    pub fn is_started(&self) -> bool {
        self.started.initialized()
    }

    /// Start the refresh loop once. Every caller waits until the first
    /// refresh finished or the warm-up elapsed.
    pub async fn start(&self, control: &kube::Config) {
        self.started
            .get_or_init(|| async {
                let (cancel, cancel_rx) = CancelHandle::new();
                let (ready_tx, ready_rx) = oneshot::channel::<()>();
                let task = tokio::spawn(refresh_loop(
                    self.directory.clone(),
                    control.clone(),
                    self.configs.clone(),
                    self.clients.clone(),
                    self.settings.refresh,
                    cancel_rx,
                    ready_tx,
                ));
                *self.refresher.lock().unwrap_or_else(PoisonError::into_inner) = Some((cancel, task));
                let t0 = std::time::Instant::now();
                match tokio::time::timeout(self.settings.warmup, ready_rx).await {
                    Ok(_) => info!(clusters = self.configs.load().len(), took_ms = %t0.elapsed().as_millis(), "data cluster factory: ready"),
                    Err(_) => info!(warmup_ms = %self.settings.warmup.as_millis(), "data cluster factory: warm-up elapsed before first refresh"),
                }
            })
            .await;
    }

    /// One synchronous refresh, outside the loop.
    pub async fn refresh_once(&self, control: &kube::Config) -> Result<usize, ClusterError> {
        let found = self.directory.discover(control).await?;
        let n = found.len();
        publish(&self.configs, &self.clients, found);
        Ok(n)
    }

    pub fn rest_config(&self, cluster: &str) -> Option<kube::Config> {
        self.configs.load().get(cluster).cloned()
    }

    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.load().keys().cloned().collect();
        names.sort();
        names
    }

    /// Cached client for `cluster`, built on first use.
    pub fn create_client(&self, cluster: &str) -> Result<SharedClient, ClusterError> {
        if let Some(c) = self.get_client(cluster) {
            return Ok(c);
        }
        let config = self.rest_config(cluster).ok_or_else(|| ClusterError::NotCached(cluster.to_string()))?;
        let client = self.builder.build(&config, &self.settings.client_options())?;
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let client = clients.entry(cluster.to_string()).or_insert(client).clone();
        debug!(cluster = %cluster, "data cluster client created");
        Ok(client)
    }

    pub fn get_client(&self, cluster: &str) -> Option<SharedClient> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).get(cluster).cloned()
    }

    /// Drop the cached client; `false` when none was cached.
    pub fn destroy_client(&self, cluster: &str) -> bool {
        let removed = self.clients.lock().unwrap_or_else(PoisonError::into_inner).remove(cluster).is_some();
        debug!(cluster = %cluster, removed, "data cluster client destroyed");
        removed
    }

    /// Build a fresh, uncached client straight from the cluster's config.
    pub fn direct_client(&self, cluster: &str) -> Result<SharedClient, ClusterError> {
        let config = self.rest_config(cluster).ok_or_else(|| ClusterError::NotCached(cluster.to_string()))?;
        self.builder.build(&config, &ClientOptions::live())
    }

    pub fn builder(&self) -> Arc<dyn ClientBuilder> {
        self.builder.clone()
    }

    /// Stop the refresh loop and forget cached clients.
    pub fn shutdown(&self) {
        if let Some((cancel, _task)) = self.refresher.lock().unwrap_or_else(PoisonError::into_inner).take() {
            cancel.cancel();
            info!("data cluster factory: shut down");
        }
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Drop for DataClusterFactory {
    fn drop(&mut self) {
        if let Some((_, task)) = self.refresher.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

/// Swap in a new config map. Cached clients of clusters that disappeared or
/// now point elsewhere are dropped so the next `create_client` rebuilds them.
fn publish(configs: &ArcSwap<ConfigMap>, clients: &Mutex<ClientMap>, found: ConfigMap) {
    let found = Arc::new(found);
    let old = configs.swap(found.clone());
    counter!("data_cluster_refresh_total", 1u64);
    let mut clients = clients.lock().unwrap_or_else(PoisonError::into_inner);
    clients.retain(|name, _| {
        let keep = matches!((old.get(name), found.get(name)), (Some(o), Some(n)) if same_endpoint(o, n));
        if !keep {
            debug!(cluster = %name, "data cluster config changed; cached client dropped");
        }
        keep
    });
}

fn same_endpoint(a: &kube::Config, b: &kube::Config) -> bool {
    a.cluster_url == b.cluster_url
        && a.root_cert == b.root_cert
        && a.accept_invalid_certs == b.accept_invalid_certs
        && serde_json::to_value(&a.auth_info).ok() == serde_json::to_value(&b.auth_info).ok()
}

async fn refresh_loop(
    directory: Arc<dyn ClusterDirectory>,
    control: kube::Config,
    configs: Arc<ArcSwap<ConfigMap>>,
    clients: Arc<Mutex<ClientMap>>,
    every: Duration,
    mut cancel_rx: oneshot::Receiver<()>,
    ready_tx: oneshot::Sender<()>,
) {
    let mut ready = Some(ready_tx);
    loop {
        match directory.discover(&control).await {
            Ok(found) => {
                debug!(clusters = found.len(), "data cluster refresh");
                publish(&configs, &clients, found);
            }
            Err(e) => warn!(error = %e, "data cluster refresh failed"),
        }
        if let Some(tx) = ready.take() {
            let _ = tx.send(());
        }
        tokio::select! {
            _ = &mut cancel_rx => break,
            _ = tokio::time::sleep(every) => {}
        }
    }
    debug!("data cluster refresh loop stopped");
}
