//! Where lazily-resolved handles get their connection config.

use std::path::PathBuf;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kassert_core::ClusterError;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use tracing::info;

use crate::client::map_kube_err;

/// Virtual-cluster kubeconfig secrets are named `<prefix><cluster>`.
pub const VCLUSTER_SECRET_PREFIX: &str = "vc-";
/// Data key holding the kubeconfig inside such a secret.
pub const KUBECONFIG_SECRET_KEY: &str = "config";

#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn resolve(&self) -> Result<Config, ClusterError>;
    fn describe(&self) -> String;
}

/// Kubeconfig file plus optional context name.
#[derive(Debug, Clone)]
pub struct KubeconfigSource {
    pub path: PathBuf,
    pub context: Option<String>,
}

impl KubeconfigSource {
    pub fn new(path: impl Into<PathBuf>, context: &str) -> Self {
        let context = if context.is_empty() { None } else { Some(context.to_string()) };
        Self { path: path.into(), context }
    }
}

#[async_trait]
impl ConfigSource for KubeconfigSource {
    async fn resolve(&self) -> Result<Config, ClusterError> {
        let kubeconfig = Kubeconfig::read_from(&self.path)
            .map_err(|e| ClusterError::Config(format!("reading {}: {e}", self.path.display())))?;
        let options = KubeConfigOptions { context: self.context.clone(), ..Default::default() };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| ClusterError::Config(format!("{}: {e}", self.path.display())))?;
        info!(path = %self.path.display(), context = ?self.context, "kubeconfig resolved");
        Ok(config)
    }

    fn describe(&self) -> String {
        match &self.context {
            Some(ctx) => format!("kubeconfig {} ({ctx})", self.path.display()),
            None => format!("kubeconfig {}", self.path.display()),
        }
    }
}

/// Virtual cluster kubeconfig stored in a secret of the host cluster.
#[derive(Debug, Clone)]
pub struct SecretConfigSource {
    pub cluster: String,
    pub namespace: String,
    /// Host cluster config; inferred from the environment when absent.
    pub host: Option<Config>,
}

impl SecretConfigSource {
    pub fn new(cluster: impl Into<String>, namespace: impl Into<String>, host: Option<Config>) -> Self {
        Self { cluster: cluster.into(), namespace: namespace.into(), host }
    }

    pub fn secret_name(&self) -> String {
        format!("{VCLUSTER_SECRET_PREFIX}{}", self.cluster)
    }
}

#[async_trait]
impl ConfigSource for SecretConfigSource {
    async fn resolve(&self) -> Result<Config, ClusterError> {
        let host = match &self.host {
            Some(c) => c.clone(),
            None => Config::infer().await.map_err(|e| ClusterError::Config(e.to_string()))?,
        };
        let client = Client::try_from(host).map_err(|e| ClusterError::Config(e.to_string()))?;
        let secrets: Api<Secret> = Api::namespaced(client, &self.namespace);
        let name = self.secret_name();
        let secret = secrets.get(&name).await.map_err(|e| match e {
            kube::Error::Api(resp) if resp.code == 404 => ClusterError::not_found("Secret", format!("{}/{}", self.namespace, name)),
            other => map_kube_err(other),
        })?;
        let bytes = secret_kubeconfig(&secret)
            .ok_or_else(|| ClusterError::Config(format!("secret {}/{} has no {KUBECONFIG_SECRET_KEY:?} key", self.namespace, name)))?;
        let config = config_from_kubeconfig_bytes(&bytes).await?;
        info!(cluster = %self.cluster, namespace = %self.namespace, "vcluster config resolved");
        Ok(config)
    }

    fn describe(&self) -> String {
        format!("vcluster {}/{}", self.namespace, self.cluster)
    }
}

pub(crate) fn secret_kubeconfig(secret: &Secret) -> Option<Vec<u8>> {
    if let Some(v) = secret.data.as_ref().and_then(|d| d.get(KUBECONFIG_SECRET_KEY)) {
        return Some(v.0.clone());
    }
    secret.string_data.as_ref().and_then(|d| d.get(KUBECONFIG_SECRET_KEY)).map(|s| s.as_bytes().to_vec())
}

/// Parse kubeconfig YAML and build a config from its current context.
pub async fn config_from_kubeconfig_bytes(bytes: &[u8]) -> Result<Config, ClusterError> {
    let text = std::str::from_utf8(bytes).map_err(|e| ClusterError::Config(format!("invalid kubeconfig UTF-8: {e}")))?;
    let kubeconfig: Kubeconfig = serde_yaml::from_str(text).map_err(|e| ClusterError::Config(format!("invalid kubeconfig YAML: {e}")))?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| ClusterError::Config(format!("failed to build config: {e}")))
}
