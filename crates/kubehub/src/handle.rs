//! Cluster handles: lazily resolved connection config + client.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use kassert_core::ClusterError;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::client::{ClientBuilder, ClientOptions, SharedClient};
use crate::factory::DataClusterFactory;
use crate::source::ConfigSource;

/// A resolved connection: config plus a client bound to it.
#[derive(Clone)]
pub struct Connection {
    pub config: kube::Config,
    pub client: SharedClient,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("cluster_url", &self.config.cluster_url).finish()
    }
}

/// Resolve-once state shared by the kubeconfig and virtual-cluster variants.
///
/// Failed resolutions leave the cells empty so the next call retries;
/// concurrent first calls wait on a single resolution.
pub struct Lazy {
    source: Arc<dyn ConfigSource>,
    builder: Arc<dyn ClientBuilder>,
    options: ClientOptions,
    config: OnceCell<kube::Config>,
    client: OnceCell<SharedClient>,
}

impl Lazy {
    pub fn new(source: Arc<dyn ConfigSource>, builder: Arc<dyn ClientBuilder>, options: ClientOptions) -> Self {
        Self { source, builder, options, config: OnceCell::new(), client: OnceCell::new() }
    }

    async fn config(&self) -> Result<kube::Config, ClusterError> {
        self.config
            .get_or_try_init(|| async {
                debug!(source = %self.source.describe(), "resolving cluster config");
                self.source.resolve().await
            })
            .await
            .cloned()
    }

    async fn build(&self) -> Result<Connection, ClusterError> {
        let config = self.config().await?;
        let client = self
            .client
            .get_or_try_init(|| async { self.builder.build(&config, &self.options) })
            .await?
            .clone();
        Ok(Connection { config, client })
    }
}

pub enum ClusterHandle {
    /// Already-resolved config.
    Fixed { config: kube::Config, builder: Arc<dyn ClientBuilder> },
    /// Kubeconfig path + context, resolved once.
    Kubeconfig(Lazy),
    /// Named cluster served by the data-cluster factory of a control cluster.
    DataCluster { control: Arc<ClusterHandle>, name: String, factory: Arc<DataClusterFactory> },
    /// Kubeconfig held in a `vc-<name>` secret, resolved once.
    VirtualCluster(Lazy),
}

impl ClusterHandle {
    pub fn fixed(config: kube::Config, builder: Arc<dyn ClientBuilder>) -> Self {
        ClusterHandle::Fixed { config, builder }
    }

    pub fn kubeconfig(source: Arc<dyn ConfigSource>, builder: Arc<dyn ClientBuilder>) -> Self {
        ClusterHandle::Kubeconfig(Lazy::new(source, builder, ClientOptions::live()))
    }

    pub fn virtual_cluster(source: Arc<dyn ConfigSource>, builder: Arc<dyn ClientBuilder>, options: ClientOptions) -> Self {
        ClusterHandle::VirtualCluster(Lazy::new(source, builder, options))
    }

    pub fn data_cluster(control: Arc<ClusterHandle>, name: impl Into<String>, factory: Arc<DataClusterFactory>) -> Self {
        ClusterHandle::DataCluster { control, name: name.into(), factory }
    }

    /// Connection config without building a client.
    pub fn config(&self) -> BoxFuture<'_, Result<kube::Config, ClusterError>> {
        async move {
            match self {
                ClusterHandle::Fixed { config, .. } => Ok(config.clone()),
                ClusterHandle::Kubeconfig(lazy) | ClusterHandle::VirtualCluster(lazy) => lazy.config().await,
                ClusterHandle::DataCluster { control, name, factory } => {
                    let control_config = control.config().await?;
                    factory.start(&control_config).await;
                    factory.rest_config(name).ok_or_else(|| ClusterError::NotCached(name.clone()))
                }
            }
        }
        .boxed()
    }

    pub async fn build(&self) -> Result<Connection, ClusterError> {
        match self {
            ClusterHandle::Fixed { config, builder } => {
                let client = builder.build(config, &ClientOptions::live())?;
                Ok(Connection { config: config.clone(), client })
            }
            ClusterHandle::Kubeconfig(lazy) | ClusterHandle::VirtualCluster(lazy) => lazy.build().await,
            ClusterHandle::DataCluster { name, factory, .. } => {
                let config = self.config().await?;
                let client = factory.create_client(name)?;
                Ok(Connection { config, client })
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ClusterHandle::Fixed { config, .. } => format!("fixed {}", config.cluster_url),
            ClusterHandle::Kubeconfig(lazy) | ClusterHandle::VirtualCluster(lazy) => lazy.source.describe(),
            ClusterHandle::DataCluster { name, .. } => format!("data cluster {name}"),
        }
    }
}

impl fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}
