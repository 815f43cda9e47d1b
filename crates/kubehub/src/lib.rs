//! kassert kube integration.
//!
//! Cluster handles resolve lazily to a [`handle::Connection`] (config plus
//! a [`client::ClusterClient`]). The [`registry::ClusterRegistry`] maps step
//! level cluster names to handles, and the [`factory::DataClusterFactory`]
//! keeps data-cluster configs discovered from a control cluster fresh.

#![forbid(unsafe_code)]

pub mod client;
pub mod factory;
pub mod handle;
pub mod mock;
pub mod registry;
pub mod scheme;
pub mod source;

pub use client::{object_labels, ClientBuilder, ClientOptions, ClusterClient, KubeClientBuilder, KubeClusterClient, SharedClient};
pub use factory::{ClusterDirectory, DataClusterFactory, FactorySettings, SecretDirectory, DATA_CLUSTER_LABEL};
pub use handle::{ClusterHandle, Connection, Lazy};
pub use registry::{BuildFn, ClusterRegistry, DEFAULT_CLUSTER};
pub use scheme::{Scheme, OWN_GROUP_VERSION};
pub use source::{ConfigSource, KubeconfigSource, SecretConfigSource, KUBECONFIG_SECRET_KEY, VCLUSTER_SECRET_PREFIX};
