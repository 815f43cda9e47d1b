//! kassert engine: the execution context threaded through a test's steps.

#![forbid(unsafe_code)]

pub mod context;
pub mod steps;

pub use context::{EngineDeps, ExecutionContext, RESERVED_BINDINGS};
pub use steps::{clusters_from_yaml, BindingSpec, ClusterSpec, PodLogsSpec};

use kassert_core::{ClusterError, FnError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid binding name {0:?}")]
    InvalidBindingName(String),
    #[error("binding {name}: {source}")]
    Binding { name: String, source: FnError },
    #[error("cluster {cluster}: {field} must resolve to a string, got {actual}")]
    NotAString { cluster: String, field: &'static str, actual: String },
    #[error("cluster {cluster}: {source}")]
    Template { cluster: String, source: FnError },
    #[error("cluster {cluster}: control cluster {control:?} is not registered")]
    UnknownControlCluster { cluster: String, control: String },
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Function(#[from] FnError),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Logs(#[from] anyhow::Error),
}
