use std::sync::Arc;

use futures::future::BoxFuture;
use kassert_core::ClusterError;
use rustc_hash::FxHashMap;

use crate::handle::{ClusterHandle, Connection};

/// Name of the cluster used when a step does not pick one.
pub const DEFAULT_CLUSTER: &str = "";

pub type BuildFn = Arc<dyn Fn(Option<Arc<ClusterHandle>>) -> BoxFuture<'static, Result<Option<Connection>, ClusterError>> + Send + Sync>;

/// Immutable name -> handle map. `register` returns a new registry.
#[derive(Clone, Default)]
pub struct ClusterRegistry {
    factory: Option<BuildFn>,
    clusters: Arc<FxHashMap<String, Arc<ClusterHandle>>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the default build strategy.
    pub fn with_factory(&self, factory: BuildFn) -> Self {
        Self { factory: Some(factory), clusters: self.clusters.clone() }
    }

    pub fn register(&self, name: impl Into<String>, handle: Arc<ClusterHandle>) -> Self {
        let mut next = (*self.clusters).clone();
        next.insert(name.into(), handle);
        Self { factory: self.factory.clone(), clusters: Arc::new(next) }
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<ClusterHandle>> {
        self.clusters.get(name).cloned()
    }

    /// Absent handle is not an error here: `Ok(None)`.
    pub async fn build(&self, handle: Option<Arc<ClusterHandle>>) -> Result<Option<Connection>, ClusterError> {
        if let Some(f) = &self.factory {
            return f(handle).await;
        }
        match handle {
            Some(h) => h.build().await.map(Some),
            None => Ok(None),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

impl std::fmt::Debug for ClusterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRegistry").field("clusters", &self.names()).field("custom_factory", &self.factory.is_some()).finish()
    }
}
