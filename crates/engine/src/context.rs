//! Immutable execution context.
//!
//! Every `with_*` returns a new context; the receiver stays usable. The
//! helpers below own the reserved binding names and overwrite whatever a
//! user bound under them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kassert_core::{is_identifier, resolve_template, Bindings, Evaluator, FunctionCaller, Value};
use kassert_functions::{client_value, config_value, FunctionLibrary};
use kassert_kubehub::{
    ClientBuilder, ClusterHandle, ClusterRegistry, DataClusterFactory, KubeconfigSource, SecretConfigSource, DEFAULT_CLUSTER,
};
use kassert_ops::PodLogs;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::steps::{BindingSpec, ClusterSpec, PodLogsSpec};
use crate::EngineError;

pub const RESERVED_BINDINGS: [&str; 4] = ["client", "config", "namespace", "values"];

/// Process-lifetime collaborators shared by every context.
pub struct EngineDeps {
    pub library: FunctionLibrary,
    pub caller: FunctionCaller,
    pub client_builder: Arc<dyn ClientBuilder>,
    /// Host cluster for virtual-cluster secrets; inferred when absent.
    pub host_config: Option<kube::Config>,
}

impl EngineDeps {
    pub fn new(client_builder: Arc<dyn ClientBuilder>, data_clusters: Arc<DataClusterFactory>) -> Self {
        Self::with_library(client_builder, FunctionLibrary::new(data_clusters))
    }

    pub fn with_library(client_builder: Arc<dyn ClientBuilder>, library: FunctionLibrary) -> Self {
        let caller = library.caller();
        Self { library, caller, client_builder, host_config: None }
    }

    pub fn with_host_config(mut self, config: kube::Config) -> Self {
        self.host_config = Some(config);
        self
    }

    pub fn evaluator(&self) -> &dyn Evaluator {
        &**self.library.evaluator()
    }

    pub fn data_clusters(&self) -> &Arc<DataClusterFactory> {
        self.library.data_clusters()
    }
}

#[derive(Clone)]
pub struct ExecutionContext {
    bindings: Bindings,
    registry: ClusterRegistry,
    current_cluster: String,
    deps: Arc<EngineDeps>,
}

impl ExecutionContext {
    pub fn new(deps: Arc<EngineDeps>) -> Self {
        Self { bindings: Bindings::new(), registry: ClusterRegistry::new(), current_cluster: DEFAULT_CLUSTER.to_string(), deps }
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    pub fn current_cluster(&self) -> &str {
        &self.current_cluster
    }

    pub fn deps(&self) -> &Arc<EngineDeps> {
        &self.deps
    }

    pub fn with_binding(&self, name: impl Into<String>, value: Value) -> Self {
        Self { bindings: self.bindings.with_binding(name, value), ..self.clone() }
    }

    pub fn with_registry(&self, registry: ClusterRegistry) -> Self {
        Self { registry, ..self.clone() }
    }

    pub fn with_cluster(&self, name: impl Into<String>, handle: Arc<ClusterHandle>) -> Self {
        self.with_registry(self.registry.register(name, handle))
    }

    /// Evaluate a template (`"(expr)"` strings, recursively through arrays
    /// and objects) against the current bindings.
    pub async fn resolve(&self, template: &Json) -> Result<Value, kassert_core::FnError> {
        resolve_template(template, &self.bindings, self.deps.evaluator(), &self.deps.caller).await
    }

    /// Bind each spec in order; later values see earlier ones. The first
    /// failure aborts the whole call.
    pub async fn with_bindings(&self, specs: &[BindingSpec]) -> Result<Self, EngineError> {
        let mut ctx = self.clone();
        for spec in specs {
            if !is_identifier(&spec.name) {
                return Err(EngineError::InvalidBindingName(spec.name.clone()));
            }
            let value = ctx.resolve(&spec.value).await.map_err(|source| EngineError::Binding { name: spec.name.clone(), source })?;
            if RESERVED_BINDINGS.contains(&spec.name.as_str()) {
                debug!(name = %spec.name, "binding shadows a reserved name");
            }
            ctx = ctx.with_binding(spec.name.clone(), value);
        }
        Ok(ctx)
    }

    async fn resolve_name(&self, cluster: &str, field: &'static str, template: &str) -> Result<String, EngineError> {
        let value = self
            .resolve(&Json::String(template.to_string()))
            .await
            .map_err(|source| EngineError::Template { cluster: cluster.to_string(), source })?;
        match value.as_str() {
            Some(s) => Ok(s.to_string()),
            None => Err(EngineError::NotAString { cluster: cluster.to_string(), field, actual: value.type_label() }),
        }
    }

    /// Register a handle per spec. Kubeconfig and virtual clusters go first;
    /// data clusters follow in dependency order, so a control cluster may be
    /// declared alongside them, itself a data cluster or not.
    pub async fn with_clusters(&self, base_path: &Path, specs: &BTreeMap<String, ClusterSpec>) -> Result<Self, EngineError> {
        let mut ctx = self.clone();
        let (mut pending, direct): (Vec<_>, Vec<_>) = specs.iter().partition(|(_, s)| s.is_data_cluster());
        for (name, spec) in direct {
            ctx = ctx.register_spec(name, base_path, spec).await?;
        }
        while !pending.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|(_, s)| ctx.registry.lookup(&s.control_cluster_name).is_some());
            if ready.is_empty() {
                // nothing can make progress; report the first missing control
                let (name, spec) = blocked[0];
                return Err(EngineError::UnknownControlCluster { cluster: name.clone(), control: spec.control_cluster_name.clone() });
            }
            for (name, spec) in ready {
                ctx = ctx.register_spec(name, base_path, spec).await?;
            }
            pending = blocked;
        }
        Ok(ctx)
    }

    async fn register_spec(&self, name: &str, base_path: &Path, spec: &ClusterSpec) -> Result<Self, EngineError> {
        let handle = self.handle_for(name, base_path, spec).await?;
        info!(cluster = %name, handle = %handle.describe(), "cluster registered");
        Ok(self.with_cluster(name.to_string(), Arc::new(handle)))
    }

    async fn handle_for(&self, name: &str, base_path: &Path, spec: &ClusterSpec) -> Result<ClusterHandle, EngineError> {
        let builder = self.deps.client_builder.clone();
        if spec.is_vcluster() {
            let vcluster = self.resolve_name(name, "vclusterName", &spec.vcluster_name).await?;
            let namespace = self.resolve_name(name, "vclusterNamespace", &spec.vcluster_namespace).await?;
            let source = SecretConfigSource::new(vcluster, namespace, self.deps.host_config.clone());
            let options = self.deps.data_clusters().settings().client_options();
            return Ok(ClusterHandle::virtual_cluster(Arc::new(source), builder, options));
        }
        if spec.is_data_cluster() {
            let target = self.resolve_name(name, "dataClusterName", &spec.data_cluster_name).await?;
            let control = self.registry.lookup(&spec.control_cluster_name).ok_or_else(|| EngineError::UnknownControlCluster {
                cluster: name.to_string(),
                control: spec.control_cluster_name.clone(),
            })?;
            return Ok(ClusterHandle::data_cluster(control, target, self.deps.data_clusters().clone()));
        }
        let source = KubeconfigSource::new(kubeconfig_path(base_path, &spec.kubeconfig), &spec.context);
        Ok(ClusterHandle::kubeconfig(Arc::new(source), builder))
    }

    /// Select `name` and bind its `client` and `config`. The selection sticks
    /// even when building fails; an unknown name binds both to null.
    pub async fn with_current_cluster(&self, name: &str) -> (Self, Result<(), EngineError>) {
        let ctx = Self { current_cluster: name.to_string(), ..self.clone() };
        match ctx.registry.build(ctx.registry.lookup(name)).await {
            Ok(Some(conn)) => {
                debug!(cluster = %name, "current cluster connected");
                let ctx = ctx.with_binding("client", client_value(conn.client)).with_binding("config", config_value(conn.config));
                (ctx, Ok(()))
            }
            Ok(None) => {
                let ctx = ctx.with_binding("client", Value::null()).with_binding("config", Value::null());
                (ctx, Ok(()))
            }
            Err(e) => {
                warn!(cluster = %name, error = %e, "current cluster build failed");
                (ctx, Err(e.into()))
            }
        }
    }

    pub fn with_namespace(&self, namespace: &str) -> Self {
        self.with_binding("namespace", Value::string(namespace))
    }

    pub fn with_values(&self, values: Json) -> Self {
        self.with_binding("values", Value::Json(values))
    }

    /// Resolve a log collector's templated fields and build its command.
    pub async fn pod_logs_command(&self, spec: &PodLogsSpec) -> Result<(String, Vec<String>), EngineError> {
        let field = |raw: &str| {
            let raw = raw.to_string();
            async move {
                let v = self.resolve(&Json::String(raw)).await?;
                Ok::<String, EngineError>(v.to_display_string())
            }
        };
        let logs = PodLogs {
            name: field(&spec.name).await?,
            namespace: field(&spec.namespace).await?,
            selector: field(&spec.selector).await?,
            container: field(&spec.container).await?,
            tail: spec.tail,
        };
        Ok(logs.command()?)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("current_cluster", &self.current_cluster)
            .field("bindings", &self.bindings.names())
            .field("registry", &self.registry)
            .finish()
    }
}

/// Relative kubeconfig paths are joined onto the test's directory.
pub fn kubeconfig_path(base_path: &Path, kubeconfig: &str) -> PathBuf {
    let p = Path::new(kubeconfig);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_path.join(p)
    }
}
