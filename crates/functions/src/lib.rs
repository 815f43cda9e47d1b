//! Function library: the callable surface expressions use to query clusters.
//!
//! Two catalogs. The general catalog is what user expressions see; the inner
//! catalog holds the wait functions, which evaluate a sub-expression against
//! query results with a caller built from the general catalog only.
//!
//! Clients and configs travel through bindings as [`Value::Handle`]s wrapping a
//! [`SharedClient`] or a [`kube::Config`]; see [`client_value`] and [`config_value`].

#![forbid(unsafe_code)]

mod data;
mod fanout;
mod general;
mod k8s;
pub mod prom;

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use kassert_core::{experimental, stable, ArgSpec, Args, Evaluator, FnError, FunctionCaller, FunctionEntry, PathEvaluator, Value};
use kassert_kubehub::{DataClusterFactory, SharedClient};
use kassert_ops::PollSettings;
use metrics::counter;
use tracing::debug;

pub use fanout::split_clusters;

/// Wrap a client for binding under `client`.
pub fn client_value(client: SharedClient) -> Value {
    Value::handle(client)
}

/// Wrap a connection config for binding under `config`.
pub fn config_value(config: kube::Config) -> Value {
    Value::handle(config)
}

pub(crate) fn client_arg(args: &Args<'_>, index: usize) -> Result<SharedClient, FnError> {
    args.required_handle::<SharedClient>(index).map(|c| (*c).clone())
}

/// `null` is reported as [`FnError::NilConfig`].
pub(crate) fn config_arg(args: &Args<'_>, index: usize) -> Result<Arc<kube::Config>, FnError> {
    args.handle::<kube::Config>(index)?.ok_or(FnError::NilConfig)
}

#[derive(Clone)]
pub struct FunctionLibrary {
    data_clusters: Arc<DataClusterFactory>,
    evaluator: Arc<dyn Evaluator>,
    poll: PollSettings,
}

impl FunctionLibrary {
    pub fn new(data_clusters: Arc<DataClusterFactory>) -> Self {
        Self { data_clusters, evaluator: Arc::new(PathEvaluator), poll: PollSettings::default() }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Override the wait interval/deadline (defaults 1s / 60s).
    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn data_clusters(&self) -> &Arc<DataClusterFactory> {
        &self.data_clusters
    }

    pub fn evaluator(&self) -> &Arc<dyn Evaluator> {
        &self.evaluator
    }

    pub fn poll_settings(&self) -> PollSettings {
        self.poll
    }

    /// General catalog.
    pub fn functions(&self) -> Vec<FunctionEntry> {
        use ArgSpec as A;
        vec![
            entry(stable("env"), vec![A::string()], general::env),
            entry(stable("trim_space"), vec![A::string()], general::trim_space),
            entry(stable("as_string"), vec![A::any()], general::as_string),
            self.bind(stable("table_print"), vec![A::any(), A::opt_string()], general::table_print),
            entry(experimental("k8s_get"), vec![A::any(), A::string(), A::string(), A::string(), A::string()], k8s::get),
            entry(experimental("k8s_exists"), vec![A::any(), A::string(), A::string(), A::string(), A::string()], k8s::exists),
            entry(experimental("k8s_resource_exists"), vec![A::any(), A::string(), A::string()], k8s::resource_exists),
            entry(experimental("k8s_list"), vec![A::any(), A::string(), A::string(), A::opt_string()], k8s::list),
            self.bind(experimental("k8s_server_version"), vec![A::any()], k8s::server_version),
            entry(experimental("metrics_decode"), vec![A::string()], prom::metrics_decode),
            self.bind(
                experimental("data_cluster_init"),
                vec![A::any(), A::string(), A::string(), A::string(), A::opt_string()],
                data::init,
            ),
            self.bind(
                experimental("data_cluster_clean"),
                vec![A::any(), A::string(), A::string(), A::string(), A::opt_string()],
                data::clean,
            ),
            self.bind(
                experimental("data_cluster_list"),
                vec![A::any(), A::string(), A::string(), A::string(), A::opt_string(), A::opt_string()],
                data::list,
            ),
            self.bind(
                experimental("data_cluster_patch"),
                vec![A::any(), A::string(), A::string(), A::string(), A::opt_string(), A::opt_string(), A::opt_string()],
                data::patch,
            ),
            self.bind(experimental("data_cluster_server_version"), vec![A::any(), A::string()], data::server_version),
            self.bind(experimental("data_cluster_create_namespace"), vec![A::any(), A::string(), A::string()], data::create_namespace),
            self.bind(experimental("data_cluster_delete_namespace"), vec![A::any(), A::string(), A::string()], data::delete_namespace),
            self.bind(experimental("data_k8s_client"), vec![A::any(), A::string(), A::string(), A::string()], data::client),
            entry(experimental("data_k8s_get"), vec![A::any(), A::string(), A::string(), A::string(), A::string()], k8s::get),
            entry(
                experimental("data_k8s_list"),
                vec![A::any(), A::string(), A::string(), A::opt_string(), A::opt_string()],
                data::client_list,
            ),
        ]
    }

    /// Wait functions. Kept out of the inner caller so a wait condition
    /// cannot start another wait.
    pub fn inner_functions(&self) -> Vec<FunctionEntry> {
        use ArgSpec as A;
        vec![
            self.bind(
                experimental("k8s_wait"),
                vec![A::any(), A::opt_string(), A::opt_string(), A::opt_string(), A::opt_string(), A::opt_string()],
                k8s::wait,
            ),
            self.bind(
                experimental("data_cluster_wait"),
                vec![A::any(), A::string(), A::string(), A::string(), A::string(), A::string(), A::string(), A::string()],
                data::wait,
            ),
        ]
    }

    /// Caller over both catalogs.
    pub fn caller(&self) -> FunctionCaller {
        FunctionCaller::new(self.functions().into_iter().chain(self.inner_functions()))
    }

    /// Caller over the general catalog only; used while waiting.
    pub fn inner_caller(&self) -> FunctionCaller {
        FunctionCaller::new(self.functions())
    }

    fn bind<F, Fut>(&self, name: String, arguments: Vec<ArgSpec>, handler: F) -> FunctionEntry
    where
        F: Fn(FunctionLibrary, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FnError>> + Send + 'static,
    {
        let lib = self.clone();
        entry(name, arguments, move |args| handler(lib.clone(), args))
    }
}

impl std::fmt::Debug for FunctionLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionLibrary").field("poll", &self.poll).finish()
    }
}

fn entry<F, Fut>(name: String, arguments: Vec<ArgSpec>, handler: F) -> FunctionEntry
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FnError>> + Send + 'static,
{
    let label = name.clone();
    FunctionEntry::new(name, arguments, move |args| {
        let fut = handler(args);
        let label = label.clone();
        async move {
            counter!("fn_calls_total", 1u64, "function" => label.clone());
            let out = fut.await;
            if let Err(e) = &out {
                counter!("fn_errors_total", 1u64, "function" => label.clone());
                debug!(function = %label, error = %e, "fn failed");
            }
            out
        }
        .boxed()
    })
}
