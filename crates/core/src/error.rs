use thiserror::Error;

/// Failures reported by cluster clients and handle resolution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: String, name: String },
    #[error("no matches for kind \"{kind}\" in version \"{api_version}\"")]
    NoMatch { api_version: String, kind: String },
    #[error("invalid apiVersion: {0}")]
    InvalidApiVersion(String),
    #[error("rest config of data cluster {0} not found")]
    NotCached(String),
    #[error("api error ({code}): {message}")]
    Api { code: u16, message: String },
    #[error("kubeconfig: {0}")]
    Config(String),
    #[error("{0}")]
    Other(String),
}

impl ClusterError {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound { kind: kind.into(), name: name.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Api { code: 404, .. })
    }

    pub fn is_no_match(&self) -> bool {
        matches!(self, Self::NoMatch { .. })
    }
}

/// Error taxonomy of library functions.
#[derive(Debug, Clone, Error)]
pub enum FnError {
    #[error("index out of range ({index} / {len})")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("invalid type at position {index}: expected {expected}, got {actual}")]
    InvalidType { index: usize, expected: &'static str, actual: String },
    #[error("function {name} expects {expected} arguments, got {actual}")]
    Arity { name: String, expected: String, actual: usize },
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("rest config is nil")]
    NilConfig,
    #[error("{cluster} {api_version} {kind} client not found")]
    ClientNotFound { cluster: String, api_version: String, kind: String },
    #[error("{prefix}cluster: {cluster}, err: {source}")]
    InCluster { prefix: &'static str, cluster: String, source: Box<FnError> },
    #[error("{0}")]
    Aggregate(String),
    #[error("failed to evaluate `{expression}`: {message}")]
    Eval { expression: String, message: String },
}

impl FnError {
    pub fn in_cluster(cluster: impl Into<String>, err: FnError) -> Self {
        Self::InCluster { prefix: "", cluster: cluster.into(), source: Box::new(err) }
    }

    pub fn delete_in_cluster(cluster: impl Into<String>, err: FnError) -> Self {
        Self::InCluster { prefix: "delete ns in ", cluster: cluster.into(), source: Box::new(err) }
    }

    pub fn eval(expression: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Eval { expression: expression.into(), message: message.to_string() }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Cluster(e) => e.is_not_found(),
            Self::InCluster { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub fn is_no_match(&self) -> bool {
        match self {
            Self::Cluster(e) => e.is_no_match(),
            Self::InCluster { source, .. } => source.is_no_match(),
            _ => false,
        }
    }
}
