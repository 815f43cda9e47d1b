//! kassert core: values, bindings, label selectors and the function seam

#![forbid(unsafe_code)]

pub mod bindings;
pub mod error;
pub mod eval;
pub mod function;
pub mod selector;
pub mod table;
pub mod value;

pub use bindings::{is_identifier, Bindings};
pub use error::{ClusterError, FnError};
pub use eval::{resolve_template, Evaluator, PathEvaluator};
pub use function::{experimental, stable, ArgKind, ArgSpec, FunctionCaller, FunctionEntry, Handler, EXPERIMENTAL_PREFIX};
pub use selector::{parse_selector, LabelSelector, Operator, Requirement};
pub use value::{Args, Handle, Value};

use serde::{Deserialize, Serialize};

pub mod prelude {
    pub use super::{
        Args, ArgSpec, Bindings, ClusterError, Evaluator, FnError, FunctionCaller, FunctionEntry, Gvk, Handle,
        LabelSelector, Value,
    };
}

/// Group/version/kind triple of a Kubernetes type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    /// Split an `apiVersion` (`v1` or `group/v1`) and pair it with `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Result<Self, ClusterError> {
        let parts: Vec<_> = api_version.split('/').collect();
        let (group, version) = match parts.as_slice() {
            [version] if !version.is_empty() => (String::new(), (*version).to_string()),
            [group, version] if !group.is_empty() && !version.is_empty() => ((*group).to_string(), (*version).to_string()),
            _ => return Err(ClusterError::InvalidApiVersion(api_version.to_string())),
        };
        if kind.is_empty() {
            return Err(ClusterError::InvalidApiVersion(format!("{api_version} (empty kind)")));
        }
        Ok(Self { group, version, kind: kind.to_string() })
    }

    /// Parse a `v1/Kind` or `group/v1/Kind` key.
    pub fn parse_key(key: &str) -> Result<Self, ClusterError> {
        match key.rsplit_once('/') {
            Some((api_version, kind)) => Self::from_api_version(api_version, kind),
            None => Err(ClusterError::InvalidApiVersion(format!("{key} (expect v1/Kind or group/v1/Kind)"))),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }
}

impl std::fmt::Display for Gvk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}
