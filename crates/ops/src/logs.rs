use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Left in place of a missing namespace; the shell running the command expands it.
pub const NAMESPACE_PLACEHOLDER: &str = "$NAMESPACE";

/// Pod log collection request, fields already resolved.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodLogs {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub container: String,
    #[serde(default)]
    pub tail: Option<i64>,
}

impl PodLogs {
    /// Program and argument vector of the `kubectl logs` invocation.
    pub fn command(&self) -> Result<(String, Vec<String>)> {
        if self.name.is_empty() && self.selector.is_empty() {
            return Err(anyhow!("a name or selector must be specified"));
        }
        if !self.name.is_empty() && !self.selector.is_empty() {
            return Err(anyhow!("name cannot be provided when a selector is specified"));
        }
        let mut args: Vec<String> = vec!["logs".into(), "--prefix".into()];
        if !self.name.is_empty() {
            args.push(self.name.clone());
        } else {
            args.push("-l".into());
            args.push(self.selector.clone());
        }
        let namespace = if self.namespace.is_empty() { NAMESPACE_PLACEHOLDER } else { self.namespace.as_str() };
        args.push("-n".into());
        args.push(namespace.to_string());
        if self.container.is_empty() {
            args.push("--all-containers".into());
        } else {
            args.push("-c".into());
            args.push(self.container.clone());
        }
        if let Some(tail) = self.tail {
            args.push("--tail".into());
            args.push(tail.to_string());
        }
        Ok(("kubectl".to_string(), args))
    }
}
