//! Step-level declarations the context consumes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::EngineError;

/// `name: value`; a `"(expr)"` string value is evaluated, anything else is literal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BindingSpec {
    pub name: String,
    pub value: Json,
}

impl BindingSpec {
    pub fn new(name: impl Into<String>, value: Json) -> Self {
        Self { name: name.into(), value }
    }
}

/// How to reach one named cluster. Checked in order: virtual cluster (both
/// vcluster fields set), data cluster, kubeconfig.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub kubeconfig: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub vcluster_name: String,
    #[serde(default)]
    pub vcluster_namespace: String,
    #[serde(default)]
    pub data_cluster_name: String,
    #[serde(default)]
    pub control_cluster_name: String,
}

impl ClusterSpec {
    pub fn kubeconfig(path: impl Into<String>, context: impl Into<String>) -> Self {
        Self { kubeconfig: path.into(), context: context.into(), ..Default::default() }
    }

    pub fn vcluster(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { vcluster_name: name.into(), vcluster_namespace: namespace.into(), ..Default::default() }
    }

    pub fn data_cluster(name: impl Into<String>, control: impl Into<String>) -> Self {
        Self { data_cluster_name: name.into(), control_cluster_name: control.into(), ..Default::default() }
    }

    pub fn is_vcluster(&self) -> bool {
        !self.vcluster_name.is_empty() && !self.vcluster_namespace.is_empty()
    }

    pub fn is_data_cluster(&self) -> bool {
        !self.is_vcluster() && !self.data_cluster_name.is_empty()
    }
}

/// Parse a `name -> ClusterSpec` YAML mapping.
pub fn clusters_from_yaml(text: &str) -> Result<BTreeMap<String, ClusterSpec>, EngineError> {
    Ok(serde_yaml::from_str(text)?)
}

/// Pod log collection with templated fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodLogsSpec {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_specs_from_yaml() {
        let specs = clusters_from_yaml(
            r#"
east:
  kubeconfig: kube/east.yaml
  context: admin
tenant:
  vclusterName: "($tenant)"
  vclusterNamespace: vclusters
shard:
  dataClusterName: shard-1
  controlClusterName: east
"#,
        )
        .unwrap();
        assert_eq!(specs["east"], ClusterSpec::kubeconfig("kube/east.yaml", "admin"));
        assert!(specs["tenant"].is_vcluster());
        assert!(specs["shard"].is_data_cluster());
        assert!(!specs["east"].is_data_cluster());
    }

    #[test]
    fn half_vcluster_falls_through() {
        let mut spec = ClusterSpec::data_cluster("d", "c");
        spec.vcluster_name = "only-name".into();
        assert!(!spec.is_vcluster());
        assert!(spec.is_data_cluster());
    }
}
