use std::collections::BTreeSet;

use k8s_openapi::api::{apps, batch, core::v1 as corev1};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kassert_core::Gvk;
use kube::core::ApiResource;
use kube::Resource;
use rustc_hash::FxHashMap;

/// Custom-resource group served by the system under test.
pub const OWN_GROUP_VERSION: &str = "kassert.dev/v1alpha1";

/// Kinds known without discovery, plus the group-versions clients are bound to.
#[derive(Debug, Clone, Default)]
pub struct Scheme {
    kinds: FxHashMap<Gvk, (ApiResource, bool)>,
    group_versions: BTreeSet<String>,
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    /// Core API group, workload groups, `apiextensions.k8s.io/v1` and the own group.
    pub fn default_scheme() -> Self {
        let mut s = Self::new();
        s.add::<corev1::Pod>(true);
        s.add::<corev1::Service>(true);
        s.add::<corev1::ConfigMap>(true);
        s.add::<corev1::Secret>(true);
        s.add::<corev1::ServiceAccount>(true);
        s.add::<corev1::PersistentVolumeClaim>(true);
        s.add::<corev1::Endpoints>(true);
        s.add::<corev1::Event>(true);
        s.add::<corev1::Namespace>(false);
        s.add::<corev1::Node>(false);
        s.add::<corev1::PersistentVolume>(false);
        s.add::<apps::v1::Deployment>(true);
        s.add::<apps::v1::StatefulSet>(true);
        s.add::<apps::v1::DaemonSet>(true);
        s.add::<apps::v1::ReplicaSet>(true);
        s.add::<batch::v1::Job>(true);
        s.add::<CustomResourceDefinition>(false);
        s.add_group_version(OWN_GROUP_VERSION);
        s
    }

    pub fn add<K>(&mut self, namespaced: bool)
    where
        K: Resource<DynamicType = ()>,
    {
        let ar = ApiResource::erase::<K>(&());
        self.group_versions.insert(ar.api_version.clone());
        let gvk = Gvk { group: ar.group.clone(), version: ar.version.clone(), kind: ar.kind.clone() };
        self.kinds.insert(gvk, (ar, namespaced));
    }

    /// Bind a group-version whose kinds are resolved through discovery.
    pub fn add_group_version(&mut self, api_version: &str) {
        self.group_versions.insert(api_version.to_string());
    }

    pub fn lookup(&self, gvk: &Gvk) -> Option<(ApiResource, bool)> {
        self.kinds.get(gvk).cloned()
    }

    /// Whether `gvk` belongs to a group-version clients are bound to.
    pub fn recognizes(&self, gvk: &Gvk) -> bool {
        self.group_versions.contains(&gvk.api_version())
    }
}
