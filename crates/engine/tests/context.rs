#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use kassert_core::Value;
use kassert_engine::{BindingSpec, ClusterSpec, EngineDeps, EngineError, ExecutionContext, PodLogsSpec};
use kassert_kubehub::mock::{mock_config, MockClientBuilder, MockClusterClient, StaticDirectory};
use kassert_kubehub::{ClusterHandle, DataClusterFactory, FactorySettings, SharedClient};
use serde_json::json;

const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: east
  cluster:
    server: https://east:6443
contexts:
- name: east
  context:
    cluster: east
    user: admin
current-context: east
users:
- name: admin
  user:
    token: abc
"#;

fn fixture() -> (ExecutionContext, Arc<MockClientBuilder>) {
    let builder = Arc::new(
        MockClientBuilder::new()
            .with_client("east", Arc::new(MockClusterClient::new()))
            .with_client("control", Arc::new(MockClusterClient::new()))
            .with_client("shard-1", Arc::new(MockClusterClient::new())),
    );
    let factory = DataClusterFactory::new(Arc::new(StaticDirectory::with_clusters(&["shard-1"])), builder.clone(), FactorySettings::default());
    let deps = EngineDeps::new(builder.clone(), Arc::new(factory));
    (ExecutionContext::new(Arc::new(deps)), builder)
}

fn bound_str<'a>(ctx: &'a ExecutionContext, name: &str) -> Option<&'a str> {
    ctx.bindings().get(name).and_then(Value::as_str)
}

#[tokio::test]
async fn bindings_fold_left_to_right() {
    let (ctx, _) = fixture();
    let next = ctx
        .with_bindings(&[
            BindingSpec::new("tenant", json!("tenant-a")),
            BindingSpec::new("copy", json!("($tenant)")),
            BindingSpec::new("nested", json!({"who": "($copy)", "list": ["($tenant)", 3]})),
        ])
        .await
        .unwrap();
    assert_eq!(bound_str(&next, "copy"), Some("tenant-a"));
    assert_eq!(next.bindings().get("nested").unwrap().as_json(), Some(&json!({"who": "tenant-a", "list": ["tenant-a", 3]})));
    assert!(ctx.bindings().is_empty());
}

#[tokio::test]
async fn bindings_abort_on_first_failure() {
    let (ctx, _) = fixture();
    let err = ctx
        .with_bindings(&[BindingSpec::new("a", json!("x")), BindingSpec::new("b", json!("($missing)")), BindingSpec::new("c", json!("y"))])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Binding { ref name, .. } if name == "b"));

    let err = ctx.with_bindings(&[BindingSpec::new("1bad", json!(1))]).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidBindingName(_)));
}

#[tokio::test]
async fn reserved_names_are_overwritten() {
    let (ctx, _) = fixture();
    let user = ctx.with_bindings(&[BindingSpec::new("namespace", json!("mine"))]).await.unwrap();
    let ns = user.with_namespace("team");
    assert_eq!(bound_str(&user, "namespace"), Some("mine"));
    assert_eq!(bound_str(&ns, "namespace"), Some("team"));

    let v = ns.with_values(json!({"replicas": 3}));
    assert_eq!(v.bindings().get("values").unwrap().as_json(), Some(&json!({"replicas": 3})));
}

#[tokio::test]
async fn kubeconfig_cluster_becomes_current() {
    let dir = std::env::temp_dir().join(format!("kassert-engine-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("east.yaml"), KUBECONFIG).unwrap();

    let (ctx, builder) = fixture();
    let specs = BTreeMap::from([("east".to_string(), ClusterSpec::kubeconfig("east.yaml", ""))]);
    let ctx = ctx.with_clusters(&dir, &specs).await.unwrap();
    assert_eq!(ctx.registry().names(), vec!["east".to_string()]);

    let (ctx, result) = ctx.with_current_cluster("east").await;
    result.unwrap();
    assert_eq!(ctx.current_cluster(), "east");
    let client = ctx.bindings().get("client").unwrap();
    assert!(matches!(client, Value::Handle(h) if h.downcast_ref::<SharedClient>().is_some()));
    let config = ctx.bindings().get("config").unwrap();
    assert!(matches!(config, Value::Handle(h) if h.downcast_ref::<kube::Config>().is_some()));
    assert_eq!(builder.builds(), 1);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn unknown_current_cluster_binds_null() {
    let (ctx, _) = fixture();
    let (ctx, result) = ctx.with_current_cluster("nowhere").await;
    assert!(result.is_ok());
    assert_eq!(ctx.current_cluster(), "nowhere");
    assert!(ctx.bindings().get("client").unwrap().is_null());
    assert!(ctx.bindings().get("config").unwrap().is_null());
}

#[tokio::test]
async fn failed_build_still_selects_cluster() {
    let (ctx, builder) = fixture();
    let ctx = ctx.with_cluster("east", Arc::new(ClusterHandle::fixed(mock_config("east"), builder.clone())));
    builder.fail_next(1);
    let (next, result) = ctx.with_current_cluster("east").await;
    assert!(result.is_err());
    assert_eq!(next.current_cluster(), "east");
    assert!(next.bindings().get("client").is_none());
    assert_eq!(ctx.current_cluster(), "");
}

#[tokio::test]
async fn data_cluster_parented_on_control() {
    let (ctx, builder) = fixture();
    let ctx = ctx
        .with_cluster("control", Arc::new(ClusterHandle::fixed(mock_config("control"), builder.clone())))
        .with_bindings(&[BindingSpec::new("shard", json!("shard-1"))])
        .await
        .unwrap();
    let specs = BTreeMap::from([("data".to_string(), ClusterSpec::data_cluster("($shard)", "control"))]);
    let ctx = ctx.with_clusters(Path::new("/unused"), &specs).await.unwrap();
    assert_eq!(format!("{:?}", ctx.registry().lookup("data").unwrap()), "data cluster shard-1");

    let (ctx, result) = ctx.with_current_cluster("data").await;
    result.unwrap();
    assert!(!ctx.bindings().get("client").unwrap().is_null());
}

#[tokio::test]
async fn data_cluster_needs_registered_control() {
    let (ctx, _) = fixture();
    let specs = BTreeMap::from([("data".to_string(), ClusterSpec::data_cluster("shard-1", "control"))]);
    let err = ctx.with_clusters(Path::new("/unused"), &specs).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownControlCluster { .. }));
}

#[tokio::test]
async fn control_declared_alongside_data_cluster() {
    let (ctx, _) = fixture();
    let specs = BTreeMap::from([
        ("a-data".to_string(), ClusterSpec::data_cluster("shard-1", "z-control")),
        ("z-control".to_string(), ClusterSpec::kubeconfig("control.yaml", "")),
    ]);
    let ctx = ctx.with_clusters(Path::new("/suite"), &specs).await.unwrap();
    assert_eq!(ctx.registry().len(), 2);
}

#[tokio::test]
async fn data_cluster_chains_resolve_regardless_of_name_order() {
    let (ctx, builder) = fixture();
    let ctx = ctx.with_cluster("control", Arc::new(ClusterHandle::fixed(mock_config("control"), builder)));
    let specs = BTreeMap::from([
        ("a-edge".to_string(), ClusterSpec::data_cluster("shard-1", "z-hub")),
        ("z-hub".to_string(), ClusterSpec::data_cluster("shard-1", "control")),
    ]);
    let ctx = ctx.with_clusters(Path::new("/unused"), &specs).await.unwrap();
    assert_eq!(ctx.registry().len(), 3);
    assert_eq!(ctx.registry().lookup("a-edge").unwrap().describe(), "data cluster shard-1");

    let cyclic = BTreeMap::from([
        ("x".to_string(), ClusterSpec::data_cluster("shard-1", "y")),
        ("y".to_string(), ClusterSpec::data_cluster("shard-1", "x")),
    ]);
    let err = ctx.with_clusters(Path::new("/unused"), &cyclic).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownControlCluster { ref cluster, ref control } if cluster == "x" && control == "y"));
}

#[tokio::test]
async fn vcluster_names_are_templates() {
    let (ctx, _) = fixture();
    let ctx = ctx.with_bindings(&[BindingSpec::new("tenant", json!("tenant-a"))]).await.unwrap();
    let specs = BTreeMap::from([("tenant".to_string(), ClusterSpec::vcluster("($tenant)", "vclusters"))]);
    let ctx = ctx.with_clusters(Path::new("/suite"), &specs).await.unwrap();
    assert_eq!(ctx.registry().lookup("tenant").unwrap().describe(), "vcluster vclusters/tenant-a");

    let specs = BTreeMap::from([("bad".to_string(), ClusterSpec::vcluster("($tenant_list)", "vclusters"))]);
    let ctx = ctx.with_bindings(&[BindingSpec::new("tenant_list", json!(["a"]))]).await.unwrap();
    let err = ctx.with_clusters(Path::new("/suite"), &specs).await.unwrap_err();
    assert!(matches!(err, EngineError::NotAString { field: "vclusterName", .. }));
}

#[tokio::test]
async fn pod_logs_fields_resolve_against_bindings() {
    let (ctx, _) = fixture();
    let ctx = ctx.with_namespace("team");
    let spec = PodLogsSpec { selector: "app=web".into(), namespace: "($namespace)".into(), tail: Some(20), ..Default::default() };
    let (program, args) = ctx.pod_logs_command(&spec).await.unwrap();
    assert_eq!(program, "kubectl");
    assert_eq!(args, vec!["logs", "--prefix", "-l", "app=web", "-n", "team", "--all-containers", "--tail", "20"]);

    let err = ctx.pod_logs_command(&PodLogsSpec::default()).await.unwrap_err();
    assert!(err.to_string().contains("a name or selector must be specified"));
}
