#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kassert_core::{ClusterError, FnError, Gvk, Value};
use kassert_functions::{client_value, config_value, FunctionLibrary};
use kassert_kubehub::mock::{mock_config, MockClientBuilder, MockClusterClient, StaticDirectory};
use kassert_kubehub::{DataClusterFactory, FactorySettings, SharedClient};
use serde_json::json;

struct World {
    lib: FunctionLibrary,
    clients: Vec<(String, Arc<MockClusterClient>)>,
}

impl World {
    fn new(clusters: &[&str]) -> Self {
        let mut builder = MockClientBuilder::new().with_client("control", Arc::new(MockClusterClient::new()));
        let mut clients = Vec::new();
        for c in clusters {
            let client = Arc::new(MockClusterClient::new());
            builder = builder.with_client(c, client.clone());
            clients.push((c.to_string(), client));
        }
        let factory = DataClusterFactory::new(Arc::new(StaticDirectory::with_clusters(clusters)), Arc::new(builder), FactorySettings::default());
        Self { lib: FunctionLibrary::new(Arc::new(factory)), clients }
    }

    fn client(&self, name: &str) -> &Arc<MockClusterClient> {
        &self.clients.iter().find(|(n, _)| n == name).expect("cluster").1
    }

    async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, FnError> {
        self.lib.caller().call(name, args).await
    }
}

fn control() -> Value {
    config_value(mock_config("control"))
}

fn bound(client: &Arc<MockClusterClient>) -> Value {
    client_value(client.clone() as SharedClient)
}

fn pod(name: &str, ns: &str, phase: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": name, "namespace": ns, "labels": {"app": "web"}},
        "status": {"phase": phase},
    })
}

fn s(v: &str) -> Value {
    Value::string(v)
}

#[tokio::test]
async fn exists_is_false_for_absent_objects() {
    let client = Arc::new(MockClusterClient::new());
    client.insert(pod("web-0", "default", "Running"));
    let w = World::new(&[]);

    let found = w.call("x_k8s_exists", vec![bound(&client), s("v1"), s("Pod"), s("default"), s("web-0")]).await.unwrap();
    assert_eq!(found.as_json(), Some(&json!(true)));
    let missing = w.call("x_k8s_exists", vec![bound(&client), s("v1"), s("Pod"), s("default"), s("web-9")]).await.unwrap();
    assert_eq!(missing.as_json(), Some(&json!(false)));

    let err = w.call("x_k8s_get", vec![bound(&client), s("v1"), s("Pod"), s("default"), s("web-9")]).await.unwrap_err();
    assert!(err.is_not_found());

    client.fail_with(Some(ClusterError::Api { code: 500, message: "boom".into() }));
    let err = w.call("x_k8s_exists", vec![bound(&client), s("v1"), s("Pod"), s("default"), s("web-0")]).await.unwrap_err();
    assert!(err.to_string().contains("boom"));
}

#[tokio::test]
async fn resource_exists_and_list() {
    let client = Arc::new(MockClusterClient::new());
    client.insert(pod("web-0", "a", "Running")).insert(pod("web-1", "b", "Running"));
    let w = World::new(&[]);

    let yes = w.call("x_k8s_resource_exists", vec![bound(&client), s("v1"), s("Pod")]).await.unwrap();
    assert_eq!(yes.as_json(), Some(&json!(true)));
    let no = w.call("x_k8s_resource_exists", vec![bound(&client), s("example.dev/v1"), s("Widget")]).await.unwrap();
    assert_eq!(no.as_json(), Some(&json!(false)));

    let all = w.call("x_k8s_list", vec![bound(&client), s("v1"), s("Pod")]).await.unwrap();
    assert_eq!(all.as_json().unwrap()["items"].as_array().unwrap().len(), 2);
    assert_eq!(all.as_json().unwrap()["kind"], json!("PodList"));
    let one = w.call("x_k8s_list", vec![bound(&client), s("v1"), s("Pod"), s("b")]).await.unwrap();
    assert_eq!(one.as_json().unwrap()["items"][0]["metadata"]["name"], json!("web-1"));
}

#[tokio::test]
async fn server_version_rejects_nil_config() {
    let w = World::new(&[]);
    let err = w.call("x_k8s_server_version", vec![Value::null()]).await.unwrap_err();
    assert!(matches!(err, FnError::NilConfig));
    let v = w.call("x_k8s_server_version", vec![control()]).await.unwrap();
    assert_eq!(v.as_json().unwrap()["major"], json!("1"));
}

#[tokio::test]
async fn argument_checks() {
    let w = World::new(&[]);
    let err = w.call("x_k8s_get", vec![Value::null(), s("v1")]).await.unwrap_err();
    assert!(matches!(err, FnError::Arity { .. }));
    let err = w.call("trim_space", vec![Value::Json(json!(1))]).await.unwrap_err();
    assert!(matches!(err, FnError::InvalidType { index: 0, .. }));
    let err = w.call("x_k8s_list", vec![s("not a client"), s("v1"), s("Pod")]).await.unwrap_err();
    assert!(matches!(err, FnError::InvalidType { index: 0, .. }));
    assert!(matches!(w.call("nope", vec![]).await.unwrap_err(), FnError::UnknownFunction(_)));
}

#[tokio::test]
async fn catalogs_are_split() {
    let w = World::new(&[]);
    let all = w.lib.caller().names();
    let inner = w.lib.inner_caller().names();
    assert!(all.contains(&"x_k8s_wait".to_string()));
    assert!(all.contains(&"x_data_cluster_wait".to_string()));
    assert!(!inner.contains(&"x_k8s_wait".to_string()));
    assert!(inner.contains(&"env".to_string()));
    assert_eq!(all.len(), inner.len() + 2);
}

#[tokio::test]
async fn multi_cluster_list_skips_not_found() {
    let w = World::new(&["a", "b", "c"]);
    w.client("a").insert(pod("a-0", "ns", "Running")).insert(pod("a-1", "ns", "Running"));
    w.client("b").fail_with(Some(ClusterError::not_found("Pod", "")));
    w.client("c").insert(pod("c-0", "ns", "Running"));

    let init = w.call("x_data_cluster_init", vec![control(), s("a,b,c"), s("v1"), s("Pod")]).await.unwrap();
    assert_eq!(init.as_str(), Some("a,b,c"));

    let out = w.call("x_data_cluster_list", vec![control(), s("a,b,c"), s("v1"), s("Pod"), s("ns"), s("app=web")]).await.unwrap();
    let names: Vec<&str> =
        out.as_json().unwrap()["items"].as_array().unwrap().iter().map(|i| i["metadata"]["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["a-0", "a-1", "c-0"]);
}

#[tokio::test]
async fn multi_cluster_list_fails_on_other_errors() {
    let w = World::new(&["a", "b"]);
    w.client("a").map_kind(&Gvk::from_api_version("v1", "Pod").unwrap());
    w.client("b").fail_with(Some(ClusterError::Api { code: 403, message: "forbidden".into() }));
    w.call("x_data_cluster_init", vec![control(), s("a,b"), s("v1"), s("Pod")]).await.unwrap();

    let err = w.call("x_data_cluster_list", vec![control(), s("a,b"), s("v1"), s("Pod")]).await.unwrap_err();
    assert!(err.to_string().contains("cluster: b, err: api error (403): forbidden"));
}

#[tokio::test]
async fn data_client_requires_init() {
    let w = World::new(&["a"]);
    let err = w.call("x_data_k8s_client", vec![control(), s("a"), s("v1"), s("Pod")]).await.unwrap_err();
    assert_eq!(err.to_string(), "a v1 Pod client not found");

    w.call("x_data_cluster_init", vec![control(), s("a"), s("v1"), s("Pod")]).await.unwrap();
    w.client("a").insert(pod("a-0", "ns", "Running"));
    let handle = w.call("x_data_k8s_client", vec![control(), s("a"), s("v1"), s("Pod")]).await.unwrap();
    let got = w.call("x_data_k8s_get", vec![handle.clone(), s("v1"), s("Pod"), s("ns"), s("a-0")]).await.unwrap();
    assert_eq!(got.as_json().unwrap()["status"]["phase"], json!("Running"));
    let listed = w.call("x_data_k8s_list", vec![handle, s("v1"), s("Pod"), s(""), s("app=db")]).await.unwrap();
    assert!(listed.as_json().unwrap()["items"].as_array().unwrap().is_empty());

    w.call("x_data_cluster_clean", vec![control(), s("a"), s("v1"), s("Pod")]).await.unwrap();
    assert!(w.lib.data_clusters().get_client("a").is_none());
}

#[tokio::test]
async fn namespace_errors_name_the_cluster() {
    let w = World::new(&["a", "b"]);
    let out = w.call("x_data_cluster_create_namespace", vec![control(), s("a,b"), s("team")]).await.unwrap();
    assert_eq!(out.as_str(), Some("a,b"));
    assert_eq!(w.client("b").namespaces(), vec!["team".to_string()]);

    let err = w.call("x_data_cluster_create_namespace", vec![control(), s("b"), s("team")]).await.unwrap_err();
    assert!(err.to_string().starts_with("cluster: b, err: "));

    w.call("x_data_cluster_delete_namespace", vec![control(), s("a,b"), s("team")]).await.unwrap();
    let err = w.call("x_data_cluster_delete_namespace", vec![control(), s("a"), s("team")]).await.unwrap_err();
    assert!(err.to_string().starts_with("delete ns in cluster: a, err: "));

    let err = w.call("x_data_cluster_create_namespace", vec![Value::null(), s("a"), s("team")]).await.unwrap_err();
    assert!(matches!(err, FnError::NilConfig));
}

#[tokio::test]
async fn server_versions_interleave_in_cluster_order() {
    let w = World::new(&["a", "b"]);
    w.client("a").set_version(json!({"gitVersion": "v1.28.1"}));
    w.client("b").set_version(json!({"gitVersion": "v1.29.4"}));
    let out = w.call("x_data_cluster_server_version", vec![control(), s("b,a")]).await.unwrap();
    assert_eq!(out.as_json().unwrap(), &json!(["b", {"gitVersion": "v1.29.4"}, "a", {"gitVersion": "v1.28.1"}]));
}

#[tokio::test]
async fn patch_merges_every_matched_item() {
    let w = World::new(&["a", "b"]);
    w.client("a").insert(pod("a-0", "ns", "Running"));
    w.client("b").insert(pod("b-0", "ns", "Running")).insert(pod("b-1", "ns", "Running"));
    w.call("x_data_cluster_init", vec![control(), s("a,b"), s("v1"), s("Pod")]).await.unwrap();

    let patch = r#"{"metadata": {"labels": {"patched": "yes"}}}"#;
    w.call("x_data_cluster_patch", vec![control(), s("a,b"), s("v1"), s("Pod"), s("ns"), s("app=web"), s(patch)]).await.unwrap();

    let gvk = Gvk::from_api_version("v1", "Pod").unwrap();
    for (cluster, name) in [("a", "a-0"), ("b", "b-0"), ("b", "b-1")] {
        let obj = w.client(cluster).object(&gvk, "ns", name).unwrap();
        assert_eq!(obj["metadata"]["labels"]["patched"], json!("yes"));
        assert_eq!(obj["metadata"]["labels"]["app"], json!("web"));
    }
}

#[tokio::test(start_paused = true)]
async fn k8s_wait_succeeds_on_third_tick() {
    let w = World::new(&[]);
    let client = Arc::new(MockClusterClient::new());
    client.script_lists(vec![
        Ok(vec![pod("web-0", "ns", "Pending")]),
        Ok(vec![pod("web-0", "ns", "Pending")]),
        Ok(vec![pod("web-0", "ns", "Running")]),
    ]);

    let t0 = tokio::time::Instant::now();
    let out = w
        .call("x_k8s_wait", vec![bound(&client), s("v1"), s("Pod"), s("ns"), s("items[0].status.phase"), s("Running")])
        .await
        .unwrap();
    assert_eq!(out.as_json(), Some(&json!(true)));
    assert_eq!(t0.elapsed(), Duration::from_secs(2));
    assert_eq!(client.list_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn k8s_wait_times_out_without_error() {
    let w = World::new(&[]);
    let client = Arc::new(MockClusterClient::new());
    client.insert(pod("web-0", "ns", "Pending"));

    let t0 = tokio::time::Instant::now();
    let out = w
        .call("x_k8s_wait", vec![bound(&client), s("v1"), s("Pod"), s("ns"), s("items[0].status.phase"), s("Running")])
        .await
        .unwrap();
    assert_eq!(out.as_json(), Some(&json!(false)));
    assert_eq!(t0.elapsed(), Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn k8s_wait_fails_fast_on_query_error() {
    let w = World::new(&[]);
    let client = Arc::new(MockClusterClient::new());
    client.script_lists(vec![Ok(vec![]), Err(ClusterError::Api { code: 500, message: "down".into() })]);

    let err = w.call("x_k8s_wait", vec![bound(&client), s("v1"), s("Pod"), s(""), s("items[0]"), s("x")]).await.unwrap_err();
    assert!(err.to_string().contains("down"));
    assert_eq!(client.list_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn data_cluster_wait_reads_backticks_as_quotes() {
    let w = World::new(&["a"]);
    w.client("a").insert(pod("a-0", "ns", "Running"));
    w.call("x_data_cluster_init", vec![control(), s("a"), s("v1"), s("Pod")]).await.unwrap();

    let args = vec![control(), s("a"), s("v1"), s("Pod"), s("ns"), s(""), s("`ok`"), s("ok")];
    let out = w.call("x_data_cluster_wait", args).await.unwrap();
    assert_eq!(out.as_json(), Some(&json!(true)));

    let args = vec![control(), s("a"), s("v1"), s("Pod"), s("ns"), s(""), s("items[0].status.phase"), s("Running")];
    assert_eq!(w.call("x_data_cluster_wait", args).await.unwrap().as_json(), Some(&json!(true)));
}

#[tokio::test]
async fn table_print_returns_empty_string() {
    let w = World::new(&[]);
    let out = w.call("table_print", vec![Value::Json(json!({"items": [pod("web-0", "ns", "Running")]}))]).await.unwrap();
    assert_eq!(out.as_str(), Some(""));
}
