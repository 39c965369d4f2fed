#![forbid(unsafe_code)]

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use ranch_core::{ApiEvent, ApiRequest, ApiSchema, EventName, ProxyConfig, ProxyError, UserInfo, WatchRequest};
use ranch_kubehub::fake::{FakeClientFactory, FakeCluster};
use ranch_store::{ResourceStore, Store};
use serde_json::json;
use tokio::sync::mpsc;

fn setup() -> (FakeCluster, Store) {
    let cluster = FakeCluster::new();
    let store = Store::new(Arc::new(FakeClientFactory::new(cluster.clone())), ProxyConfig::default());
    (cluster, store)
}

fn req() -> ApiRequest {
    ApiRequest::default().with_user(UserInfo::new("alice").with_groups(["devs"])).with_namespace("ns")
}

fn configmaps() -> ApiSchema {
    ApiSchema::new("", "v1", "configmaps", "ConfigMap", true)
}

fn cm(name: &str) -> serde_json::Value {
    json!({"metadata": {"name": name, "namespace": "ns"}, "data": {"k": "v"}})
}

async fn next(rx: &mut mpsc::Receiver<ApiEvent>) -> Option<ApiEvent> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.expect("timed out waiting for event")
}

#[tokio::test]
async fn delete_twice_is_no_content() {
    let (cluster, store) = setup();
    cluster.apply("configmap", cm("gone"));
    assert_eq!(store.delete(&req(), &configmaps(), "ns/gone").await.unwrap(), None);
    assert_eq!(store.delete(&req(), &configmaps(), "ns/gone").await.unwrap(), None);
}

#[tokio::test]
async fn delete_reports_objects_held_by_finalizers() {
    let (cluster, store) = setup();
    let mut held = cm("held");
    held["metadata"]["finalizers"] = json!(["example.com/keep"]);
    cluster.apply("configmap", held);
    let obj = store.delete(&req(), &configmaps(), "held").await.unwrap().expect("object still present");
    assert_eq!(obj.id, "ns/held");
    assert!(obj.object.pointer("/metadata/deletionTimestamp").is_some());
}

#[tokio::test]
async fn delete_propagates_other_failures() {
    let (cluster, store) = setup();
    cluster.apply("configmap", cm("x"));
    cluster.fail("delete", "ns", ProxyError::Upstream { code: 403, reason: "Forbidden".into(), message: "no".into() });
    let err = store.delete(&req(), &configmaps(), "x").await.unwrap_err();
    assert_eq!(err.status_code(), 403);
}

#[tokio::test]
async fn create_fills_defaults() {
    let (_cluster, store) = setup();
    let obj = store.create(&req(), &configmaps(), json!({"data": {"a": "1"}})).await.unwrap();
    assert!(obj.name().starts_with("c-"), "name={}", obj.name());
    assert_eq!(obj.namespace(), Some("ns"));
    assert_eq!(obj.object["apiVersion"], "v1");
    assert_eq!(obj.object["kind"], "ConfigMap");

    let named = store.create(&req(), &configmaps(), json!({"metadata": {"name": "fixed", "namespace": "other"}})).await.unwrap();
    assert_eq!(named.id, "other/fixed");

    let unscoped = ApiRequest::default().with_user(UserInfo::new("alice"));
    let err = store.create(&unscoped, &configmaps(), json!({"metadata": {"name": "x"}})).await.unwrap_err();
    assert!(matches!(err, ProxyError::BadRequest(_)));
}

#[tokio::test]
async fn put_requires_resource_version() {
    let (cluster, store) = setup();
    let stored = cluster.apply("configmap", cm("a"));
    let put = ApiRequest { method: http::Method::PUT, ..req() };

    let err = store.update(&put, &configmaps(), "a", json!({"metadata": {"name": "a"}, "data": {}})).await.unwrap_err();
    assert!(matches!(err, ProxyError::BadRequest(ref m) if m.contains("resourceVersion")), "{:?}", err);

    let mut body = stored.clone();
    body["data"] = json!({"k": "changed"});
    let obj = store.update(&put, &configmaps(), "a", body).await.unwrap();
    assert_eq!(obj.object["data"]["k"], "changed");
}

#[tokio::test]
async fn patch_content_type_selects_patch_kind() {
    let (cluster, store) = setup();
    cluster.apply("configmap", cm("p"));
    let patch = ApiRequest { method: http::Method::PATCH, ..req() };

    let merged = store.update(&patch, &configmaps(), "p", json!({"data": {"extra": "1"}})).await.unwrap();
    assert_eq!(merged.object["data"], json!({"k": "v", "extra": "1"}));

    let json_patch = patch
        .clone()
        .with_header(http::header::CONTENT_TYPE, "application/json-patch+json")
        .unwrap();
    let ops = json!([{"op": "remove", "path": "/data/k"}]);
    let patched = store.update(&json_patch, &configmaps(), "p", ops).await.unwrap();
    assert_eq!(patched.object["data"], json!({"extra": "1"}));
}

#[tokio::test]
async fn by_id_resolves_namespace_and_kind_scope() {
    let (cluster, store) = setup();
    cluster.apply("configmap", cm("a"));
    cluster.apply("node", json!({"metadata": {"name": "n1"}}));
    let got = store.by_id(&req(), &configmaps(), "ns/a").await.unwrap();
    assert_eq!(got.id, "ns/a");
    let nodes = ApiSchema::new("", "v1", "nodes", "Node", false);
    let node = store.by_id(&req(), &nodes, "n1").await.unwrap();
    assert_eq!(node.id, "n1");
    assert_eq!(node.type_name, "node");
    assert!(store.by_id(&req(), &configmaps(), "missing").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn list_copies_page_state_and_skips_bad_objects() {
    let (cluster, store) = setup();
    for n in ["a", "b", "c"] {
        cluster.apply("configmap", cm(n));
    }
    let paged = req().with_param("limit", "2");
    let page = store.list(&paged, &configmaps()).await.unwrap();
    assert_eq!(page.objects.len(), 2);
    assert!(!page.continue_token.is_empty());
    assert_eq!(page.revision, cluster.revision());

    // no metadata.name: dropped from the listing
    cluster.apply("configmap", json!({"metadata": {"namespace": "ns"}}));

    let all = store.list(&req(), &configmaps()).await.unwrap();
    let ids: Vec<_> = all.objects.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, vec!["ns/a", "ns/b", "ns/c"]);
}

#[tokio::test]
async fn watch_from_list_snapshot_sees_only_new_changes() {
    let (cluster, store) = setup();
    cluster.apply("configmap", cm("old"));
    let mut rx = store.watch(&req(), &configmaps(), WatchRequest::default()).await.unwrap();
    cluster.apply("configmap", cm("new"));
    let ev = next(&mut rx).await.unwrap();
    assert_eq!(ev.name, EventName::Create);
    assert_eq!(ev.object.unwrap().id, "ns/new");
}

#[tokio::test]
async fn watch_at_revision_replays_and_from_now_does_not() {
    let (cluster, store) = setup();
    cluster.apply("configmap", cm("a"));
    let rev = cluster.revision();
    cluster.apply("configmap", cm("b"));

    let mut replay = store.watch(&req(), &configmaps(), WatchRequest::at(rev)).await.unwrap();
    assert_eq!(next(&mut replay).await.unwrap().object.unwrap().id, "ns/b");

    let mut now = store.watch(&req(), &configmaps(), WatchRequest::from_now()).await.unwrap();
    cluster.remove("configmap", "ns", "a");
    let ev = next(&mut now).await.unwrap();
    assert_eq!(ev.name, EventName::Remove);
    assert_eq!(ev.object.unwrap().id, "ns/a");
}

#[tokio::test]
async fn watch_absorbs_error_events_and_gates_bookmarks() {
    let (cluster, store) = setup();
    let mut plain = store.watch(&req(), &configmaps(), WatchRequest::from_now()).await.unwrap();
    let with_marks = req().with_param("allowWatchBookmarks", "true");
    let mut marked = store.watch(&with_marks, &configmaps(), WatchRequest::from_now()).await.unwrap();

    cluster.inject_watch_error("configmap", "too old resource version");
    cluster.send_bookmarks("configmap");
    cluster.apply("configmap", cm("after"));

    let ev = next(&mut plain).await.unwrap();
    assert_eq!(ev.name, EventName::Create);

    let ev = next(&mut marked).await.unwrap();
    assert_eq!(ev.name, EventName::Bookmark);
    assert!(ev.object.is_none());
    assert_eq!(next(&mut marked).await.unwrap().name, EventName::Create);
}

#[tokio::test]
async fn watch_stream_failure_is_delivered_then_closes() {
    let (cluster, store) = setup();
    let mut rx = store.watch(&req(), &configmaps(), WatchRequest::from_now()).await.unwrap();
    cluster.break_watches("configmap", "ns", ProxyError::Upstream { code: 500, reason: "InternalError".into(), message: "boom".into() });
    let ev = next(&mut rx).await.unwrap();
    assert_eq!(ev.name, EventName::Error);
    assert_eq!(ev.error.unwrap().status_code(), 500);
    assert!(next(&mut rx).await.is_none());
}

#[tokio::test]
async fn cancelling_the_request_closes_the_watch() {
    let (cluster, store) = setup();
    let r = req();
    let mut rx = store.watch(&r, &configmaps(), WatchRequest::from_now()).await.unwrap();
    assert_eq!(cluster.active_watches("configmap"), 1);
    r.cancel.cancel();
    assert!(next(&mut rx).await.is_none());
    assert_eq!(cluster.active_watches("configmap"), 0);
}

#[tokio::test]
async fn watch_names_filters_events() {
    let (cluster, store) = setup();
    let names: BTreeSet<String> = ["keep".to_string(), "also".to_string()].into();
    let mut rx = store.watch_names(&req(), &configmaps(), WatchRequest::from_now(), &names).await.unwrap();
    cluster.apply("configmap", cm("drop"));
    cluster.apply("configmap", cm("keep"));
    let ev = next(&mut rx).await.unwrap();
    assert_eq!(ev.object.unwrap().id, "ns/keep");
}
