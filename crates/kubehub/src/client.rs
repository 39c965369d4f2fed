//! kube-backed [`ResourceClient`] and [`ClientFactory`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{Api, ApiResource, DynamicObject},
    client::ClientBuilder,
    core::{
        params::{DeleteParams, GetParams, ListParams, Patch, PatchParams, PostParams, VersionMatch},
        WatchEvent,
    },
    Client, Config, Resource,
};
use serde_json::Value as Json;
use tracing::{debug, info};

use ranch_core::{ApiRequest, ApiSchema, ListQuery, ProxyError, ProxyResult, UserInfo};

use crate::{
    api_resource, impersonate::ImpersonateLayer, require_user, BackendEvent, ClientFactory, EventStream, ListPage,
    PatchBody, ResourceClient,
};

/// Map a kube client error onto the proxy taxonomy. API status errors keep their code.
pub fn map_kube_err(err: kube::Error) -> ProxyError {
    match err {
        kube::Error::Api(status) if status.code == 404 => ProxyError::NotFound(status.message),
        kube::Error::Api(status) => {
            ProxyError::Upstream { code: status.code, reason: status.reason, message: status.message }
        }
        other => ProxyError::Upstream { code: 502, reason: "BadGateway".into(), message: other.to_string() },
    }
}

fn to_json(obj: DynamicObject) -> ProxyResult<Json> {
    serde_json::to_value(obj).map_err(|e| ProxyError::Internal(format!("serializing object: {}", e)))
}

fn from_json(mut doc: Json) -> ProxyResult<DynamicObject> {
    if let Some(map) = doc.as_object_mut() {
        map.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
    }
    serde_json::from_value(doc).map_err(|e| ProxyError::BadRequest(format!("invalid object: {}", e)))
}

fn list_params(query: &ListQuery) -> ListParams {
    let mut lp = ListParams {
        label_selector: query.label_selector.clone(),
        field_selector: query.field_selector.clone(),
        timeout: query.timeout_seconds,
        limit: query.limit,
        continue_token: query.continue_token.clone(),
        ..Default::default()
    };
    // the server ignores resourceVersion on continued lists
    if lp.continue_token.is_none() {
        lp.resource_version = query.resource_version.clone();
        if lp.resource_version.is_some() {
            lp.version_match = match query.resource_version_match.as_deref() {
                Some("Exact") => Some(VersionMatch::Exact),
                Some("NotOlderThan") => Some(VersionMatch::NotOlderThan),
                _ => None,
            };
        }
    }
    lp
}

/// Query string of a watch call. Built by hand because kube's `WatchParams` caps the
/// server timeout below five minutes.
pub(crate) fn watch_query(query: &ListQuery, timeout_secs: u64) -> String {
    let mut qp = form_urlencoded::Serializer::new(String::new());
    qp.append_pair("watch", "true");
    qp.append_pair("timeoutSeconds", &timeout_secs.to_string());
    if query.allow_bookmarks {
        qp.append_pair("allowWatchBookmarks", "true");
    }
    if let Some(rv) = query.resource_version.as_deref() {
        qp.append_pair("resourceVersion", rv);
    }
    if let Some(labels) = query.label_selector.as_deref() {
        qp.append_pair("labelSelector", labels);
    }
    if let Some(fields) = query.field_selector.as_deref() {
        qp.append_pair("fieldSelector", fields);
    }
    qp.finish()
}

fn backend_event(ev: kube::Result<WatchEvent<DynamicObject>>) -> ProxyResult<BackendEvent> {
    match ev.map_err(map_kube_err)? {
        WatchEvent::Added(o) => Ok(BackendEvent::Added(to_json(o)?)),
        WatchEvent::Modified(o) => Ok(BackendEvent::Modified(to_json(o)?)),
        WatchEvent::Deleted(o) => Ok(BackendEvent::Deleted(to_json(o)?)),
        WatchEvent::Bookmark(b) => Ok(BackendEvent::Bookmark(b.metadata.resource_version)),
        WatchEvent::Error(status) => Ok(BackendEvent::Error(status.message)),
    }
}

pub struct KubeResourceClient {
    client: Client,
    ar: ApiResource,
}

impl KubeResourceClient {
    pub fn new(client: Client, schema: &ApiSchema) -> Self {
        Self { client, ar: api_resource(schema) }
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace.filter(|ns| !ns.is_empty()) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.ar),
            None => Api::all_with(self.client.clone(), &self.ar),
        }
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get(&self, namespace: Option<&str>, name: &str, resource_version: Option<&str>) -> ProxyResult<Json> {
        let gp = resource_version.map(GetParams::at).unwrap_or_default();
        let obj = self.api(namespace).get_with(name, &gp).await.map_err(map_kube_err)?;
        to_json(obj)
    }

    async fn list(&self, namespace: Option<&str>, query: &ListQuery) -> ProxyResult<ListPage> {
        let list = self.api(namespace).list(&list_params(query)).await.map_err(map_kube_err)?;
        let items = list.items.into_iter().map(to_json).collect::<ProxyResult<Vec<_>>>()?;
        Ok(ListPage {
            items,
            revision: list.metadata.resource_version.unwrap_or_default(),
            continue_token: list.metadata.continue_.unwrap_or_default(),
        })
    }

    async fn watch(&self, namespace: Option<&str>, query: &ListQuery, timeout_secs: u64) -> ProxyResult<EventStream> {
        let path = DynamicObject::url_path(&self.ar, namespace.filter(|ns| !ns.is_empty()));
        let uri = format!("{}?{}", path, watch_query(query, timeout_secs));
        let req = http::Request::get(uri)
            .body(Vec::new())
            .map_err(|e| ProxyError::Internal(format!("building watch request: {}", e)))?;
        let stream = self.client.request_events::<DynamicObject>(req).await.map_err(map_kube_err)?;
        debug!(kind = %self.ar.kind, ns = ?namespace, rv = ?query.resource_version, "kube: watch opened");
        Ok(stream.map(backend_event).boxed())
    }

    async fn create(&self, namespace: Option<&str>, object: Json) -> ProxyResult<Json> {
        let obj = from_json(object)?;
        let created = self.api(namespace).create(&PostParams::default(), &obj).await.map_err(map_kube_err)?;
        to_json(created)
    }

    async fn replace(&self, namespace: Option<&str>, name: &str, object: Json) -> ProxyResult<Json> {
        let obj = from_json(object)?;
        let replaced = self.api(namespace).replace(name, &PostParams::default(), &obj).await.map_err(map_kube_err)?;
        to_json(replaced)
    }

    async fn patch(&self, namespace: Option<&str>, name: &str, patch: PatchBody) -> ProxyResult<Json> {
        let pp = PatchParams::default();
        let api = self.api(namespace);
        let patched = match patch {
            PatchBody::Strategic(body) => api.patch(name, &pp, &Patch::Strategic(body)).await,
            PatchBody::Json(ops) => {
                let ops = serde_json::from_value(ops)
                    .map_err(|e| ProxyError::BadRequest(format!("invalid json patch: {}", e)))?;
                api.patch(name, &pp, &Patch::<Json>::Json(ops)).await
            }
        };
        to_json(patched.map_err(map_kube_err)?)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> ProxyResult<()> {
        self.api(namespace).delete(name, &DeleteParams::default()).await.map_err(map_kube_err)?;
        Ok(())
    }
}

/// Builds per-request kube clients from one base configuration.
///
/// In impersonation mode every call gets a fresh client acting as the caller; nothing is
/// cached across identities. The trusted client is the proxy's own identity.
pub struct KubeClientFactory {
    config: Config,
    trusted: Client,
    impersonate: bool,
}

impl KubeClientFactory {
    pub fn new(config: Config, impersonate: bool) -> ProxyResult<Self> {
        let trusted = Client::try_from(config.clone()).map_err(map_kube_err)?;
        Ok(Self { config, trusted, impersonate })
    }

    /// Load kubeconfig or in-cluster configuration.
    pub async fn infer(impersonate: bool) -> ProxyResult<Self> {
        let config = Config::infer()
            .await
            .map_err(|e| ProxyError::Internal(format!("loading kube config: {}", e)))?;
        info!(cluster = %config.cluster_url, impersonate, "kube: config loaded");
        Self::new(config, impersonate)
    }

    pub fn trusted(&self) -> Client {
        self.trusted.clone()
    }

    fn impersonated(&self, user: &UserInfo) -> ProxyResult<Client> {
        let layer = ImpersonateLayer::for_user(user)?;
        let builder = ClientBuilder::try_from(self.config.clone()).map_err(map_kube_err)?;
        Ok(builder.with_layer(&layer).build())
    }
}

impl ClientFactory for KubeClientFactory {
    fn client(&self, request: &ApiRequest, schema: &ApiSchema) -> ProxyResult<Arc<dyn ResourceClient>> {
        let client = if self.impersonate {
            let user = require_user(request)?;
            debug!(user = %user.name, groups = user.groups.len(), schema = %schema.id, "kube: impersonated client");
            self.impersonated(user)?
        } else {
            self.trusted.clone()
        };
        Ok(Arc::new(KubeResourceClient::new(client, schema)))
    }

    fn admin_client(&self, schema: &ApiSchema) -> ProxyResult<Arc<dyn ResourceClient>> {
        Ok(Arc::new(KubeResourceClient::new(self.trusted.clone(), schema)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_query_carries_long_timeout_and_selectors() {
        let q = ListQuery {
            resource_version: Some("41".into()),
            label_selector: Some("app=web".into()),
            allow_bookmarks: true,
            ..Default::default()
        };
        let qs = watch_query(&q, 1800);
        assert_eq!(qs, "watch=true&timeoutSeconds=1800&allowWatchBookmarks=true&resourceVersion=41&labelSelector=app%3Dweb");
        let bare = watch_query(&ListQuery::default(), 60);
        assert_eq!(bare, "watch=true&timeoutSeconds=60");
    }

    #[test]
    fn list_params_drop_version_when_continuing() {
        let q = ListQuery {
            limit: Some(5),
            continue_token: Some("abc".into()),
            resource_version: Some("10".into()),
            resource_version_match: Some("Exact".into()),
            ..Default::default()
        };
        let lp = list_params(&q);
        assert_eq!(lp.limit, Some(5));
        assert_eq!(lp.continue_token.as_deref(), Some("abc"));
        assert!(lp.resource_version.is_none());
        assert!(lp.version_match.is_none());

        let lp = list_params(&ListQuery { continue_token: None, ..q });
        assert_eq!(lp.resource_version.as_deref(), Some("10"));
        assert!(matches!(lp.version_match, Some(VersionMatch::Exact)));
    }

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(
            serde_json::from_value(serde_json::json!({
                "status": "Failure", "message": format!("{} happened", reason), "reason": reason, "code": code
            }))
            .unwrap(),
        )
    }

    #[test]
    fn kube_errors_keep_status() {
        assert!(matches!(map_kube_err(api_err(404, "NotFound")), ProxyError::NotFound(_)));
        match map_kube_err(api_err(403, "Forbidden")) {
            ProxyError::Upstream { code, reason, message } => {
                assert_eq!(code, 403);
                assert_eq!(reason, "Forbidden");
                assert_eq!(message, "Forbidden happened");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn objects_without_metadata_still_decode() {
        let obj = from_json(serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap", "data": {"a": "b"}})).unwrap();
        assert!(obj.metadata.name.is_none());
        assert!(from_json(serde_json::json!("nope")).is_err());
    }

    #[tokio::test]
    async fn trusted_factory_needs_no_caller() {
        let config = Config::new("http://127.0.0.1:6443".parse().unwrap());
        let schema = ApiSchema::new("", "v1", "configmaps", "ConfigMap", true);
        let anonymous = ApiRequest::default();
        let alice = ApiRequest::default().with_user(UserInfo::new("alice"));

        let trusted = KubeClientFactory::new(config.clone(), false).unwrap();
        assert!(trusted.client(&anonymous, &schema).is_ok());

        let impersonating = KubeClientFactory::new(config, true).unwrap();
        assert!(matches!(impersonating.client(&anonymous, &schema), Err(ProxyError::Unauthenticated(_))));
        assert!(impersonating.client(&alice, &schema).is_ok());
        assert!(impersonating.admin_client(&schema).is_ok());
    }
}
