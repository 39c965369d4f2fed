//! Ranch core types: request/response model shared by the proxy layers.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;

pub mod access;
pub mod config;
pub mod error;
pub mod query;

pub use access::{AccessGrant, AccessListByVerb, NamespaceAccess, Partition};
pub use config::ProxyConfig;
pub use error::{ProxyError, ProxyResult};
pub use query::ListQuery;

pub mod prelude {
    pub use super::{
        AccessGrant, AccessListByVerb, ApiEvent, ApiObject, ApiObjectList, ApiRequest, ApiSchema, EventName,
        ListQuery, NamespaceAccess, Partition, ProxyConfig, ProxyError, ProxyResult, UserInfo, WatchRequest,
    };
}

/// Content type selecting RFC 6902 JSON patch for PATCH requests.
pub const JSON_PATCH_CONTENT_TYPE: &str = "application/json-patch+json";

/// Authenticated caller identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, Vec<String>>,
}

impl UserInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.extra.insert(key.into(), values);
        self
    }
}

/// Caller-bound request context for one inbound call.
///
/// `cancel` is the root of cancellation for everything the call starts; cancelling it
/// tears down partitioned lists and every partition watch.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: http::Method,
    pub namespace: Option<String>,
    pub query: BTreeMap<String, String>,
    pub headers: http::HeaderMap,
    pub user: Option<UserInfo>,
    /// Namespaces an upstream layer restricts this call to (e.g. members of a project).
    /// `None` means no restriction.
    pub allowed_namespaces: Option<BTreeSet<String>>,
    pub cancel: CancellationToken,
}

impl Default for ApiRequest {
    fn default() -> Self {
        Self::new(http::Method::GET)
    }
}

impl ApiRequest {
    pub fn new(method: http::Method) -> Self {
        Self {
            method,
            namespace: None,
            query: BTreeMap::new(),
            headers: http::HeaderMap::new(),
            user: None,
            allowed_namespaces: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let ns = namespace.into();
        self.namespace = if ns.is_empty() { None } else { Some(ns) };
        self
    }

    pub fn with_user(mut self, user: UserInfo) -> Self {
        self.user = Some(user);
        self
    }

    /// Merge a raw `a=b&c=d` query string; later keys win.
    pub fn with_query(mut self, raw: &str) -> Self {
        for (k, v) in form_urlencoded::parse(raw.trim_start_matches('?').as_bytes()) {
            self.query.insert(k.into_owned(), v.into_owned());
        }
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: http::header::HeaderName, value: &str) -> ProxyResult<Self> {
        let value = http::HeaderValue::from_str(value)
            .map_err(|e| ProxyError::BadRequest(format!("invalid header {}: {}", name, e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_allowed_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_namespaces = Some(namespaces.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim())
    }

    pub fn is_patch(&self) -> bool {
        self.method == http::Method::PATCH
    }

    /// Shallow copy scoped to another namespace (`None` = unscoped).
    pub fn scoped(&self, namespace: Option<&str>) -> Self {
        let mut req = self.clone();
        req.namespace = namespace.filter(|ns| !ns.is_empty()).map(str::to_string);
        req
    }

    /// Decode list/watch options from the query string.
    pub fn list_query(&self) -> ProxyResult<ListQuery> {
        ListQuery::from_params(&self.query)
    }
}

/// Static per-kind descriptor plus the caller's resolved grants for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSchema {
    pub id: String,
    pub group: String,
    pub version: String,
    /// Plural resource name used in URLs.
    pub resource: String,
    pub kind: String,
    pub namespaced: bool,
    #[serde(default)]
    pub access: AccessListByVerb,
}

impl ApiSchema {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
        kind: impl Into<String>,
        namespaced: bool,
    ) -> Self {
        let group = group.into();
        let kind = kind.into();
        let id = if group.is_empty() {
            kind.to_lowercase()
        } else {
            format!("{}.{}", group, kind.to_lowercase())
        };
        Self { id, group, version: version.into(), resource: resource.into(), kind, namespaced, access: AccessListByVerb::default() }
    }

    pub fn with_access(mut self, access: AccessListByVerb) -> Self {
        self.access = access;
        self
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

/// Build the object id: `name` for cluster-scoped objects, `namespace/name` otherwise.
pub fn object_id(namespace: Option<&str>, name: &str) -> String {
    match namespace.filter(|ns| !ns.is_empty()) {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    }
}

/// Split an id produced by [`object_id`].
pub fn split_id(id: &str) -> (Option<&str>, &str) {
    match id.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, id),
    }
}

fn meta_str<'a>(doc: &'a Json, key: &str) -> Option<&'a str> {
    doc.get("metadata").and_then(|m| m.get(key)).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

/// A resource as handed to callers: schema type, id and the raw document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiObject {
    #[serde(rename = "type")]
    pub type_name: String,
    pub id: String,
    pub object: Json,
}

impl ApiObject {
    /// Wrap a raw document, deriving the id from its metadata.
    pub fn from_document(type_name: &str, object: Json) -> ProxyResult<Self> {
        let name = meta_str(&object, "name")
            .ok_or_else(|| ProxyError::Internal(format!("{} object missing metadata.name", type_name)))?;
        let id = object_id(meta_str(&object, "namespace"), name);
        Ok(Self { type_name: type_name.to_string(), id, object })
    }

    pub fn name(&self) -> &str {
        meta_str(&self.object, "name").unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        meta_str(&self.object, "namespace")
    }

    pub fn resource_version(&self) -> Option<&str> {
        meta_str(&self.object, "resourceVersion")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiObjectList {
    pub objects: Vec<ApiObject>,
    /// Resource-version watermark of the listing.
    #[serde(default)]
    pub revision: String,
    /// Opaque cursor; empty at end of list.
    #[serde(default, rename = "continue")]
    pub continue_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventName {
    #[serde(rename = "resource.create")]
    Create,
    #[serde(rename = "resource.change")]
    Change,
    #[serde(rename = "resource.remove")]
    Remove,
    #[serde(rename = "resource.bookmark")]
    Bookmark,
    #[serde(rename = "resource.error")]
    Error,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Create => "resource.create",
            EventName::Change => "resource.change",
            EventName::Remove => "resource.remove",
            EventName::Bookmark => "resource.bookmark",
            EventName::Error => "resource.error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEvent {
    pub name: EventName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ApiObject>,
    #[serde(default)]
    pub revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProxyError>,
}

impl ApiEvent {
    pub fn object(name: EventName, object: ApiObject) -> Self {
        let revision = object.resource_version().unwrap_or_default().to_string();
        Self { name, object: Some(object), revision, error: None }
    }

    pub fn bookmark(revision: impl Into<String>) -> Self {
        Self { name: EventName::Bookmark, object: None, revision: revision.into(), error: None }
    }

    pub fn error(error: ProxyError) -> Self {
        Self { name: EventName::Error, object: None, revision: String::new(), error: Some(error) }
    }
}

/// Starting point of a watch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRequest {
    /// `""` starts from a fresh list snapshot, `"-1"` from now, anything else from that version.
    #[serde(default)]
    pub revision: String,
    /// Optional label selector.
    #[serde(default)]
    pub selector: Option<String>,
}

impl WatchRequest {
    pub const FROM_NOW: &'static str = "-1";

    pub fn at(revision: impl Into<String>) -> Self {
        Self { revision: revision.into(), selector: None }
    }

    pub fn from_now() -> Self {
        Self::at(Self::FROM_NOW)
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_follow_scope() {
        assert_eq!(object_id(Some("ns"), "a"), "ns/a");
        assert_eq!(object_id(None, "a"), "a");
        assert_eq!(object_id(Some(""), "a"), "a");
        assert_eq!(split_id("ns/a"), (Some("ns"), "a"));
        assert_eq!(split_id("a"), (None, "a"));
    }

    #[test]
    fn api_object_from_document() {
        let obj = ApiObject::from_document(
            "configmap",
            json!({"metadata": {"name": "x", "namespace": "ns-a", "resourceVersion": "12"}}),
        )
        .unwrap();
        assert_eq!(obj.id, "ns-a/x");
        assert_eq!(obj.name(), "x");
        assert_eq!(obj.resource_version(), Some("12"));

        let err = ApiObject::from_document("configmap", json!({"metadata": {}})).unwrap_err();
        assert!(err.to_string().contains("missing metadata.name"), "err={}", err);
    }

    #[test]
    fn request_query_and_content_type() {
        let req = ApiRequest::new(http::Method::PATCH)
            .with_query("?limit=5&continue=abc&labelSelector=app%3Dweb")
            .with_header(http::header::CONTENT_TYPE, "application/json-patch+json; charset=utf-8")
            .unwrap();
        assert_eq!(req.param("limit"), Some("5"));
        assert_eq!(req.param("labelSelector"), Some("app=web"));
        assert_eq!(req.content_type(), Some(JSON_PATCH_CONTENT_TYPE));
        assert!(req.is_patch());
    }

    #[test]
    fn scoped_copy_shares_cancellation() {
        let req = ApiRequest::default().with_namespace("ns-a");
        let scoped = req.scoped(Some("ns-b"));
        assert_eq!(scoped.namespace.as_deref(), Some("ns-b"));
        assert_eq!(req.scoped(None).namespace, None);
        req.cancel.cancel();
        assert!(scoped.cancel.is_cancelled());
    }

    #[test]
    fn schema_ids() {
        let s = ApiSchema::new("apps", "v1", "deployments", "Deployment", true);
        assert_eq!(s.id, "apps.deployment");
        assert_eq!(s.api_version(), "apps/v1");
        let c = ApiSchema::new("", "v1", "configmaps", "ConfigMap", true);
        assert_eq!(c.id, "configmap");
        assert_eq!(c.api_version(), "v1");
    }

    #[test]
    fn event_names_serialize_with_prefix() {
        let ev = ApiEvent::error(ProxyError::Internal("boom".into()));
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["name"], "resource.error");
        assert_eq!(EventName::Remove.as_str(), "resource.remove");
    }
}
