//! Ranch kubehub: per-request resource clients for the backing cluster.
//!
//! The proxy layers talk to the cluster only through [`ResourceClient`], obtained from a
//! [`ClientFactory`]. Documents cross this boundary as raw JSON; kube types stay inside
//! the kube-backed implementation.

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value as Json;

use ranch_core::{ApiRequest, ApiSchema, ListQuery, ProxyError, ProxyResult};

mod client;
mod discovery;
mod impersonate;

#[cfg(any(test, feature = "fake"))]
pub mod fake;

pub use client::{map_kube_err, KubeClientFactory, KubeResourceClient};
pub use discovery::{api_resource, discover_schemas, find_schema, parse_gvk_key};
pub use impersonate::ImpersonateLayer;

/// One page of a backing list call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
    pub items: Vec<Json>,
    pub revision: String,
    pub continue_token: String,
}

/// Event from a backing watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Added(Json),
    Modified(Json),
    Deleted(Json),
    Bookmark(String),
    /// In-band error status from the server (e.g. expired resource version).
    Error(String),
}

pub type EventStream = BoxStream<'static, ProxyResult<BackendEvent>>;

/// Partial update body.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchBody {
    Strategic(Json),
    /// RFC 6902 operations array.
    Json(Json),
}

/// Resource-scoped client for one schema. `namespace` is `None` for cluster-scoped kinds
/// or to address every namespace.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self, namespace: Option<&str>, name: &str, resource_version: Option<&str>) -> ProxyResult<Json>;

    async fn list(&self, namespace: Option<&str>, query: &ListQuery) -> ProxyResult<ListPage>;

    /// Open a watch starting at `query.resource_version` (`None` = now), bounded server-side
    /// by `timeout_secs`.
    async fn watch(&self, namespace: Option<&str>, query: &ListQuery, timeout_secs: u64) -> ProxyResult<EventStream>;

    async fn create(&self, namespace: Option<&str>, object: Json) -> ProxyResult<Json>;

    async fn replace(&self, namespace: Option<&str>, name: &str, object: Json) -> ProxyResult<Json>;

    async fn patch(&self, namespace: Option<&str>, name: &str, patch: PatchBody) -> ProxyResult<Json>;

    async fn delete(&self, namespace: Option<&str>, name: &str) -> ProxyResult<()>;
}

/// Resolves resource clients. Returned clients are request-scoped; callers must not
/// cache them across identities.
pub trait ClientFactory: Send + Sync {
    /// Client acting for the caller of `request`.
    fn client(&self, request: &ApiRequest, schema: &ApiSchema) -> ProxyResult<Arc<dyn ResourceClient>>;

    /// The proxy's own client, for reads the caller's identity cannot perform directly
    /// (name-bounded grants).
    fn admin_client(&self, schema: &ApiSchema) -> ProxyResult<Arc<dyn ResourceClient>>;
}

/// Caller identity required in impersonation mode.
pub fn require_user(request: &ApiRequest) -> ProxyResult<&ranch_core::UserInfo> {
    request
        .user
        .as_ref()
        .filter(|u| !u.name.is_empty())
        .ok_or_else(|| ProxyError::Unauthenticated("no user identity on request".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranch_core::UserInfo;

    #[test]
    fn require_user_rejects_missing_or_empty_names() {
        let anon = ApiRequest::default();
        assert!(matches!(require_user(&anon), Err(ProxyError::Unauthenticated(_))));
        let empty = ApiRequest::default().with_user(UserInfo::new(""));
        assert!(matches!(require_user(&empty), Err(ProxyError::Unauthenticated(_))));
        let bob = ApiRequest::default().with_user(UserInfo::new("bob"));
        assert_eq!(require_user(&bob).unwrap().name, "bob");
    }
}
