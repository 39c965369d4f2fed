//! Ranch store: the single-cluster CRUD, List and Watch adapter.
//!
//! No access control happens here; every call is one backing call made with the client
//! the [`ClientFactory`] resolves for the request.

#![forbid(unsafe_code)]

use std::{collections::BTreeSet, sync::Arc, time::Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::{json, Value as Json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ranch_core::{
    split_id, ApiEvent, ApiObject, ApiObjectList, ApiRequest, ApiSchema, ListQuery, ProxyConfig, ProxyError,
    ProxyResult, WatchRequest, JSON_PATCH_CONTENT_TYPE,
};
use ranch_kubehub::{require_user, ClientFactory, PatchBody, ResourceClient};

mod watch;

/// Proxy operations on one schema, as served to callers.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn by_id(&self, req: &ApiRequest, schema: &ApiSchema, id: &str) -> ProxyResult<ApiObject>;

    async fn list(&self, req: &ApiRequest, schema: &ApiSchema) -> ProxyResult<ApiObjectList>;

    /// Event stream that closes once the producer has stopped, either on request
    /// cancellation or when the backing watch ends.
    async fn watch(&self, req: &ApiRequest, schema: &ApiSchema, w: WatchRequest) -> ProxyResult<mpsc::Receiver<ApiEvent>>;

    async fn create(&self, req: &ApiRequest, schema: &ApiSchema, data: Json) -> ProxyResult<ApiObject>;

    /// PUT replaces the object, PATCH applies `data` as a patch.
    async fn update(&self, req: &ApiRequest, schema: &ApiSchema, id: &str, data: Json) -> ProxyResult<ApiObject>;

    /// `None` means the object is gone (no content).
    async fn delete(&self, req: &ApiRequest, schema: &ApiSchema, id: &str) -> ProxyResult<Option<ApiObject>>;
}

pub struct Store {
    factory: Arc<dyn ClientFactory>,
    config: ProxyConfig,
}

/// Namespace a call is scoped to: the request's for namespaced kinds, none otherwise.
fn scope<'a>(req: &'a ApiRequest, schema: &ApiSchema) -> Option<&'a str> {
    if schema.namespaced { req.namespace.as_deref() } else { None }
}

fn meta<'a>(doc: &'a Json, key: &str) -> Option<&'a str> {
    doc.get("metadata").and_then(|m| m.get(key)).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

fn set_meta(doc: &mut Json, key: &str, value: &str) {
    if let Some(map) = doc.as_object_mut() {
        let m = map.entry("metadata").or_insert_with(|| json!({}));
        if let Some(m) = m.as_object_mut() {
            m.insert(key.to_string(), json!(value));
        }
    }
}

/// Fill in `apiVersion` and `kind` where the backing response left them out.
fn stamp_type(schema: &ApiSchema, doc: &mut Json) {
    if let Some(map) = doc.as_object_mut() {
        map.entry("apiVersion").or_insert_with(|| json!(schema.api_version()));
        map.entry("kind").or_insert_with(|| json!(schema.kind));
    }
}

pub(crate) fn to_object(schema: &ApiSchema, mut doc: Json) -> ProxyResult<ApiObject> {
    stamp_type(schema, &mut doc);
    ApiObject::from_document(&schema.id, doc)
}

/// Collection variant of [`to_object`]: undecodable documents are logged and dropped.
pub(crate) fn to_object_or_skip(schema: &ApiSchema, doc: Json) -> Option<ApiObject> {
    match to_object(schema, doc) {
        Ok(obj) => Some(obj),
        Err(e) => {
            warn!(schema = %schema.id, error = %e, "store: skipping undecodable object");
            counter!("proxy_object_decode_skipped_total", 1u64);
            None
        }
    }
}

impl Store {
    pub fn new(factory: Arc<dyn ClientFactory>, config: ProxyConfig) -> Self {
        Self { factory, config }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    fn client(&self, req: &ApiRequest, schema: &ApiSchema) -> ProxyResult<Arc<dyn ResourceClient>> {
        self.factory.client(req, schema)
    }

    /// Client for name-bounded reads. Impersonating proxies still need a caller.
    fn names_client(&self, req: &ApiRequest, schema: &ApiSchema) -> ProxyResult<Arc<dyn ResourceClient>> {
        if !self.config.admin_name_filter {
            return self.factory.client(req, schema);
        }
        if self.config.impersonate {
            require_user(req)?;
        }
        self.factory.admin_client(schema)
    }

    /// Resolve an id against the request: `ns/name`, or `name` plus the request namespace.
    fn locate<'a>(&self, req: &'a ApiRequest, schema: &ApiSchema, id: &'a str) -> ProxyResult<(Option<&'a str>, &'a str)> {
        let (ns, name) = split_id(id);
        if name.is_empty() {
            return Err(ProxyError::BadRequest(format!("invalid id {:?}", id)));
        }
        if !schema.namespaced {
            return Ok((None, name));
        }
        match ns.filter(|n| !n.is_empty()).or(req.namespace.as_deref()) {
            Some(ns) => Ok((Some(ns), name)),
            None => Err(ProxyError::BadRequest(format!("{} {:?}: namespace is required", schema.id, name))),
        }
    }

    async fn list_with(
        &self,
        client: &dyn ResourceClient,
        req: &ApiRequest,
        schema: &ApiSchema,
        query: &ListQuery,
        names: Option<&BTreeSet<String>>,
    ) -> ProxyResult<ApiObjectList> {
        let t0 = Instant::now();
        let ns = scope(req, schema);
        let page = client.list(ns, query).await?;
        let fetched = page.items.len();
        let objects: Vec<ApiObject> = page
            .items
            .into_iter()
            .filter_map(|doc| to_object_or_skip(schema, doc))
            .filter(|obj| names.map_or(true, |n| n.contains(obj.name())))
            .collect();
        let took_ms = t0.elapsed().as_millis();
        counter!("proxy_list_total", 1u64);
        histogram!("proxy_list_latency_ms", took_ms as f64);
        debug!(
            schema = %schema.id,
            ns = ?ns,
            fetched,
            kept = objects.len(),
            revision = %page.revision,
            more = !page.continue_token.is_empty(),
            took_ms = %took_ms,
            "store: list ok"
        );
        Ok(ApiObjectList { objects, revision: page.revision, continue_token: page.continue_token })
    }

    /// List restricted to `names`, read with the proxy's own client unless configured
    /// otherwise. A single name is pushed down as a field selector.
    pub async fn list_names(&self, req: &ApiRequest, schema: &ApiSchema, names: &BTreeSet<String>) -> ProxyResult<ApiObjectList> {
        let client = self.names_client(req, schema)?;
        let mut query = req.list_query()?;
        if let Some(only) = single(names) {
            query = query.and_field_selector(&format!("metadata.name={}", only));
        }
        self.list_with(client.as_ref(), req, schema, &query, Some(names)).await
    }

    /// Watch restricted to `names`; see [`Store::list_names`].
    pub async fn watch_names(
        &self,
        req: &ApiRequest,
        schema: &ApiSchema,
        w: WatchRequest,
        names: &BTreeSet<String>,
    ) -> ProxyResult<mpsc::Receiver<ApiEvent>> {
        let client = self.names_client(req, schema)?;
        watch::open(self, client, req, schema, w, Some(names.clone())).await
    }
}

fn single(names: &BTreeSet<String>) -> Option<&str> {
    if names.len() == 1 { names.iter().next().map(String::as_str) } else { None }
}

#[async_trait]
impl ResourceStore for Store {
    async fn by_id(&self, req: &ApiRequest, schema: &ApiSchema, id: &str) -> ProxyResult<ApiObject> {
        let (ns, name) = self.locate(req, schema, id)?;
        let query = req.list_query()?;
        let client = self.client(req, schema)?;
        let doc = client.get(ns, name, query.resource_version.as_deref()).await?;
        to_object(schema, doc)
    }

    async fn list(&self, req: &ApiRequest, schema: &ApiSchema) -> ProxyResult<ApiObjectList> {
        let client = self.client(req, schema)?;
        let query = req.list_query()?;
        self.list_with(client.as_ref(), req, schema, &query, None).await
    }

    async fn watch(&self, req: &ApiRequest, schema: &ApiSchema, w: WatchRequest) -> ProxyResult<mpsc::Receiver<ApiEvent>> {
        let client = self.client(req, schema)?;
        watch::open(self, client, req, schema, w, None).await
    }

    async fn create(&self, req: &ApiRequest, schema: &ApiSchema, mut data: Json) -> ProxyResult<ApiObject> {
        if !data.is_object() {
            return Err(ProxyError::BadRequest(format!("{}: body must be an object", schema.id)));
        }
        stamp_type(schema, &mut data);
        let ns = if schema.namespaced {
            let ns = meta(&data, "namespace").or(req.namespace.as_deref()).map(str::to_string);
            match ns {
                Some(ns) => {
                    set_meta(&mut data, "namespace", &ns);
                    Some(ns)
                }
                None => return Err(ProxyError::BadRequest(format!("{}: namespace is required", schema.id))),
            }
        } else {
            None
        };
        if meta(&data, "name").is_none() && meta(&data, "generateName").is_none() {
            let prefix: String = schema.id.chars().take(1).collect();
            set_meta(&mut data, "generateName", &format!("{}-", prefix));
        }
        let client = self.client(req, schema)?;
        let created = client.create(ns.as_deref(), data).await?;
        let obj = to_object(schema, created)?;
        info!(schema = %schema.id, id = %obj.id, "store: created");
        Ok(obj)
    }

    async fn update(&self, req: &ApiRequest, schema: &ApiSchema, id: &str, mut data: Json) -> ProxyResult<ApiObject> {
        let (ns, name) = self.locate(req, schema, id)?;
        let client = self.client(req, schema)?;
        let updated = if req.is_patch() {
            let body = if req.content_type() == Some(JSON_PATCH_CONTENT_TYPE) {
                PatchBody::Json(data)
            } else {
                PatchBody::Strategic(data)
            };
            client.patch(ns, name, body).await?
        } else {
            if meta(&data, "resourceVersion").is_none() {
                return Err(ProxyError::BadRequest(format!("{} {:?}: metadata.resourceVersion is required for update", schema.id, id)));
            }
            stamp_type(schema, &mut data);
            client.replace(ns, name, data).await?
        };
        to_object(schema, updated)
    }

    async fn delete(&self, req: &ApiRequest, schema: &ApiSchema, id: &str) -> ProxyResult<Option<ApiObject>> {
        let (ns, name) = self.locate(req, schema, id)?;
        let client = self.client(req, schema)?;
        match client.delete(ns, name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(schema = %schema.id, id = %id, "store: delete of absent object");
                counter!("proxy_delete_no_content_total", 1u64);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        // Finalizers may keep the object around; report it if so.
        match client.get(ns, name, None).await {
            Ok(doc) => Ok(to_object_or_skip(schema, doc)),
            Err(e) => {
                if !e.is_not_found() {
                    debug!(schema = %schema.id, id = %id, error = %e, "store: re-read after delete failed");
                }
                counter!("proxy_delete_no_content_total", 1u64);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranch_kubehub::fake::{FakeClientFactory, FakeCluster, Identity};

    fn store(cluster: &FakeCluster) -> Store {
        Store::new(Arc::new(FakeClientFactory::new(cluster.clone())), ProxyConfig::default())
    }

    fn bob() -> ApiRequest {
        ApiRequest::default().with_user(ranch_core::UserInfo::new("bob"))
    }

    fn configmaps() -> ApiSchema {
        ApiSchema::new("", "v1", "configmaps", "ConfigMap", true)
    }

    #[test]
    fn locate_requires_namespace_for_namespaced_kinds() {
        let cluster = FakeCluster::new();
        let s = store(&cluster);
        let nodes = ApiSchema::new("", "v1", "nodes", "Node", false);
        assert_eq!(s.locate(&bob(), &nodes, "n1").unwrap(), (None, "n1"));
        assert_eq!(s.locate(&bob(), &configmaps(), "ns/a").unwrap(), (Some("ns"), "a"));
        let scoped = bob().with_namespace("dflt");
        assert_eq!(s.locate(&scoped, &configmaps(), "a").unwrap(), (Some("dflt"), "a"));
        assert!(matches!(s.locate(&bob(), &configmaps(), "a"), Err(ProxyError::BadRequest(_))));
    }

    #[test]
    fn objects_get_type_stamped() {
        let obj = to_object(&configmaps(), json!({"metadata": {"name": "a", "namespace": "ns"}})).unwrap();
        assert_eq!(obj.object["apiVersion"], "v1");
        assert_eq!(obj.object["kind"], "ConfigMap");
        assert_eq!(obj.type_name, "configmap");
        assert!(to_object_or_skip(&configmaps(), json!({"metadata": {}})).is_none());
    }

    #[tokio::test]
    async fn list_names_reads_with_admin_client_and_filters() {
        let cluster = FakeCluster::new();
        for n in ["a", "b", "c"] {
            cluster.apply("configmap", json!({"metadata": {"name": n, "namespace": "ns"}}));
        }
        let s = store(&cluster);
        let req = bob().with_namespace("ns");
        let names: BTreeSet<String> = ["a".to_string(), "c".to_string()].into();
        let got = s.list_names(&req, &configmaps(), &names).await.unwrap();
        assert_eq!(got.objects.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(), vec!["ns/a", "ns/c"]);
        let call = cluster.calls().pop().unwrap();
        assert_eq!(call.identity, Identity::Admin);
        assert_eq!(call.query.field_selector, None);

        let one: BTreeSet<String> = ["b".to_string()].into();
        s.list_names(&req, &configmaps(), &one).await.unwrap();
        let call = cluster.calls().pop().unwrap();
        assert_eq!(call.query.field_selector.as_deref(), Some("metadata.name=b"));
    }

    #[tokio::test]
    async fn impersonation_requires_a_user() {
        let cluster = FakeCluster::new();
        let s = store(&cluster);
        let err = s.list(&ApiRequest::default(), &configmaps()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Unauthenticated(_)));
    }
}
