//! In-memory cluster implementing [`ResourceClient`] and [`ClientFactory`].
//!
//! Objects are kept per schema id, namespace and name. Lists page with a cursor token,
//! watches replay history newer than the requested revision and then follow live
//! changes. Failures, per-user namespace denials and latency can be injected.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::{channel::mpsc, StreamExt};
use serde_json::{json, Value as Json};

use ranch_core::{ApiRequest, ApiSchema, ListQuery, ProxyError, ProxyResult};

use crate::{require_user, BackendEvent, ClientFactory, EventStream, ListPage, PatchBody, ResourceClient};

const CURSOR_PREFIX: &str = "fake:";

/// Who issued a recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    User(String),
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub identity: Identity,
    pub verb: &'static str,
    pub resource: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub query: ListQuery,
}

type Key = (String, String, String);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Change {
    Added,
    Modified,
    Deleted,
}

struct Watcher {
    resource: String,
    namespace: Option<String>,
    filter: Filter,
    bookmarks: bool,
    tx: mpsc::UnboundedSender<ProxyResult<BackendEvent>>,
}

#[derive(Default)]
struct State {
    revision: u64,
    uid: u64,
    objects: BTreeMap<Key, Json>,
    history: Vec<(u64, String, Change, Json)>,
    watchers: Vec<Watcher>,
    failures: BTreeMap<(&'static str, String), ProxyError>,
    denied: BTreeMap<String, BTreeSet<String>>,
    calls: Vec<Call>,
    latency: Option<Duration>,
}

/// Label and field selector subset: `k=v`, `k==v`, `k!=v`, `k` for labels, and
/// `metadata.name` / `metadata.namespace` equality for fields.
#[derive(Debug, Clone, Default)]
struct Filter {
    labels: Vec<(String, Option<String>, bool)>,
    fields: Vec<(String, String)>,
}

impl Filter {
    fn parse(query: &ListQuery) -> ProxyResult<Self> {
        let mut f = Filter::default();
        for term in query.label_selector.iter().flat_map(|s| s.split(',')).map(str::trim).filter(|t| !t.is_empty()) {
            if let Some((k, v)) = term.split_once("!=") {
                f.labels.push((k.trim().into(), Some(v.trim().into()), false));
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                f.labels.push((k.trim().into(), Some(v.trim().into()), true));
            } else {
                f.labels.push((term.into(), None, true));
            }
        }
        for term in query.field_selector.iter().flat_map(|s| s.split(',')).map(str::trim).filter(|t| !t.is_empty()) {
            match term.split_once('=') {
                Some((k, v)) if k == "metadata.name" || k == "metadata.namespace" => {
                    f.fields.push((k.into(), v.trim_start_matches('=').into()))
                }
                _ => return Err(bad_request(&format!("field label not supported: {}", term))),
            }
        }
        Ok(f)
    }

    fn matches(&self, obj: &Json) -> bool {
        let labels = obj.pointer("/metadata/labels");
        let label = |k: &str| labels.and_then(|l| l.get(k)).and_then(|v| v.as_str());
        let labels_ok = self.labels.iter().all(|(k, v, eq)| match (v, eq) {
            (None, _) => label(k.as_str()).is_some(),
            (Some(v), true) => label(k.as_str()) == Some(v.as_str()),
            (Some(v), false) => label(k.as_str()) != Some(v.as_str()),
        });
        labels_ok
            && self.fields.iter().all(|(k, v)| {
                let got = match k.as_str() {
                    "metadata.name" => meta(obj, "name"),
                    _ => meta(obj, "namespace"),
                };
                got.unwrap_or_default() == v.as_str()
            })
    }
}

fn meta<'a>(obj: &'a Json, key: &str) -> Option<&'a str> {
    obj.get("metadata").and_then(|m| m.get(key)).and_then(|v| v.as_str())
}

fn set_meta(obj: &mut Json, key: &str, value: Json) {
    if !obj.is_object() {
        *obj = json!({});
    }
    if let Some(map) = obj.as_object_mut() {
        let m = map.entry("metadata").or_insert_with(|| json!({}));
        if let Some(m) = m.as_object_mut() {
            m.insert(key.to_string(), value);
        }
    }
}

fn bad_request(msg: &str) -> ProxyError {
    ProxyError::Upstream { code: 400, reason: "BadRequest".into(), message: msg.into() }
}

fn conflict(msg: String) -> ProxyError {
    ProxyError::Upstream { code: 409, reason: "Conflict".into(), message: msg }
}

fn forbidden(user: &str, resource: &str, ns: Option<&str>) -> ProxyError {
    ProxyError::Upstream {
        code: 403,
        reason: "Forbidden".into(),
        message: format!(
            "user {:?} cannot access {} in {}",
            user,
            resource,
            ns.map(|n| format!("namespace {:?}", n)).unwrap_or_else(|| "the cluster scope".into())
        ),
    }
}

fn not_found(resource: &str, name: &str) -> ProxyError {
    ProxyError::NotFound(format!("{} {:?} not found", resource, name))
}

impl State {
    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn record(&mut self, change: Change, resource: &str, obj: Json) {
        let rev = self.revision;
        self.watchers.retain(|w| !w.tx.is_closed());
        for w in &self.watchers {
            if w.resource != resource || !in_scope(w.namespace.as_deref(), &obj) || !w.filter.matches(&obj) {
                continue;
            }
            let _ = w.tx.unbounded_send(Ok(event(change, obj.clone())));
        }
        self.history.push((rev, resource.to_string(), change, obj));
    }

    fn check(&self, identity: &Identity, verb: &'static str, resource: &str, ns: Option<&str>) -> ProxyResult<()> {
        if let Some(err) = self.failures.get(&(verb, ns.unwrap_or_default().to_string())) {
            return Err(err.clone());
        }
        if let Identity::User(user) = identity {
            if let Some(denied) = self.denied.get(user) {
                let blocked = match ns.filter(|n| !n.is_empty()) {
                    Some(n) => denied.contains(n),
                    None => !denied.is_empty(),
                };
                if blocked {
                    return Err(forbidden(user, resource, ns));
                }
            }
        }
        Ok(())
    }
}

fn in_scope(ns: Option<&str>, obj: &Json) -> bool {
    match ns.filter(|n| !n.is_empty()) {
        Some(n) => meta(obj, "namespace") == Some(n),
        None => true,
    }
}

fn event(change: Change, obj: Json) -> BackendEvent {
    match change {
        Change::Added => BackendEvent::Added(obj),
        Change::Modified => BackendEvent::Modified(obj),
        Change::Deleted => BackendEvent::Deleted(obj),
    }
}

/// Shared handle to the in-memory cluster.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite an object, assigning a fresh resource version.
    pub fn apply(&self, resource: &str, mut obj: Json) -> Json {
        let mut st = self.state();
        let rev = st.bump();
        let ns = meta(&obj, "namespace").unwrap_or_default().to_string();
        let name = meta(&obj, "name").unwrap_or_default().to_string();
        set_meta(&mut obj, "resourceVersion", json!(rev.to_string()));
        if meta(&obj, "uid").is_none() {
            st.uid += 1;
            let uid = format!("uid-{}", st.uid);
            set_meta(&mut obj, "uid", json!(uid));
        }
        let key = (resource.to_string(), ns, name);
        let change = if st.objects.contains_key(&key) { Change::Modified } else { Change::Added };
        st.objects.insert(key, obj.clone());
        st.record(change, resource, obj.clone());
        obj
    }

    /// Remove an object outright, ignoring finalizers.
    pub fn remove(&self, resource: &str, namespace: &str, name: &str) -> bool {
        let mut st = self.state();
        let Some(mut obj) = st.objects.remove(&(resource.to_string(), namespace.to_string(), name.to_string())) else {
            return false;
        };
        let rev = st.bump();
        set_meta(&mut obj, "resourceVersion", json!(rev.to_string()));
        st.record(Change::Deleted, resource, obj);
        true
    }

    pub fn object(&self, resource: &str, namespace: &str, name: &str) -> Option<Json> {
        self.state().objects.get(&(resource.to_string(), namespace.to_string(), name.to_string())).cloned()
    }

    pub fn revision(&self) -> String {
        self.state().revision.to_string()
    }

    /// Fail every `verb` call scoped to `namespace` (`""` = unscoped) with `err`.
    pub fn fail(&self, verb: &'static str, namespace: &str, err: ProxyError) {
        self.state().failures.insert((verb, namespace.to_string()), err);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Forbid `user` from reading `namespace`, and therefore from unscoped reads.
    pub fn deny(&self, user: &str, namespace: &str) {
        self.state().denied.entry(user.to_string()).or_default().insert(namespace.to_string());
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn active_watches(&self, resource: &str) -> usize {
        let mut st = self.state();
        st.watchers.retain(|w| !w.tx.is_closed());
        st.watchers.iter().filter(|w| w.resource == resource).count()
    }

    /// Send an in-band error status to every watch of `resource`.
    pub fn inject_watch_error(&self, resource: &str, message: &str) {
        for w in self.state().watchers.iter().filter(|w| w.resource == resource) {
            let _ = w.tx.unbounded_send(Ok(BackendEvent::Error(message.to_string())));
        }
    }

    /// Break the streams of `resource` watches scoped to `namespace` with a transport error.
    pub fn break_watches(&self, resource: &str, namespace: &str, err: ProxyError) {
        let mut st = self.state();
        st.watchers.retain(|w| {
            let hit = w.resource == resource && w.namespace.as_deref().unwrap_or_default() == namespace;
            if hit {
                let _ = w.tx.unbounded_send(Err(err.clone()));
            }
            !hit
        });
    }

    /// End every watch of `resource` as a server timeout would.
    pub fn close_watches(&self, resource: &str) {
        self.state().watchers.retain(|w| w.resource != resource);
    }

    pub fn send_bookmarks(&self, resource: &str) {
        let st = self.state();
        let rev = st.revision.to_string();
        for w in st.watchers.iter().filter(|w| w.resource == resource && w.bookmarks) {
            let _ = w.tx.unbounded_send(Ok(BackendEvent::Bookmark(rev.clone())));
        }
    }

    fn client(&self, schema: &ApiSchema, identity: Identity) -> Arc<dyn ResourceClient> {
        Arc::new(FakeResourceClient { cluster: self.clone(), resource: schema.id.clone(), identity })
    }
}

pub struct FakeResourceClient {
    cluster: FakeCluster,
    resource: String,
    identity: Identity,
}

impl FakeResourceClient {
    fn begin(
        &self,
        verb: &'static str,
        ns: Option<&str>,
        name: Option<&str>,
        query: Option<&ListQuery>,
    ) -> ProxyResult<Option<Duration>> {
        let ns = ns.filter(|n| !n.is_empty());
        let mut st = self.cluster.state();
        st.calls.push(Call {
            identity: self.identity.clone(),
            verb,
            resource: self.resource.clone(),
            namespace: ns.map(str::to_string),
            name: name.map(str::to_string),
            query: query.cloned().unwrap_or_default(),
        });
        st.check(&self.identity, verb, &self.resource, ns)?;
        Ok(st.latency)
    }

    fn key(&self, ns: Option<&str>, name: &str) -> Key {
        (self.resource.clone(), ns.unwrap_or_default().to_string(), name.to_string())
    }

    fn write(&self, ns: Option<&str>, name: &str, change: Change, mut obj: Json) -> Json {
        let mut st = self.cluster.state();
        let rev = st.bump();
        set_meta(&mut obj, "resourceVersion", json!(rev.to_string()));
        set_meta(&mut obj, "name", json!(name));
        if let Some(ns) = ns.filter(|n| !n.is_empty()) {
            set_meta(&mut obj, "namespace", json!(ns));
        }
        if meta(&obj, "uid").is_none() {
            st.uid += 1;
            let uid = format!("uid-{}", st.uid);
            set_meta(&mut obj, "uid", json!(uid));
        }
        st.objects.insert(self.key(ns, name), obj.clone());
        st.record(change, &self.resource, obj.clone());
        obj
    }

    fn current(&self, ns: Option<&str>, name: &str) -> ProxyResult<Json> {
        self.cluster.state().objects.get(&self.key(ns, name)).cloned().ok_or_else(|| not_found(&self.resource, name))
    }
}

async fn pause(latency: Option<Duration>) {
    if let Some(d) = latency {
        tokio::time::sleep(d).await;
    }
}

#[async_trait]
impl ResourceClient for FakeResourceClient {
    async fn get(&self, namespace: Option<&str>, name: &str, _resource_version: Option<&str>) -> ProxyResult<Json> {
        pause(self.begin("get", namespace, Some(name), None)?).await;
        self.current(namespace, name)
    }

    async fn list(&self, namespace: Option<&str>, query: &ListQuery) -> ProxyResult<ListPage> {
        pause(self.begin("list", namespace, None, Some(query))?).await;
        let filter = Filter::parse(query)?;
        let after = match query.continue_token.as_deref() {
            None => None,
            Some(tok) => Some(
                tok.strip_prefix(CURSOR_PREFIX)
                    .map(str::to_string)
                    .ok_or_else(|| bad_request(&format!("invalid continue token {:?}", tok)))?,
            ),
        };
        let st = self.cluster.state();
        let mut matching = st
            .objects
            .iter()
            .filter(|((r, ns, _), _)| *r == self.resource && namespace.filter(|n| !n.is_empty()).map_or(true, |n| n == ns.as_str()))
            .filter(|(_, obj)| filter.matches(obj))
            .map(|((_, ns, name), obj)| (format!("{}/{}", ns, name), obj))
            .filter(|(cursor, _)| after.as_deref().map_or(true, |a| cursor.as_str() > a));
        let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        let mut items = Vec::new();
        let mut last = String::new();
        for (cursor, obj) in matching.by_ref().take(limit) {
            items.push(obj.clone());
            last = cursor;
        }
        let continue_token = if matching.next().is_some() { format!("{}{}", CURSOR_PREFIX, last) } else { String::new() };
        Ok(ListPage { items, revision: st.revision.to_string(), continue_token })
    }

    async fn watch(&self, namespace: Option<&str>, query: &ListQuery, _timeout_secs: u64) -> ProxyResult<EventStream> {
        pause(self.begin("watch", namespace, None, Some(query))?).await;
        let filter = Filter::parse(query)?;
        let ns = namespace.filter(|n| !n.is_empty()).map(str::to_string);
        let (tx, rx) = mpsc::unbounded();
        let mut st = self.cluster.state();
        if let Some(from) = query.resource_version.as_deref().and_then(|rv| rv.parse::<u64>().ok()) {
            for (rev, resource, change, obj) in &st.history {
                if *rev > from && *resource == self.resource && in_scope(ns.as_deref(), obj) && filter.matches(obj) {
                    let _ = tx.unbounded_send(Ok(event(*change, obj.clone())));
                }
            }
        }
        st.watchers.push(Watcher {
            resource: self.resource.clone(),
            namespace: ns,
            filter,
            bookmarks: query.allow_bookmarks,
            tx,
        });
        Ok(rx.boxed())
    }

    async fn create(&self, namespace: Option<&str>, object: Json) -> ProxyResult<Json> {
        pause(self.begin("create", namespace, None, None)?).await;
        let name = match meta(&object, "name").filter(|n| !n.is_empty()) {
            Some(n) => n.to_string(),
            None => match meta(&object, "generateName").filter(|g| !g.is_empty()) {
                Some(g) => {
                    let mut st = self.cluster.state();
                    st.uid += 1;
                    format!("{}{:05}", g, st.uid)
                }
                None => {
                    return Err(ProxyError::Upstream {
                        code: 422,
                        reason: "Invalid".into(),
                        message: "metadata.name or metadata.generateName is required".into(),
                    })
                }
            },
        };
        if self.current(namespace, &name).is_ok() {
            return Err(conflict(format!("{} {:?} already exists", self.resource, name)));
        }
        Ok(self.write(namespace, &name, Change::Added, object))
    }

    async fn replace(&self, namespace: Option<&str>, name: &str, object: Json) -> ProxyResult<Json> {
        pause(self.begin("update", namespace, Some(name), None)?).await;
        let existing = self.current(namespace, name)?;
        if let Some(rv) = meta(&object, "resourceVersion").filter(|rv| !rv.is_empty()) {
            if Some(rv) != meta(&existing, "resourceVersion") {
                return Err(conflict(format!("the object has been modified; {} {:?} is not at {}", self.resource, name, rv)));
            }
        }
        Ok(self.write(namespace, name, Change::Modified, object))
    }

    async fn patch(&self, namespace: Option<&str>, name: &str, patch: PatchBody) -> ProxyResult<Json> {
        pause(self.begin("patch", namespace, Some(name), None)?).await;
        let mut doc = self.current(namespace, name)?;
        match patch {
            PatchBody::Strategic(body) => json_patch::merge(&mut doc, &body),
            PatchBody::Json(ops) => {
                let ops: json_patch::Patch = serde_json::from_value(ops).map_err(|e| bad_request(&e.to_string()))?;
                json_patch::patch(&mut doc, &ops).map_err(|e| ProxyError::Upstream {
                    code: 422,
                    reason: "Invalid".into(),
                    message: e.to_string(),
                })?;
            }
        }
        Ok(self.write(namespace, name, Change::Modified, doc))
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> ProxyResult<()> {
        pause(self.begin("delete", namespace, Some(name), None)?).await;
        let existing = self.current(namespace, name)?;
        let finalized = existing
            .pointer("/metadata/finalizers")
            .and_then(|f| f.as_array())
            .map_or(false, |f| !f.is_empty());
        if finalized {
            let mut doc = existing;
            set_meta(&mut doc, "deletionTimestamp", json!("1970-01-01T00:00:00Z"));
            self.write(namespace, name, Change::Modified, doc);
        } else {
            self.cluster.remove(&self.resource, namespace.unwrap_or_default(), name);
        }
        Ok(())
    }
}

/// Factory handing out fake clients; with `impersonate` set, calls are attributed to the
/// request's user and require one.
#[derive(Clone)]
pub struct FakeClientFactory {
    pub cluster: FakeCluster,
    pub impersonate: bool,
}

impl FakeClientFactory {
    pub fn new(cluster: FakeCluster) -> Self {
        Self { cluster, impersonate: true }
    }
}

impl ClientFactory for FakeClientFactory {
    fn client(&self, request: &ApiRequest, schema: &ApiSchema) -> ProxyResult<Arc<dyn ResourceClient>> {
        let identity = if self.impersonate { Identity::User(require_user(request)?.name.clone()) } else { Identity::Admin };
        Ok(self.cluster.client(schema, identity))
    }

    fn admin_client(&self, schema: &ApiSchema) -> ProxyResult<Arc<dyn ResourceClient>> {
        Ok(self.cluster.client(schema, Identity::Admin))
    }
}
