//! Ranch API: the access-enforcing store served to callers.
//!
//! [`RbacStore`] wraps the passthrough [`Store`]. List and Watch are checked against the
//! caller's grants on the schema: a request the grants fully cover goes straight to the
//! store; anything else is split into namespace/name partitions, listed in parallel
//! with one resumable cursor, or watched with one stream per partition fanned into a
//! single channel. Point operations are delegated unchanged.

#![forbid(unsafe_code)]

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use metrics::counter;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, info};

use ranch_core::{ApiEvent, ApiObject, ApiObjectList, ApiRequest, ApiSchema, Partition, ProxyResult, WatchRequest};
use ranch_partition::{decide, Decision, ParallelPartitionLister};

pub use ranch_store::{ResourceStore, Store};

mod scoped;
mod watch;

use scoped::ScopedLister;

pub const VERB_LIST: &str = "list";
pub const VERB_WATCH: &str = "watch";

pub struct RbacStore {
    store: Arc<Store>,
}

impl RbacStore {
    pub fn new(store: Store) -> Self {
        Self { store: Arc::new(store) }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    async fn list_partitions(
        &self,
        req: &ApiRequest,
        schema: &ApiSchema,
        partitions: Vec<Partition>,
    ) -> ProxyResult<ApiObjectList> {
        let t0 = Instant::now();
        let query = req.list_query()?;
        let count = partitions.len();
        counter!("proxy_list_partitioned_total", 1u64);

        let lister = ScopedLister::new(self.store.clone(), req, schema);
        let parallel = ParallelPartitionLister::new(Arc::new(lister), self.store.config().list_concurrency, partitions);
        let listing = parallel.list(
            query.limit,
            query.continue_token.as_deref(),
            query.resource_version.as_deref(),
            req.cancel.clone(),
        )?;
        let list = listing.collect().await?;
        info!(
            schema = %schema.id,
            partitions = count,
            items = list.objects.len(),
            revision = %list.revision,
            more = !list.continue_token.is_empty(),
            took_ms = %t0.elapsed().as_millis(),
            "rbac: partitioned list ok"
        );
        Ok(list)
    }
}

#[async_trait]
impl ResourceStore for RbacStore {
    async fn by_id(&self, req: &ApiRequest, schema: &ApiSchema, id: &str) -> ProxyResult<ApiObject> {
        self.store.by_id(req, schema, id).await
    }

    async fn list(&self, req: &ApiRequest, schema: &ApiSchema) -> ProxyResult<ApiObjectList> {
        match decide(req, schema, VERB_LIST) {
            Decision::Passthrough => {
                debug!(schema = %schema.id, ns = ?req.namespace, "rbac: list passthrough");
                self.store.list(req, schema).await
            }
            Decision::Partitions(partitions) => self.list_partitions(req, schema, partitions).await,
        }
    }

    async fn watch(&self, req: &ApiRequest, schema: &ApiSchema, w: WatchRequest) -> ProxyResult<mpsc::Receiver<ApiEvent>> {
        match decide(req, schema, VERB_WATCH) {
            Decision::Passthrough => {
                debug!(schema = %schema.id, ns = ?req.namespace, "rbac: watch passthrough");
                self.store.watch(req, schema, w).await
            }
            Decision::Partitions(partitions) => Ok(watch::fan_in(self.store.clone(), req, schema, w, partitions)),
        }
    }

    async fn create(&self, req: &ApiRequest, schema: &ApiSchema, data: Json) -> ProxyResult<ApiObject> {
        self.store.create(req, schema, data).await
    }

    async fn update(&self, req: &ApiRequest, schema: &ApiSchema, id: &str, data: Json) -> ProxyResult<ApiObject> {
        self.store.update(req, schema, id, data).await
    }

    async fn delete(&self, req: &ApiRequest, schema: &ApiSchema, id: &str) -> ProxyResult<Option<ApiObject>> {
        self.store.delete(req, schema, id).await
    }
}
