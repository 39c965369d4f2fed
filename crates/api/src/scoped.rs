use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use ranch_core::{ApiObjectList, ApiRequest, ApiSchema, Partition, ProxyResult};
use ranch_partition::{PageRequest, PartitionLister};
use ranch_store::{ResourceStore, Store};

/// Paging parameters owned by the partition lister; the caller's values never reach
/// the backing calls directly.
const PAGE_PARAMS: [&str; 4] = ["continue", "limit", "resourceVersion", "revision"];

/// Lists one partition through the store with a copy of the caller's request.
pub(crate) struct ScopedLister {
    store: Arc<Store>,
    req: ApiRequest,
    schema: ApiSchema,
}

impl ScopedLister {
    pub(crate) fn new(store: Arc<Store>, req: &ApiRequest, schema: &ApiSchema) -> Self {
        Self { store, req: req.clone(), schema: schema.clone() }
    }

    fn request_for(&self, partition: &Partition, page: PageRequest) -> ApiRequest {
        let mut req = self.req.scoped(partition.scope());
        for key in PAGE_PARAMS {
            req.query.remove(key);
        }
        if let Some(token) = page.continue_token {
            req = req.with_param("continue", token);
        }
        if let Some(rv) = page.revision {
            req = req.with_param("resourceVersion", rv);
        }
        if let Some(limit) = page.limit {
            req = req.with_param("limit", limit.to_string());
        }
        req
    }
}

#[async_trait]
impl PartitionLister for ScopedLister {
    async fn list_partition(&self, partition: &Partition, page: PageRequest) -> ProxyResult<ApiObjectList> {
        if partition.is_empty() {
            return Ok(ApiObjectList::default());
        }
        let req = self.request_for(partition, page);
        let listed = if partition.all {
            self.store.list(&req, &self.schema).await
        } else {
            self.store.list_names(&req, &self.schema, &partition.names).await
        };
        match listed {
            // a granted namespace may have been deleted since the grants were computed
            Err(e) if e.is_not_found() => {
                debug!(schema = %self.schema.id, ns = %partition.namespace, "rbac: partition not found, treating as empty");
                Ok(ApiObjectList::default())
            }
            other => other,
        }
    }
}
