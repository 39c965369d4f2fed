//! Partitioned watch: one store watch per partition, fanned into one channel.
//!
//! All partition tasks share a child of the request's cancellation token. The first
//! task to finish cancels it, which stops its siblings; a supervisor joins them and
//! drops the last sender, so the caller's channel closes exactly once, after every
//! producer is gone.

use std::sync::Arc;

use metrics::counter;
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ranch_core::{ApiEvent, ApiRequest, ApiSchema, Partition, ProxyResult, WatchRequest};
use ranch_store::{ResourceStore, Store};

pub(crate) fn fan_in(
    store: Arc<Store>,
    req: &ApiRequest,
    schema: &ApiSchema,
    w: WatchRequest,
    partitions: Vec<Partition>,
) -> mpsc::Receiver<ApiEvent> {
    let shared = req.cancel.child_token();
    let (tx, rx) = mpsc::channel(store.config().queue_cap);
    counter!("proxy_watch_partitioned_total", 1u64);
    debug!(schema = %schema.id, partitions = partitions.len(), "rbac: watch fan-in start");

    let mut tasks = JoinSet::new();
    for partition in partitions {
        let task = PartitionWatch {
            store: store.clone(),
            req: req.scoped(partition.scope()).with_cancel(shared.clone()),
            schema: schema.clone(),
            w: w.clone(),
            partition,
            cancel: shared.clone(),
            tx: tx.clone(),
        };
        tasks.spawn(task.run());
    }

    let schema_id = schema.id.clone();
    tokio::spawn(async move {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(schema = %schema_id, error = %e, "rbac: partition watch task failed");
                shared.cancel();
            }
        }
        drop(tx);
        debug!(schema = %schema_id, "rbac: watch fan-in closed");
    });
    rx
}

struct PartitionWatch {
    store: Arc<Store>,
    req: ApiRequest,
    schema: ApiSchema,
    w: WatchRequest,
    partition: Partition,
    cancel: CancellationToken,
    tx: mpsc::Sender<ApiEvent>,
}

impl PartitionWatch {
    async fn open(&self) -> ProxyResult<Option<mpsc::Receiver<ApiEvent>>> {
        if self.partition.is_empty() {
            return Ok(None);
        }
        let events = if self.partition.all {
            self.store.watch(&self.req, &self.schema, self.w.clone()).await?
        } else {
            self.store.watch_names(&self.req, &self.schema, self.w.clone(), &self.partition.names).await?
        };
        Ok(Some(events))
    }

    async fn forward(&self, ev: ApiEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(ev) => sent.is_ok(),
        }
    }

    async fn run(self) {
        let ns = self.partition.namespace.clone();
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(schema = %self.schema.id, ns = %ns, "rbac: partition watch cancelled while opening");
                return;
            }
            opened = self.open() => opened,
        };
        let mut events = match opened {
            Ok(Some(events)) => events,
            // nothing to see here: stay out of the way until the others end
            Ok(None) => return self.cancel.cancelled().await,
            Err(e) if e.is_not_found() => {
                debug!(schema = %self.schema.id, ns = %ns, "rbac: partition watch target gone, idling");
                return self.cancel.cancelled().await;
            }
            Err(e) => {
                warn!(schema = %self.schema.id, ns = %ns, error = %e, "rbac: partition watch open failed");
                self.forward(ApiEvent::error(e)).await;
                self.cancel.cancel();
                return;
            }
        };

        let mut forwarded = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = events.recv() => next,
            };
            let Some(ev) = next else { break };
            if !self.forward(ev).await {
                break;
            }
            forwarded += 1;
        }
        self.cancel.cancel();
        debug!(schema = %self.schema.id, ns = %ns, forwarded, "rbac: partition watch done");
    }
}
