use std::{collections::BTreeSet, sync::Arc};

use futures::StreamExt;
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ranch_core::{ApiEvent, ApiRequest, ApiSchema, EventName, ListQuery, ProxyResult, WatchRequest};
use ranch_kubehub::{BackendEvent, EventStream, ResourceClient};

use crate::{scope, single, to_object_or_skip, Store};

/// Open a backing watch and spawn the task pumping it into a bounded channel.
pub(crate) async fn open(
    store: &Store,
    client: Arc<dyn ResourceClient>,
    req: &ApiRequest,
    schema: &ApiSchema,
    w: WatchRequest,
    names: Option<BTreeSet<String>>,
) -> ProxyResult<mpsc::Receiver<ApiEvent>> {
    let ns = scope(req, schema);
    let mut query = req.list_query()?;
    query.watch = true;
    query.limit = None;
    query.continue_token = None;
    if let Some(selector) = w.selector.filter(|s| !s.is_empty()) {
        query.label_selector = Some(selector);
    }
    if let Some(only) = names.as_ref().and_then(single) {
        query = query.and_field_selector(&format!("metadata.name={}", only));
    }

    query.resource_version = match w.revision.as_str() {
        "" => {
            // one-item page just to learn where "now" is
            let probe = ListQuery {
                limit: Some(1),
                label_selector: query.label_selector.clone(),
                field_selector: query.field_selector.clone(),
                ..Default::default()
            };
            let page = client.list(ns, &probe).await?;
            Some(page.revision).filter(|rv| !rv.is_empty())
        }
        WatchRequest::FROM_NOW => None,
        rv => Some(rv.to_string()),
    };

    let stream = client.watch(ns, &query, store.config.watch_timeout_secs()).await?;
    counter!("proxy_watch_open_total", 1u64);
    debug!(schema = %schema.id, ns = ?ns, rv = ?query.resource_version, names = ?names.as_ref().map(|n| n.len()), "store: watch open");

    let (tx, rx) = mpsc::channel(store.config.queue_cap);
    let pump = Pump {
        schema: schema.clone(),
        names,
        bookmarks: query.allow_bookmarks,
        cancel: req.cancel.clone(),
        tx,
    };
    tokio::spawn(pump.run(stream));
    Ok(rx)
}

struct Pump {
    schema: ApiSchema,
    names: Option<BTreeSet<String>>,
    bookmarks: bool,
    cancel: CancellationToken,
    tx: mpsc::Sender<ApiEvent>,
}

impl Pump {
    fn translate(&self, ev: BackendEvent) -> Option<ApiEvent> {
        let (name, doc) = match ev {
            BackendEvent::Added(doc) => (EventName::Create, doc),
            BackendEvent::Modified(doc) => (EventName::Change, doc),
            BackendEvent::Deleted(doc) => (EventName::Remove, doc),
            BackendEvent::Bookmark(rv) => return self.bookmarks.then(|| ApiEvent::bookmark(rv)),
            BackendEvent::Error(message) => {
                // usually a compacted resource version; the caller re-watches from a fresh list
                debug!(schema = %self.schema.id, error = %message, "store: absorbed watch error event");
                counter!("proxy_watch_error_events_total", 1u64);
                return None;
            }
        };
        let obj = to_object_or_skip(&self.schema, doc)?;
        if let Some(names) = &self.names {
            if !names.contains(obj.name()) {
                return None;
            }
        }
        Some(ApiEvent::object(name, obj))
    }

    async fn send(&self, ev: ApiEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(ev) => sent.is_ok(),
        }
    }

    async fn run(self, mut stream: EventStream) {
        let mut forwarded = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = stream.next() => next,
            };
            let ev = match next {
                None => break,
                Some(Ok(ev)) => ev,
                Some(Err(e)) => {
                    warn!(schema = %self.schema.id, error = %e, "store: watch stream failed");
                    self.send(ApiEvent::error(e)).await;
                    break;
                }
            };
            let Some(out) = self.translate(ev) else { continue };
            if !self.send(out).await {
                break;
            }
            forwarded += 1;
        }
        drop(stream);
        debug!(schema = %self.schema.id, forwarded, cancelled = self.cancel.is_cancelled(), "store: watch closed");
    }
}
