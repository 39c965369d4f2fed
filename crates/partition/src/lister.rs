//! Merged listing over several partitions.
//!
//! Partitions are visited in sorted order. First pages are fetched as spawned tasks,
//! up to `concurrency` at a time; follow-up pages of one partition are fetched one
//! after another. Results reach the caller in partition order through a bounded channel,
//! and the caller's limit is enforced across partitions with a resumable
//! [`ListState`] token.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use async_trait::async_trait;
use futures::StreamExt;
use metrics::{counter, histogram};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ranch_core::{ApiObject, ApiObjectList, Partition, ProxyError, ProxyResult};

use crate::token::ListState;

/// Page coordinates for one partition call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub continue_token: Option<String>,
    pub revision: Option<String>,
    pub limit: Option<u32>,
}

/// Lists a single partition; implemented by the RBAC layer on top of the store.
#[async_trait]
pub trait PartitionLister: Send + Sync {
    async fn list_partition(&self, partition: &Partition, page: PageRequest) -> ProxyResult<ApiObjectList>;
}

/// Final state of a listing, available once its pages are drained.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListSummary {
    /// Highest revision seen across the partitions read.
    pub revision: String,
    /// Token resuming after the last delivered item; empty when the listing is complete.
    pub continue_token: String,
    /// First error hit; the listing stopped there.
    pub error: Option<ProxyError>,
}

pub struct ParallelPartitionLister {
    lister: Arc<dyn PartitionLister>,
    concurrency: usize,
    partitions: Arc<Vec<Partition>>,
}

impl ParallelPartitionLister {
    pub fn new(lister: Arc<dyn PartitionLister>, concurrency: usize, mut partitions: Vec<Partition>) -> Self {
        partitions.sort();
        Self { lister, concurrency: concurrency.max(1), partitions: Arc::new(partitions) }
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Start listing.
    ///
    /// `resume` is a token from a previous [`ListSummary`]; its limit and revision win
    /// over `limit` and `revision`. A token that does not match the current partition
    /// set is rejected.
    pub fn list(
        &self,
        limit: Option<u32>,
        resume: Option<&str>,
        revision: Option<&str>,
        cancel: CancellationToken,
    ) -> ProxyResult<PartitionListing> {
        let state = match resume.filter(|t| !t.is_empty()) {
            Some(token) => {
                let state = ListState::decode(token)?;
                self.check(&state)?;
                state
            }
            None => ListState::default(),
        };
        let limit = if state.limit > 0 { Some(state.limit) } else { limit.map(|l| l as usize).filter(|l| *l > 0) };
        let pinned = Some(state.revision.clone())
            .filter(|r| !r.is_empty())
            .or_else(|| revision.filter(|r| !r.is_empty()).map(str::to_string));

        let (tx, rx) = mpsc::channel(self.concurrency);
        let feeder = Feeder {
            lister: self.lister.clone(),
            partitions: self.partitions.clone(),
            concurrency: self.concurrency,
            limit,
            cancel,
            tx,
        };
        let handle = tokio::spawn(feeder.run(state, pinned));
        Ok(PartitionListing { pages: rx, feeder: handle })
    }

    fn check(&self, state: &ListState) -> ProxyResult<()> {
        match self.partitions.get(state.partition_index) {
            Some(p) if p.name() == state.partition_name => Ok(()),
            _ => Err(ProxyError::BadRequest(format!(
                "continue token refers to partition {} ({:?}) which is no longer visible",
                state.partition_index, state.partition_name
            ))),
        }
    }
}

/// A running listing: pages in partition order, then the summary.
pub struct PartitionListing {
    pages: mpsc::Receiver<Vec<ApiObject>>,
    feeder: JoinHandle<ListSummary>,
}

impl PartitionListing {
    pub async fn next_page(&mut self) -> Option<Vec<ApiObject>> {
        self.pages.recv().await
    }

    /// Stop reading and wait for the summary. Unread pages are dropped.
    pub async fn finish(self) -> ListSummary {
        drop(self.pages);
        match self.feeder.await {
            Ok(summary) => summary,
            Err(e) => ListSummary { error: Some(ProxyError::Internal(format!("partition lister: {}", e))), ..Default::default() },
        }
    }

    /// Drain every page into one list; the first partition error fails the whole list.
    pub async fn collect(mut self) -> ProxyResult<ApiObjectList> {
        let mut objects = Vec::new();
        while let Some(page) = self.pages.recv().await {
            objects.extend(page);
        }
        let summary = self.finish().await;
        if let Some(err) = summary.error {
            return Err(err);
        }
        Ok(ApiObjectList { objects, revision: summary.revision, continue_token: summary.continue_token })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Next,
    Stop,
}

/// A spawned first-page fetch, aborted if the listing stops before reading it.
struct Prefetch(JoinHandle<ProxyResult<ApiObjectList>>);

impl Future for Prefetch {
    type Output = Result<ProxyResult<ApiObjectList>, tokio::task::JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl Drop for Prefetch {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Feeder {
    lister: Arc<dyn PartitionLister>,
    partitions: Arc<Vec<Partition>>,
    concurrency: usize,
    limit: Option<usize>,
    cancel: CancellationToken,
    tx: mpsc::Sender<Vec<ApiObject>>,
}

impl Feeder {
    async fn run(self, state: ListState, pinned: Option<String>) -> ListSummary {
        let started = Instant::now();
        let mut summary = ListSummary { revision: pinned.clone().unwrap_or_default(), ..Default::default() };
        let mut budget = self.limit;
        if let Err(e) = self.drive(state, pinned, &mut budget, &mut summary).await {
            if !matches!(e, ProxyError::Cancelled) {
                warn!(error = %e, "partition: list failed");
            }
            summary.continue_token.clear();
            summary.error = Some(e);
        }
        let took_ms = started.elapsed().as_millis() as f64;
        histogram!("proxy_partition_list_latency_ms", took_ms);
        debug!(
            partitions = self.partitions.len(),
            revision = %summary.revision,
            more = !summary.continue_token.is_empty(),
            took_ms = %took_ms,
            "partition: list done"
        );
        summary
    }

    async fn drive(
        &self,
        state: ListState,
        pinned: Option<String>,
        budget: &mut Option<usize>,
        summary: &mut ListSummary,
    ) -> ProxyResult<()> {
        let start = state.partition_index;
        if start >= self.partitions.len() {
            return Ok(());
        }

        // the first partition is read alone; its revision pins the others
        let first_cont = Some(state.continue_token).filter(|c| !c.is_empty());
        let first = self.cancellable(self.fetch(start, first_cont.clone(), pinned.clone())).await??;
        let pin = pinned.or_else(|| Some(first.revision.clone()).filter(|r| !r.is_empty()));
        if self.drain(start, first_cont, state.offset, first, &pin, budget, summary).await? == Flow::Stop {
            return Ok(());
        }

        // first pages run as tasks so they keep going while a partition is drained
        let rest = futures::stream::iter(start + 1..self.partitions.len())
            .map(|index| {
                let fetch = Prefetch(tokio::spawn(self.fetch(index, None, pin.clone())));
                async move { (index, fetch.await) }
            })
            .buffered(self.concurrency);
        futures::pin_mut!(rest);
        while let Some((index, page)) = self.cancellable(rest.next()).await? {
            let page = page.map_err(|e| ProxyError::Internal(format!("partition fetch: {}", e)))??;
            if self.drain(index, None, 0, page, &pin, budget, summary).await? == Flow::Stop {
                break;
            }
        }
        Ok(())
    }

    /// Deliver one partition starting at `page`, following its continue tokens until
    /// the partition ends or the budget runs out.
    #[allow(clippy::too_many_arguments)]
    async fn drain(
        &self,
        index: usize,
        mut cont: Option<String>,
        mut skip: usize,
        mut page: ApiObjectList,
        pin: &Option<String>,
        budget: &mut Option<usize>,
        summary: &mut ListSummary,
    ) -> ProxyResult<Flow> {
        loop {
            summary.revision = newer_revision(&summary.revision, &page.revision);
            let next_cont = std::mem::take(&mut page.continue_token);
            let mut items = page.objects;
            let skipped = skip.min(items.len());
            items.drain(..skipped);

            if let Some(left) = *budget {
                if items.len() > left {
                    items.truncate(left);
                    self.send(items).await?;
                    summary.continue_token = self.resume_at(index, cont.unwrap_or_default(), skip + left, pin, summary)?;
                    return Ok(Flow::Stop);
                }
                *budget = Some(left - items.len());
            }
            self.send(items).await?;

            let exhausted = *budget == Some(0);
            if !next_cont.is_empty() {
                if exhausted {
                    summary.continue_token = self.resume_at(index, next_cont, 0, pin, summary)?;
                    return Ok(Flow::Stop);
                }
                page = self.cancellable(self.fetch(index, Some(next_cont.clone()), pin.clone())).await??;
                cont = Some(next_cont);
                skip = 0;
                continue;
            }
            if exhausted {
                if index + 1 < self.partitions.len() {
                    summary.continue_token = self.resume_at(index + 1, String::new(), 0, pin, summary)?;
                }
                return Ok(Flow::Stop);
            }
            return Ok(Flow::Next);
        }
    }

    /// Owned future for one partition page.
    fn fetch(
        &self,
        index: usize,
        continue_token: Option<String>,
        revision: Option<String>,
    ) -> impl Future<Output = ProxyResult<ApiObjectList>> + Send + 'static {
        let lister = self.lister.clone();
        let partitions = self.partitions.clone();
        let page = PageRequest { continue_token, revision, limit: self.limit.map(|l| l as u32) };
        async move {
            counter!("proxy_partition_pages_total", 1u64);
            lister.list_partition(&partitions[index], page).await
        }
    }

    async fn cancellable<F: Future>(&self, fut: F) -> ProxyResult<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProxyError::Cancelled),
            out = fut => Ok(out),
        }
    }

    async fn send(&self, items: Vec<ApiObject>) -> ProxyResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        match self.cancellable(self.tx.send(items)).await? {
            Ok(()) => Ok(()),
            // reader went away
            Err(_) => Err(ProxyError::Cancelled),
        }
    }

    fn resume_at(
        &self,
        index: usize,
        continue_token: String,
        offset: usize,
        pin: &Option<String>,
        summary: &ListSummary,
    ) -> ProxyResult<String> {
        ListState {
            revision: pin.clone().unwrap_or_else(|| summary.revision.clone()),
            partition_index: index,
            partition_name: self.partitions[index].name().to_string(),
            continue_token,
            offset,
            limit: self.limit.unwrap_or(0),
        }
        .encode()
    }
}

/// Pick the later of two resource versions: numeric when both parse, otherwise the
/// first non-empty one.
pub(crate) fn newer_revision(current: &str, candidate: &str) -> String {
    let newer = match (current.parse::<u64>(), candidate.parse::<u64>()) {
        (Ok(a), Ok(b)) if b > a => candidate,
        _ if current.is_empty() => candidate,
        _ => current,
    };
    newer.to_string()
}
