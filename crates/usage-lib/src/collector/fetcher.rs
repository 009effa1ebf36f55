//! Paginated readers for workload specifications and usage samples
//!
//! Each fetcher issues list calls one page at a time and pushes whole pages
//! onto a bounded queue. Every call is admitted by the resource pool, gated by
//! the circuit breaker and retried with backoff. Returning from `run` drops the
//! queue sender, which is how consumers learn the stream ended.

use crate::error::{CollectError, FetchError};
use crate::models::{MetricSample, WorkloadSpec};
use crate::observability::{CollectorMetrics, PHASE_SAMPLES, PHASE_WORKLOADS};
use crate::resilience::{
    retry_with_backoff, BreakerError, CircuitBreaker, ResourcePool, RetryConfig, RetryError,
};
use crate::source::{ClusterSource, Page, PageRequest};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Estimated in-memory footprint of one listed item, used for pool admission
pub const ESTIMATED_ITEM_BYTES: u64 = 16 * 1024;

pub type ListFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<Page<T>>> + Send + 'a>>;

/// One kind of paged list call
pub trait PageKind: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Name used in logs, metrics and fetch errors
    const PHASE: &'static str;

    fn list<'a>(source: &'a dyn ClusterSource, request: &'a PageRequest)
        -> ListFuture<'a, Self::Item>;
}

pub struct WorkloadPages;

impl PageKind for WorkloadPages {
    type Item = WorkloadSpec;
    const PHASE: &'static str = PHASE_WORKLOADS;

    fn list<'a>(source: &'a dyn ClusterSource, request: &'a PageRequest) -> ListFuture<'a, WorkloadSpec> {
        source.list_workloads(request)
    }
}

pub struct SamplePages;

impl PageKind for SamplePages {
    type Item = MetricSample;
    const PHASE: &'static str = PHASE_SAMPLES;

    fn list<'a>(source: &'a dyn ClusterSource, request: &'a PageRequest) -> ListFuture<'a, MetricSample> {
        source.list_samples(request)
    }
}

pub struct PageFetcher<K: PageKind> {
    source: Arc<dyn ClusterSource>,
    breaker: Arc<CircuitBreaker>,
    pool: Arc<ResourcePool>,
    retry: RetryConfig,
    request: PageRequest,
    _kind: PhantomData<K>,
}

impl<K: PageKind> PageFetcher<K> {
    pub fn new(
        source: Arc<dyn ClusterSource>,
        breaker: Arc<CircuitBreaker>,
        pool: Arc<ResourcePool>,
        retry: RetryConfig,
        request: PageRequest,
    ) -> Self {
        Self {
            source,
            breaker,
            pool,
            retry,
            request,
            _kind: PhantomData,
        }
    }

    /// Fetch every page into `pages`; returns the number of pages read
    ///
    /// A closed receiver ends the fetch quietly since nobody is left to consume.
    pub async fn run(
        self,
        pages: mpsc::Sender<Vec<K::Item>>,
        cancel: CancellationToken,
    ) -> Result<usize, CollectError> {
        let mut request = self.request.clone();
        let mut page_count = 0usize;
        let mut item_count = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(CollectError::Cancelled);
            }

            let page = self.fetch_page(&request, &cancel).await?;
            page_count += 1;
            item_count += page.items.len();
            let next = page.next_token().map(str::to_string);

            debug!(
                phase = K::PHASE,
                page = page_count,
                items = page.items.len(),
                more = next.is_some(),
                "Fetched page"
            );

            if !page.items.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(CollectError::Cancelled),
                    sent = pages.send(page.items) => {
                        if sent.is_err() {
                            debug!(phase = K::PHASE, "Page consumer gone, stopping fetch");
                            return Ok(page_count);
                        }
                    }
                }
            }

            match next {
                Some(token) => request = request.next(token),
                None => break,
            }
        }

        debug!(
            phase = K::PHASE,
            pages = page_count,
            items = item_count,
            "Fetch complete"
        );
        Ok(page_count)
    }

    async fn fetch_page(
        &self,
        request: &PageRequest,
        cancel: &CancellationToken,
    ) -> Result<Page<K::Item>, CollectError> {
        let cost = u64::from(request.limit.max(1)) * ESTIMATED_ITEM_BYTES;
        let ticket = self.pool.acquire(cost, cancel).await?;
        let stats = self.pool.stats();
        debug!(
            phase = K::PHASE,
            cost = ticket.cost(),
            active = stats.active,
            max_concurrency = stats.max_concurrency,
            reserved_bytes = stats.current_memory_bytes,
            "Admitted list call"
        );

        let started = Instant::now();
        let source = self.source.as_ref();
        let result = self
            .breaker
            .call_classified(
                || retry_with_backoff(&self.retry, cancel, || K::list(source, request)),
                |err| !matches!(err, RetryError::Cancelled),
            )
            .await;
        CollectorMetrics::new().observe_api_call(K::PHASE, result.is_ok(), started.elapsed());

        result.map_err(|err| match err {
            BreakerError::Open { name } => {
                warn!(phase = K::PHASE, breaker = %name, "Circuit open, rejecting list call");
                CollectError::Fetch {
                    phase: K::PHASE,
                    source: FetchError::CircuitOpen { name },
                }
            }
            BreakerError::Inner(RetryError::Cancelled) => CollectError::Cancelled,
            BreakerError::Inner(RetryError::Exhausted { attempts, last }) => {
                warn!(
                    phase = K::PHASE,
                    attempts,
                    breaker_state = ?self.breaker.state(),
                    breaker_failures = self.breaker.failure_count(),
                    error = %last,
                    "List call failed"
                );
                CollectError::Fetch {
                    phase: K::PHASE,
                    source: FetchError::RetriesExhausted {
                        attempts,
                        source: last,
                    },
                }
            }
        })
    }
}
