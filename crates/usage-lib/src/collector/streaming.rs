//! Streaming collector
//!
//! Runs the fetchers, the indexers and the correlator as sibling tasks under
//! one cancellation token. Specification pages are indexed while sample pages
//! are correlated against the growing index, and rows leave through a bounded
//! channel as soon as they are computed. The first real failure cancels every
//! sibling and is sent as the last item before the channel closes.

use super::{
    base_request, new_pool, Breakers, Correlation, CorrelationIndex, PageFetcher, Phase,
    RunState, SamplePages, WorkloadPages,
};
use crate::error::CollectError;
use crate::models::{MetricSample, ResultRow, WorkloadSpec};
use crate::observability::{CollectorMetrics, PHASE_SAMPLES, PHASE_WORKLOADS};
use crate::options::{CollectOptions, Granularity, MissPolicy, ResourceKind};
use crate::resilience::BreakerConfig;
use crate::source::ClusterSource;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type RowSender = mpsc::Sender<Result<ResultRow, CollectError>>;

pub struct StreamingCollector {
    source: Arc<dyn ClusterSource>,
    breakers: Breakers,
    state: Arc<RunState>,
}

impl StreamingCollector {
    pub fn new(source: Arc<dyn ClusterSource>) -> Self {
        Self::with_breaker_config(source, BreakerConfig::default())
    }

    pub fn with_breaker_config(source: Arc<dyn ClusterSource>, config: BreakerConfig) -> Self {
        Self {
            source,
            breakers: Breakers::new(&config),
            state: Arc::new(RunState::new()),
        }
    }

    /// Phase tracker of the most recent run
    pub fn run_state(&self) -> Arc<RunState> {
        self.state.clone()
    }

    /// Start a run and return its row stream
    ///
    /// The channel closing is the only completion signal. An `Err` item is
    /// always the last item of a failed run.
    pub fn collect_streaming(
        &self,
        options: CollectOptions,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<ResultRow, CollectError>> {
        let (out, rows) = mpsc::channel(options.result_buffer.max(1));
        self.state.reset();

        let pipeline = Pipeline {
            source: self.source.clone(),
            breakers: self.breakers.clone(),
            state: self.state.clone(),
            options,
        };
        tokio::spawn(pipeline.supervise(out, cancel));

        rows
    }

    /// Collect every row; a failed run returns its error and no rows
    pub async fn collect(
        &self,
        options: CollectOptions,
        cancel: CancellationToken,
    ) -> Result<Vec<ResultRow>, CollectError> {
        let mut stream = self.collect_streaming(options, cancel);
        let mut rows = Vec::new();
        while let Some(item) = stream.recv().await {
            rows.push(item?);
        }
        Ok(rows)
    }
}

struct Pipeline {
    source: Arc<dyn ClusterSource>,
    breakers: Breakers,
    state: Arc<RunState>,
    options: CollectOptions,
}

impl Pipeline {
    async fn supervise(self, out: RowSender, cancel: CancellationToken) {
        let run_cancel = cancel.child_token();
        let timeout = self.options.timeout;
        let state = self.state.clone();

        let result = match self.options.validate() {
            Err(err) => Err(err),
            Ok(()) => {
                match tokio::time::timeout(timeout, self.run(&out, &run_cancel)).await {
                    Ok(result) => result,
                    Err(_) => Err(CollectError::DeadlineExceeded(timeout)),
                }
            }
        };
        run_cancel.cancel();

        match result {
            Ok(rows) => {
                state.advance(Phase::Done);
                info!(rows, "Streaming collection complete");
            }
            Err(err) => {
                state.advance(Phase::Failed);
                CollectorMetrics::new().inc_errors();
                warn!(error = %err, "Streaming collection failed");
                // the consumer may already be gone
                let _ = out.send(Err(err)).await;
            }
        }
    }

    async fn run(&self, out: &RowSender, cancel: &CancellationToken) -> Result<usize, CollectError> {
        let options = &self.options;
        let index = Arc::new(CorrelationIndex::new(options.filter()?));
        let pool = new_pool(options);
        let request = base_request(options);

        let (spec_tx, spec_rx) = mpsc::channel::<Vec<WorkloadSpec>>(options.queue_depth);
        let (sample_tx, sample_rx) = mpsc::channel::<Vec<MetricSample>>(options.queue_depth);
        let (indexed_tx, indexed_rx) = watch::channel(false);

        self.state.advance(Phase::FetchingAndIndexing);
        let mut tasks: JoinSet<Result<Finished, CollectError>> = JoinSet::new();

        let workloads = PageFetcher::<WorkloadPages>::new(
            self.source.clone(),
            self.breakers.workloads.clone(),
            pool.clone(),
            options.retry.clone(),
            request.clone(),
        );
        let fetch_cancel = cancel.clone();
        tasks.spawn(async move {
            let pages = workloads.run(spec_tx, fetch_cancel).await?;
            Ok(Finished::Fetch(PHASE_WORKLOADS, pages))
        });

        let samples = PageFetcher::<SamplePages>::new(
            self.source.clone(),
            self.breakers.samples.clone(),
            pool,
            options.retry.clone(),
            request,
        );
        let fetch_cancel = cancel.clone();
        tasks.spawn(async move {
            let pages = samples.run(sample_tx, fetch_cancel).await?;
            Ok(Finished::Fetch(PHASE_SAMPLES, pages))
        });

        tasks.spawn(index_workloads(
            index.clone(),
            spec_rx,
            indexed_tx,
            options.max_concurrency,
            cancel.clone(),
        ));

        let correlator = Correlator {
            index,
            resource: options.resource,
            granularity: options.granularity,
            policy: options.miss_policy,
            max_deferred: options.max_deferred,
            out: out.clone(),
            cancel: cancel.clone(),
            state: self.state.clone(),
            metrics: CollectorMetrics::new(),
        };
        tasks.spawn(correlator.run(sample_rx, indexed_rx));

        let mut emitted = 0;
        let mut failure: Option<CollectError> = None;
        while let Some(joined) = tasks.join_next().await {
            let err = match joined.unwrap_or_else(|e| Err(task_error(e))) {
                Ok(Finished::Fetch(phase, pages)) => {
                    debug!(phase, pages, "Fetcher finished");
                    continue;
                }
                Ok(Finished::Index(workloads)) => {
                    debug!(workloads, "Indexers finished");
                    continue;
                }
                Ok(Finished::Correlate(rows)) => {
                    emitted = rows;
                    continue;
                }
                Err(err) => err,
            };

            // keep the first real failure; cancellations it caused are noise
            let replace = match &failure {
                None => true,
                Some(current) => current.is_cancellation() && !err.is_cancellation(),
            };
            if replace {
                if !err.is_cancellation() {
                    debug!(error = %err, "Task failed, cancelling siblings");
                }
                cancel.cancel();
                failure = Some(err);
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(emitted),
        }
    }
}

/// What a pipeline task reports when it ends cleanly
enum Finished {
    Fetch(&'static str, usize),
    Index(usize),
    Correlate(usize),
}

fn task_error(err: JoinError) -> CollectError {
    if err.is_cancelled() {
        CollectError::Cancelled
    } else {
        CollectError::Task(err.to_string())
    }
}

/// Spread specification pages over `workers` indexers and flag completion
async fn index_workloads(
    index: Arc<CorrelationIndex>,
    pages: mpsc::Receiver<Vec<WorkloadSpec>>,
    indexed: watch::Sender<bool>,
    workers: usize,
    cancel: CancellationToken,
) -> Result<Finished, CollectError> {
    let pages = Arc::new(Mutex::new(pages));
    let mut set = JoinSet::new();
    for worker in 0..workers.max(1) {
        set.spawn(index_worker(
            worker,
            index.clone(),
            pages.clone(),
            cancel.clone(),
        ));
    }

    while let Some(joined) = set.join_next().await {
        joined.map_err(task_error)??;
    }

    // receivers may have finished already
    let _ = indexed.send(true);
    Ok(Finished::Index(index.len()))
}

async fn index_worker(
    worker: usize,
    index: Arc<CorrelationIndex>,
    pages: Arc<Mutex<mpsc::Receiver<Vec<WorkloadSpec>>>>,
    cancel: CancellationToken,
) -> Result<(), CollectError> {
    loop {
        let page = {
            let mut receiver = tokio::select! {
                _ = cancel.cancelled() => return Err(CollectError::Cancelled),
                receiver = pages.lock() => receiver,
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(CollectError::Cancelled),
                page = receiver.recv() => page,
            }
        };

        let Some(page) = page else {
            return Ok(());
        };
        let (indexed, excluded) = index.index_page(page);
        debug!(worker, indexed, excluded, "Indexed workload page");
    }
}

struct Correlator {
    index: Arc<CorrelationIndex>,
    resource: ResourceKind,
    granularity: Granularity,
    policy: MissPolicy,
    max_deferred: usize,
    out: RowSender,
    cancel: CancellationToken,
    state: Arc<RunState>,
    metrics: CollectorMetrics,
}

impl Correlator {
    async fn run(
        self,
        mut samples: mpsc::Receiver<Vec<MetricSample>>,
        mut indexed: watch::Receiver<bool>,
    ) -> Result<Finished, CollectError> {
        let mut deferred: Vec<MetricSample> = Vec::new();
        let mut overflow = 0usize;
        let mut emitted = 0usize;

        loop {
            let page = tokio::select! {
                _ = self.cancel.cancelled() => return Err(CollectError::Cancelled),
                page = samples.recv() => page,
            };
            let Some(page) = page else { break };
            self.state.advance(Phase::Correlating);

            let index_complete = *indexed.borrow();
            for sample in page {
                match self.index.correlate(&sample, self.resource, self.granularity) {
                    Correlation::Rows(rows) => emitted += self.emit(rows).await?,
                    Correlation::Excluded => {}
                    Correlation::Missing
                        if self.policy == MissPolicy::Defer && !index_complete =>
                    {
                        if deferred.len() < self.max_deferred {
                            self.metrics.inc_samples_deferred();
                            deferred.push(sample);
                        } else {
                            overflow += 1;
                            self.metrics.inc_samples_unmatched();
                        }
                    }
                    Correlation::Missing => self.metrics.inc_samples_unmatched(),
                }
            }
        }

        self.state.advance(Phase::Draining);
        if overflow > 0 {
            warn!(
                dropped = overflow,
                capacity = self.max_deferred,
                "Deferral buffer full, samples dropped"
            );
        }
        if deferred.is_empty() {
            return Ok(Finished::Correlate(emitted));
        }

        debug!(deferred = deferred.len(), "Waiting for workload index to complete");
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(CollectError::Cancelled),
            done = indexed.wait_for(|complete| *complete) => {
                // sender dropped without completing: the indexer failed
                if done.is_err() {
                    return Err(CollectError::Cancelled);
                }
            }
        }

        for sample in deferred {
            match self.index.correlate(&sample, self.resource, self.granularity) {
                Correlation::Rows(rows) => emitted += self.emit(rows).await?,
                Correlation::Excluded | Correlation::Missing => {
                    self.metrics.inc_samples_unmatched();
                }
            }
        }
        Ok(Finished::Correlate(emitted))
    }

    async fn emit(&self, rows: Vec<ResultRow>) -> Result<usize, CollectError> {
        let count = rows.len();
        for row in rows {
            if self.cancel.is_cancelled() {
                return Err(CollectError::Cancelled);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(CollectError::Cancelled),
                sent = self.out.send(Ok(row)) => {
                    // the consumer stopped reading
                    sent.map_err(|_| CollectError::Cancelled)?;
                }
            }
        }
        self.metrics.add_rows_emitted(count);
        Ok(count)
    }
}
