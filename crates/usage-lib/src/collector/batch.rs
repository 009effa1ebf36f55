//! Batch collector
//!
//! Fetches both lists to completion, then indexes and correlates in one pass.
//! Simpler and fully deterministic, at the cost of holding every page in memory.

use super::{base_request, new_pool, Breakers, Correlation, CorrelationIndex, PageFetcher, SamplePages, WorkloadPages};
use crate::error::CollectError;
use crate::models::ResultRow;
use crate::observability::CollectorMetrics;
use crate::options::CollectOptions;
use crate::resilience::BreakerConfig;
use crate::source::ClusterSource;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct BatchCollector {
    source: Arc<dyn ClusterSource>,
    breakers: Breakers,
}

impl BatchCollector {
    pub fn new(source: Arc<dyn ClusterSource>) -> Self {
        Self::with_breaker_config(source, BreakerConfig::default())
    }

    pub fn with_breaker_config(source: Arc<dyn ClusterSource>, config: BreakerConfig) -> Self {
        Self {
            source,
            breakers: Breakers::new(&config),
        }
    }

    /// Collect all rows; any fatal error discards the partial result
    pub async fn collect(
        &self,
        options: &CollectOptions,
        cancel: CancellationToken,
    ) -> Result<Vec<ResultRow>, CollectError> {
        options.validate()?;
        let run_cancel = cancel.child_token();

        let result =
            match tokio::time::timeout(options.timeout, self.run(options, &run_cancel)).await {
                Ok(result) => result,
                Err(_) => {
                    run_cancel.cancel();
                    Err(CollectError::DeadlineExceeded(options.timeout))
                }
            };
        if result.is_err() {
            CollectorMetrics::new().inc_errors();
        }
        result
    }

    async fn run(
        &self,
        options: &CollectOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<ResultRow>, CollectError> {
        let index = CorrelationIndex::new(options.filter()?);
        let pool = new_pool(options);
        let request = base_request(options);

        let workloads = PageFetcher::<WorkloadPages>::new(
            self.source.clone(),
            self.breakers.workloads.clone(),
            pool.clone(),
            options.retry.clone(),
            request.clone(),
        );
        let samples = PageFetcher::<SamplePages>::new(
            self.source.clone(),
            self.breakers.samples.clone(),
            pool,
            options.retry.clone(),
            request,
        );

        let (spec_tx, spec_rx) = mpsc::channel(options.queue_depth);
        let (sample_tx, sample_rx) = mpsc::channel(options.queue_depth);

        let (_, spec_pages, _, sample_pages) = tokio::try_join!(
            workloads.run(spec_tx, cancel.clone()),
            drain(spec_rx),
            samples.run(sample_tx, cancel.clone()),
            drain(sample_rx),
        )?;

        let spec_count: usize = spec_pages.iter().map(Vec::len).sum();
        let sample_count: usize = sample_pages.iter().map(Vec::len).sum();
        if spec_count == 0 {
            warn!("No workloads returned by the API");
        }
        if sample_count == 0 {
            warn!("No usage samples returned; is the metrics API available?");
        }

        for page in spec_pages {
            index.index_page(page);
        }

        let metrics = CollectorMetrics::new();
        let mut rows = Vec::new();
        for sample in sample_pages.iter().flatten() {
            match index.correlate(sample, options.resource, options.granularity) {
                Correlation::Rows(computed) => rows.extend(computed),
                Correlation::Excluded => {}
                Correlation::Missing => metrics.inc_samples_unmatched(),
            }
        }
        metrics.add_rows_emitted(rows.len());

        info!(
            workloads = spec_count,
            indexed = index.len(),
            samples = sample_count,
            rows = rows.len(),
            "Batch collection complete"
        );
        Ok(rows)
    }
}

async fn drain<T>(mut pages: mpsc::Receiver<Vec<T>>) -> Result<Vec<Vec<T>>, CollectError> {
    let mut drained = Vec::new();
    while let Some(page) = pages.recv().await {
        drained.push(page);
    }
    Ok(drained)
}
