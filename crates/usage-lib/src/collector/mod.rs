//! Collection and correlation engine
//!
//! Two orchestrators share the same building blocks:
//! - [`PageFetcher`] reads paginated specifications and samples
//! - [`CorrelationIndex`] joins samples with indexed specifications
//! - [`compute_rows`] turns a matched pair into result rows
//!
//! [`BatchCollector`] drains everything before correlating. [`StreamingCollector`]
//! indexes and correlates while pages are still arriving and streams rows out.

mod batch;
mod fetcher;
mod index;
mod rows;
mod streaming;


pub use batch::BatchCollector;
pub use fetcher::{PageFetcher, PageKind, SamplePages, WorkloadPages, ESTIMATED_ITEM_BYTES};
pub use index::{Correlation, CorrelationIndex};
pub use rows::compute_rows;
pub use streaming::StreamingCollector;

use crate::observability::{PHASE_SAMPLES, PHASE_WORKLOADS};
use crate::options::CollectOptions;
use crate::resilience::{BreakerConfig, CircuitBreaker, ResourcePool};
use crate::source::PageRequest;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Name of the resource pool shared by both fetchers of a run
pub const POOL_NAME: &str = "cluster-api";

/// Lifecycle of a collection run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    FetchingAndIndexing,
    Correlating,
    Draining,
    Done,
    Failed,
}

impl Phase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::FetchingAndIndexing,
            2 => Self::Correlating,
            3 => Self::Draining,
            4 => Self::Done,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Shared phase tracker; only moves forward and stops at a terminal phase
#[derive(Debug, Default)]
pub struct RunState {
    phase: AtomicU8,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn advance(&self, to: Phase) {
        let moved = self
            .phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                let current = Phase::from_u8(raw);
                (!current.is_terminal() && to > current).then_some(to as u8)
            })
            .is_ok();
        if moved {
            debug!(phase = ?to, "Collection phase changed");
        }
    }

    pub(crate) fn reset(&self) {
        self.phase.store(Phase::Idle as u8, Ordering::Release);
    }
}

/// One breaker per remote call class, kept across runs of a collector
#[derive(Clone)]
pub(crate) struct Breakers {
    pub workloads: Arc<CircuitBreaker>,
    pub samples: Arc<CircuitBreaker>,
}

impl Breakers {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            workloads: Arc::new(CircuitBreaker::new(
                format!("{PHASE_WORKLOADS}-api"),
                config.clone(),
            )),
            samples: Arc::new(CircuitBreaker::new(
                format!("{PHASE_SAMPLES}-api"),
                config.clone(),
            )),
        }
    }
}

/// First page request derived from the options
pub(crate) fn base_request(options: &CollectOptions) -> PageRequest {
    PageRequest {
        namespace: options.namespace.clone(),
        label_selector: options.label_selector.clone().filter(|s| !s.trim().is_empty()),
        limit: options.page_size,
        continue_token: None,
    }
}

pub(crate) fn new_pool(options: &CollectOptions) -> Arc<ResourcePool> {
    Arc::new(ResourcePool::new(
        POOL_NAME,
        options.max_concurrency,
        options.max_memory_bytes(),
    ))
}
