//! Workload usage collection library
//!
//! This crate provides the core functionality for:
//! - Paginated fetching of workload specifications and usage samples
//! - Resilience controls around remote calls (circuit breaker, resource pool, retry)
//! - Correlating samples with specifications and computing usage-to-limit rows
//! - Ranking the resulting rows
//! - Prometheus metrics and run summaries

pub mod analyzer;
pub mod collector;
pub mod error;
pub mod filter;
pub mod models;
pub mod observability;
pub mod options;
pub mod quantity;
pub mod resilience;
pub mod source;

pub use analyzer::{sort_rows, top_n, SortKey};
pub use collector::{BatchCollector, StreamingCollector};
pub use error::{CollectError, FetchError};
pub use models::*;
pub use observability::{CollectorMetrics, MetricsSummary, RunStats};
pub use options::{CollectOptions, Granularity, MissPolicy, ResourceKind};
pub use resilience::{BreakerConfig, RetryConfig};
pub use source::{ClusterSource, Page, PageRequest};
