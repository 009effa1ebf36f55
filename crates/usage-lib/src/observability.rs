//! Observability for collection runs
//!
//! Provides:
//! - Prometheus metrics (API call counts and latency, correlation counters,
//!   breaker state, pool and process memory)
//! - Per-run timing via [`RunStats`] and a loggable [`MetricsSummary`]

use crate::resilience::CircuitState;
use chrono::{DateTime, Utc};
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::warn;

/// Phase label for workload specification pages
pub const PHASE_WORKLOADS: &str = "workloads";
/// Phase label for usage sample pages
pub const PHASE_SAMPLES: &str = "metrics";

/// Histogram buckets for API call latency (in seconds)
const API_LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

static GLOBAL_METRICS: OnceLock<CollectorMetricsInner> = OnceLock::new();

struct CollectorMetricsInner {
    api_calls: IntCounterVec,
    api_call_seconds: HistogramVec,
    workloads_indexed: IntCounter,
    workloads_excluded: IntCounter,
    samples_processed: IntCounter,
    samples_unmatched: IntCounter,
    samples_deferred: IntCounter,
    rows_emitted: IntCounter,
    breaker_state: IntGaugeVec,
    pool_memory_bytes: IntGauge,
    resident_memory_bytes: IntGauge,
    peak_resident_memory_bytes: IntGauge,
    peak_resident: AtomicI64,
    errors: IntCounter,
}

impl CollectorMetricsInner {
    fn new() -> Self {
        Self {
            api_calls: register_int_counter_vec!(
                "kusage_api_calls_total",
                "Remote list calls by phase and outcome",
                &["phase", "outcome"]
            )
            .expect("Failed to register api_calls_total"),

            api_call_seconds: register_histogram_vec!(
                "kusage_api_call_duration_seconds",
                "Latency of remote list calls",
                &["phase"],
                API_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register api_call_duration_seconds"),

            workloads_indexed: register_int_counter!(
                "kusage_workloads_indexed_total",
                "Workload specifications added to the correlation index"
            )
            .expect("Failed to register workloads_indexed_total"),

            workloads_excluded: register_int_counter!(
                "kusage_workloads_excluded_total",
                "Workload specifications rejected by filters"
            )
            .expect("Failed to register workloads_excluded_total"),

            samples_processed: register_int_counter!(
                "kusage_samples_processed_total",
                "Usage samples correlated against the index"
            )
            .expect("Failed to register samples_processed_total"),

            samples_unmatched: register_int_counter!(
                "kusage_samples_unmatched_total",
                "Usage samples dropped without a matching workload"
            )
            .expect("Failed to register samples_unmatched_total"),

            samples_deferred: register_int_counter!(
                "kusage_samples_deferred_total",
                "Usage samples parked until the specification stream ended"
            )
            .expect("Failed to register samples_deferred_total"),

            rows_emitted: register_int_counter!(
                "kusage_rows_emitted_total",
                "Result rows produced"
            )
            .expect("Failed to register rows_emitted_total"),

            breaker_state: register_int_gauge_vec!(
                "kusage_circuit_breaker_state",
                "Circuit breaker state (0 closed, 1 half-open, 2 open)",
                &["breaker"]
            )
            .expect("Failed to register circuit_breaker_state"),

            pool_memory_bytes: register_int_gauge!(
                "kusage_pool_memory_bytes",
                "Estimated memory reserved by in-flight calls"
            )
            .expect("Failed to register pool_memory_bytes"),

            resident_memory_bytes: register_int_gauge!(
                "kusage_resident_memory_bytes",
                "Last observed resident memory of the process"
            )
            .expect("Failed to register resident_memory_bytes"),

            peak_resident_memory_bytes: register_int_gauge!(
                "kusage_peak_resident_memory_bytes",
                "Highest observed resident memory of the process"
            )
            .expect("Failed to register peak_resident_memory_bytes"),

            peak_resident: AtomicI64::new(0),

            errors: register_int_counter!("kusage_errors_total", "Fatal collection errors")
                .expect("Failed to register errors_total"),
        }
    }
}

/// Handle to the process-wide collector metrics
///
/// Clones share the same underlying Prometheus collectors.
#[derive(Clone)]
pub struct CollectorMetrics {
    _private: (),
}

impl Default for CollectorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(CollectorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &CollectorMetricsInner {
        GLOBAL_METRICS.get_or_init(CollectorMetricsInner::new)
    }

    pub fn observe_api_call(&self, phase: &str, success: bool, elapsed: Duration) {
        let outcome = if success { "success" } else { "failure" };
        let inner = self.inner();
        inner.api_calls.with_label_values(&[phase, outcome]).inc();
        inner
            .api_call_seconds
            .with_label_values(&[phase])
            .observe(elapsed.as_secs_f64());
    }

    pub fn inc_workloads_indexed(&self) {
        self.inner().workloads_indexed.inc();
    }

    pub fn inc_workloads_excluded(&self) {
        self.inner().workloads_excluded.inc();
    }

    pub fn inc_samples_processed(&self) {
        self.inner().samples_processed.inc();
    }

    pub fn inc_samples_unmatched(&self) {
        self.inner().samples_unmatched.inc();
    }

    pub fn inc_samples_deferred(&self) {
        self.inner().samples_deferred.inc();
    }

    pub fn add_rows_emitted(&self, rows: usize) {
        self.inner().rows_emitted.inc_by(rows as u64);
    }

    pub fn inc_errors(&self) {
        self.inner().errors.inc();
    }

    pub fn set_breaker_state(&self, breaker: &str, state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        };
        self.inner()
            .breaker_state
            .with_label_values(&[breaker])
            .set(value);
    }

    pub fn set_pool_memory(&self, bytes: u64) {
        self.inner().pool_memory_bytes.set(to_i64(bytes));
    }

    /// Record a resident memory reading and raise the peak if needed
    pub fn observe_resident(&self, bytes: u64) {
        let inner = self.inner();
        let bytes = to_i64(bytes);
        inner.resident_memory_bytes.set(bytes);
        let peak = inner.peak_resident.fetch_max(bytes, Ordering::AcqRel).max(bytes);
        inner.peak_resident_memory_bytes.set(peak);
    }

    fn api_calls(&self, outcome: &str) -> u64 {
        [PHASE_WORKLOADS, PHASE_SAMPLES]
            .into_iter()
            .map(|phase| {
                self.inner()
                    .api_calls
                    .with_label_values(&[phase, outcome])
                    .get()
            })
            .sum()
    }

    fn avg_api_call(&self) -> Duration {
        let (sum, count) = [PHASE_WORKLOADS, PHASE_SAMPLES]
            .into_iter()
            .map(|phase| self.inner().api_call_seconds.with_label_values(&[phase]))
            .fold((0.0, 0u64), |(sum, count), h| {
                (sum + h.get_sample_sum(), count + h.get_sample_count())
            });
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(sum / count as f64)
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Timing and error bookkeeping for one invocation
#[derive(Debug, Clone)]
pub struct RunStats {
    started_at: DateTime<Utc>,
    start: Instant,
    collection: Option<Duration>,
    analysis: Option<Duration>,
    errors: Vec<String>,
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            start: Instant::now(),
            collection: None,
            analysis: None,
            errors: Vec::new(),
        }
    }

    /// Mark the end of collection, measured from the start of the run
    pub fn finish_collection(&mut self) {
        self.collection = Some(self.start.elapsed());
    }

    /// Mark the end of analysis, measured from the end of collection
    pub fn finish_analysis(&mut self) {
        let collected = self.collection.unwrap_or_default();
        self.analysis = Some(self.start.elapsed().saturating_sub(collected));
    }

    pub fn record_error(&mut self, error: impl ToString) {
        CollectorMetrics::new().inc_errors();
        self.errors.push(error.to_string());
    }

    pub fn summary(&self, results: usize) -> MetricsSummary {
        let metrics = CollectorMetrics::new();
        let inner = metrics.inner();
        let success = metrics.api_calls("success");
        let failure = metrics.api_calls("failure");

        MetricsSummary {
            started_at: self.started_at,
            api_calls_total: success + failure,
            api_calls_successful: success,
            api_calls_failed: failure,
            avg_api_call_ms: metrics.avg_api_call().as_secs_f64() * 1000.0,
            workloads_indexed: inner.workloads_indexed.get(),
            workloads_excluded: inner.workloads_excluded.get(),
            samples_processed: inner.samples_processed.get(),
            samples_unmatched: inner.samples_unmatched.get(),
            samples_deferred: inner.samples_deferred.get(),
            rows_emitted: inner.rows_emitted.get(),
            results,
            peak_memory_mb: mib(inner.peak_resident.load(Ordering::Acquire)),
            current_memory_mb: mib(inner.resident_memory_bytes.get()),
            collection_ms: millis(self.collection),
            analysis_ms: millis(self.analysis),
            total_ms: self.start.elapsed().as_secs_f64() * 1000.0,
            error_count: self.errors.len(),
            errors: self.errors.clone(),
        }
    }
}

fn mib(bytes: i64) -> f64 {
    bytes.max(0) as f64 / (1024.0 * 1024.0)
}

fn millis(duration: Option<Duration>) -> f64 {
    duration.unwrap_or_default().as_secs_f64() * 1000.0
}

/// Performance summary of one invocation
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub started_at: DateTime<Utc>,
    pub api_calls_total: u64,
    pub api_calls_successful: u64,
    pub api_calls_failed: u64,
    pub avg_api_call_ms: f64,
    pub workloads_indexed: u64,
    pub workloads_excluded: u64,
    pub samples_processed: u64,
    pub samples_unmatched: u64,
    pub samples_deferred: u64,
    pub rows_emitted: u64,
    pub results: usize,
    pub peak_memory_mb: f64,
    pub current_memory_mb: f64,
    pub collection_ms: f64,
    pub analysis_ms: f64,
    pub total_ms: f64,
    pub error_count: usize,
    pub errors: Vec<String>,
}

impl MetricsSummary {
    /// Logged at warn so the summary shows under the default filter
    pub fn log_summary(&self) {
        warn!(
            event = "run_summary",
            api_calls_total = self.api_calls_total,
            api_calls_successful = self.api_calls_successful,
            api_calls_failed = self.api_calls_failed,
            avg_api_call_ms = self.avg_api_call_ms,
            workloads_indexed = self.workloads_indexed,
            samples_processed = self.samples_processed,
            results = self.results,
            peak_memory_mb = self.peak_memory_mb,
            collection_ms = self.collection_ms,
            analysis_ms = self.analysis_ms,
            total_ms = self.total_ms,
            "Collection run summary"
        );

        for error in &self.errors {
            warn!(event = "run_error", error = %error, "Error during run");
        }
    }
}
