//! Lock-free circuit breaker
//!
//! State lives in atomics and every transition is a compare-and-swap, so
//! concurrent callers never serialize on a lock. While half-open a single
//! probe call is admitted at a time; everything else is rejected as if the
//! circuit were still open.

use crate::observability::CollectorMetrics;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Consecutive half-open successes needed to close the circuit
pub const HALF_OPEN_SUCCESS_THRESHOLD: u32 = 3;

const CLOSED: u8 = 0;
const HALF_OPEN: u8 = 1;
const OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            CLOSED => Self::Closed,
            HALF_OPEN => Self::HalfOpen,
            _ => Self::Open,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Closed => CLOSED,
            Self::HalfOpen => HALF_OPEN,
            Self::Open => OPEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit (default: 5)
    pub max_failures: u32,
    /// Time the circuit stays open after the last failure (default: 30s)
    pub timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    #[error("{0}")]
    Inner(E),
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: AtomicU8,
    failures: AtomicU32,
    successes: AtomicU32,
    /// Nanoseconds since `epoch` of the most recent failure
    last_failure: AtomicU64,
    probe_in_flight: AtomicBool,
    epoch: Instant,
}

/// Clears the half-open probe slot when the probe finishes or is dropped
struct ProbeGuard<'a> {
    slot: &'a AtomicBool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::Release);
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let breaker = Self {
            name: name.into(),
            config,
            state: AtomicU8::new(CLOSED),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            last_failure: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            epoch: Instant::now(),
        };
        CollectorMetrics::new().set_breaker_state(&breaker.name, CircuitState::Closed);
        breaker
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Run `op` if the circuit admits it
    ///
    /// The operation's own error is returned untouched inside `Inner`; the
    /// breaker only records the outcome.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(op, |_| true).await
    }

    /// Like [`call`](Self::call), but errors for which `counts` returns false
    /// (a caller-side cancellation, say) are neither failures nor successes.
    pub async fn call_classified<T, E, F, Fut, C>(
        &self,
        op: F,
        counts: C,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        let probe = self.admit().ok_or_else(|| BreakerError::Open {
            name: self.name.clone(),
        })?;

        match op().await {
            Ok(value) => {
                self.record_success(probe.is_some());
                Ok(value)
            }
            Err(err) => {
                if counts(&err) {
                    self.record_failure();
                }
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// `None` rejects the call; `Some(None)` admits it while closed;
    /// `Some(Some(guard))` admits the half-open probe.
    fn admit(&self) -> Option<Option<ProbeGuard<'_>>> {
        loop {
            match self.state() {
                CircuitState::Closed => return Some(None),
                CircuitState::Open => {
                    if self.since_last_failure() < self.config.timeout {
                        return None;
                    }
                    if self.transition(CircuitState::Open, CircuitState::HalfOpen) {
                        self.successes.store(0, Ordering::Release);
                        debug!(breaker = %self.name, "Circuit half-open, probing");
                    }
                }
                CircuitState::HalfOpen => {
                    return self
                        .probe_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .ok()
                        .map(|_| {
                            Some(ProbeGuard {
                                slot: &self.probe_in_flight,
                            })
                        });
                }
            }
        }
    }

    /// Only the probe's own success counts toward closing a half-open circuit;
    /// calls admitted before the circuit opened do not.
    fn record_success(&self, probe: bool) {
        self.failures.store(0, Ordering::Release);

        if probe && self.state() == CircuitState::HalfOpen {
            let successes = self.successes.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= HALF_OPEN_SUCCESS_THRESHOLD
                && self.transition(CircuitState::HalfOpen, CircuitState::Closed)
            {
                self.successes.store(0, Ordering::Release);
                info!(breaker = %self.name, "Circuit closed after recovery");
            }
        }
    }

    fn record_failure(&self) {
        self.last_failure
            .store(self.epoch.elapsed().as_nanos() as u64, Ordering::Release);

        match self.state() {
            CircuitState::HalfOpen => {
                if self.transition(CircuitState::HalfOpen, CircuitState::Open) {
                    self.successes.store(0, Ordering::Release);
                    warn!(breaker = %self.name, "Probe failed, circuit re-opened");
                }
            }
            CircuitState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.max_failures
                    && self.transition(CircuitState::Closed, CircuitState::Open)
                {
                    warn!(
                        breaker = %self.name,
                        failures,
                        timeout_secs = self.config.timeout.as_secs(),
                        "Circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            CollectorMetrics::new().set_breaker_state(&self.name, to);
        }
        swapped
    }

    fn since_last_failure(&self) -> Duration {
        let last = Duration::from_nanos(self.last_failure.load(Ordering::Acquire));
        self.epoch.elapsed().saturating_sub(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                max_failures: 3,
                timeout: Duration::from_secs(10),
            },
        )
    }

    async fn fail(breaker: &CircuitBreaker) {
        let result: Result<(), BreakerError<&str>> = breaker.call(|| async { Err("down") }).await;
        assert!(matches!(result, Err(BreakerError::Inner("down"))));
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let result: Result<(), BreakerError<&str>> = breaker.call(|| async { Ok(()) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_max_failures() {
        let breaker = breaker();

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_invoking() {
        let breaker = breaker();
        for _ in 0..3 {
            fail(&breaker).await;
        }

        let calls = AtomicUsize::new(0);
        let result: Result<(), BreakerError<&str>> = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Open { ref name }) if name == "test"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncounted_errors_leave_state_alone() {
        let breaker = breaker();
        for _ in 0..5 {
            let result: Result<(), BreakerError<&str>> = breaker
                .call_classified(|| async { Err("cancelled") }, |_| false)
                .await;
            assert!(matches!(result, Err(BreakerError::Inner("cancelled"))));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breaker = breaker();
        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await;
        assert_eq!(breaker.failure_count(), 0);
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_after_timeout() {
        let breaker = breaker();
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        let calls = AtomicUsize::new(0);
        let slow = breaker.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, &str>(())
        });
        let concurrent = breaker.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, &str>(())
        });

        let (first, second) = tokio::join!(slow, concurrent);
        assert!(first.is_ok());
        assert!(matches!(second, Err(BreakerError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_three_successes() {
        let breaker = breaker();
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        succeed(&breaker).await;
        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_admitted_while_closed_do_not_close_half_open() {
        let breaker = breaker();
        let slow_success = || {
            breaker.call(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, &str>(())
            })
        };
        let outage = async {
            for _ in 0..3 {
                fail(&breaker).await;
            }
            tokio::time::advance(Duration::from_secs(11)).await;
            succeed(&breaker).await;
        };

        let (first, second, ()) = tokio::join!(slow_success(), slow_success(), outage);
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker();
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        succeed(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // fresh timeout starts from the probe failure
        let result: Result<(), BreakerError<&str>> = breaker.call(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
    }
}
