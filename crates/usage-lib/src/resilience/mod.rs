//! Resilience controls applied around every remote list call
//!
//! - [`CircuitBreaker`]: stops calling a failing endpoint until it recovers
//! - [`ResourcePool`]: bounds in-flight calls and their estimated memory
//! - [`retry_with_backoff`]: retries transient failures with exponential delays

mod breaker;
mod pool;
mod retry;

pub use breaker::{
    BreakerConfig, BreakerError, CircuitBreaker, CircuitState, HALF_OPEN_SUCCESS_THRESHOLD,
};
pub use pool::{MemoryProbe, PoolStats, PoolTicket, ProcessMemoryProbe, ResourcePool};
pub use retry::{retry_with_backoff, RetryConfig, RetryError};
