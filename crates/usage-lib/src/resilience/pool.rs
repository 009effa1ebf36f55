//! Resource pool with concurrency and memory admission control
//!
//! A ticket holds one concurrency slot plus an estimated memory reservation.
//! Admission also consults the process's resident memory and refuses new work
//! once it passes 80% of the pool ceiling.

use crate::error::PoolError;
use crate::observability::CollectorMetrics;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::{Notify, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Share of the ceiling the process may occupy before admissions stop
const RESERVE_PERCENT: u64 = 80;

/// Fallback recheck period while waiting for memory headroom
const MEMORY_RECHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Source of the current process's resident memory
pub trait MemoryProbe: Send + Sync {
    fn resident_bytes(&self) -> u64;
}

/// Reads resident memory of this process through `sysinfo`
pub struct ProcessMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn resident_bytes(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let Ok(mut system) = self.system.lock() else {
            return 0;
        };
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub current_memory_bytes: u64,
    pub active: usize,
    pub max_concurrency: usize,
}

pub struct ResourcePool {
    name: String,
    permits: Semaphore,
    max_concurrency: usize,
    capacity_bytes: u64,
    reserved_bytes: AtomicU64,
    released: Notify,
    probe: Arc<dyn MemoryProbe>,
}

/// Admission for one in-flight operation; releases its reservation on drop
#[must_use = "dropping the ticket releases the reservation immediately"]
pub struct PoolTicket<'a> {
    pool: &'a ResourcePool,
    cost: u64,
    _permit: SemaphorePermit<'a>,
}

impl PoolTicket<'_> {
    pub fn cost(&self) -> u64 {
        self.cost
    }
}

impl Drop for PoolTicket<'_> {
    fn drop(&mut self) {
        self.pool.release_memory(self.cost);
    }
}

impl ResourcePool {
    pub fn new(name: impl Into<String>, max_concurrency: usize, capacity_bytes: u64) -> Self {
        Self::with_probe(
            name,
            max_concurrency,
            capacity_bytes,
            Arc::new(ProcessMemoryProbe::new()),
        )
    }

    pub fn with_probe(
        name: impl Into<String>,
        max_concurrency: usize,
        capacity_bytes: u64,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            name: name.into(),
            permits: Semaphore::new(max_concurrency),
            max_concurrency,
            capacity_bytes,
            reserved_bytes: AtomicU64::new(0),
            released: Notify::new(),
            probe,
        }
    }

    /// Wait for a concurrency slot and `cost` bytes of headroom
    pub async fn acquire(
        &self,
        cost: u64,
        cancel: &CancellationToken,
    ) -> Result<PoolTicket<'_>, PoolError> {
        if cost > self.capacity_bytes {
            return Err(PoolError::ExceedsCapacity {
                pool: self.name.clone(),
                requested: cost,
                capacity: self.capacity_bytes,
            });
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| PoolError::Closed)?,
        };

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_reserve(cost)? {
                debug!(pool = %self.name, cost, "Resource pool admitted operation");
                return Ok(PoolTicket {
                    pool: self,
                    cost,
                    _permit: permit,
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                _ = &mut notified => {}
                _ = tokio::time::sleep(MEMORY_RECHECK_INTERVAL) => {}
            }
        }
    }

    /// Return `cost` bytes to the pool, clamping at zero
    pub fn release_memory(&self, cost: u64) {
        let previous = self
            .reserved_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(cost))
            })
            .unwrap_or(0);
        CollectorMetrics::new().set_pool_memory(previous.saturating_sub(cost));
        self.released.notify_waiters();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            current_memory_bytes: self.reserved_bytes.load(Ordering::Acquire),
            active: self.max_concurrency - self.permits.available_permits(),
            max_concurrency: self.max_concurrency,
        }
    }

    fn reserve_threshold(&self) -> u64 {
        self.capacity_bytes / 100 * RESERVE_PERCENT
            + self.capacity_bytes % 100 * RESERVE_PERCENT / 100
    }

    /// `Ok(false)` means wait for headroom
    fn try_reserve(&self, cost: u64) -> Result<bool, PoolError> {
        let resident = self.probe.resident_bytes();
        CollectorMetrics::new().observe_resident(resident);
        let threshold = self.reserve_threshold();
        if resident >= threshold {
            // Nothing outstanding in this pool can free memory for us
            if self.reserved_bytes.load(Ordering::Acquire) == 0 {
                warn!(
                    pool = %self.name,
                    resident_bytes = resident,
                    threshold_bytes = threshold,
                    "Process memory above admission threshold"
                );
                return Err(PoolError::MemoryPressure {
                    pool: self.name.clone(),
                    resident,
                    threshold,
                });
            }
            return Ok(false);
        }

        let capacity = self.capacity_bytes;
        let reserved = self
            .reserved_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(cost).filter(|next| *next <= capacity)
            });

        match reserved {
            Ok(previous) => {
                CollectorMetrics::new().set_pool_memory(previous + cost);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedMemory(AtomicU64);

    impl MemoryProbe for FixedMemory {
        fn resident_bytes(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn pool(max_concurrency: usize, capacity: u64) -> ResourcePool {
        ResourcePool::with_probe(
            "test",
            max_concurrency,
            capacity,
            Arc::new(FixedMemory(AtomicU64::new(0))),
        )
    }

    #[tokio::test]
    async fn test_matched_acquire_release_restores_memory() {
        let pool = pool(4, 1000);
        let cancel = CancellationToken::new();

        let a = pool.acquire(100, &cancel).await.unwrap();
        let b = pool.acquire(250, &cancel).await.unwrap();
        assert_eq!(pool.stats().current_memory_bytes, 350);
        assert_eq!(pool.stats().active, 2);

        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.current_memory_bytes, 0);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.max_concurrency, 4);
    }

    #[tokio::test]
    async fn test_duplicate_release_clamps_at_zero() {
        let pool = pool(2, 1000);
        let cancel = CancellationToken::new();

        let ticket = pool.acquire(100, &cancel).await.unwrap();
        pool.release_memory(100);
        pool.release_memory(100);
        assert_eq!(pool.stats().current_memory_bytes, 0);
        drop(ticket);
        assert_eq!(pool.stats().current_memory_bytes, 0);
    }

    #[tokio::test]
    async fn test_cost_above_capacity_is_rejected() {
        let pool = pool(2, 1000);
        let cancel = CancellationToken::new();

        let err = pool.acquire(1001, &cancel).await.err().unwrap();
        assert!(matches!(
            err,
            PoolError::ExceedsCapacity {
                requested: 1001,
                capacity: 1000,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_for_slot_observes_cancellation() {
        let pool = pool(1, 1000);
        let cancel = CancellationToken::new();
        let _held = pool.acquire(10, &cancel).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = pool.acquire(10, &cancel).await.err().unwrap();
        assert_eq!(err, PoolError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_memory_headroom() {
        let pool = Arc::new(pool(4, 100));
        let cancel = CancellationToken::new();

        let held = pool.acquire(80, &cancel).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(200), pool.acquire(30, &cancel)).await;
        assert!(blocked.is_err());

        drop(held);
        let ticket = pool.acquire(30, &cancel).await.unwrap();
        assert_eq!(ticket.cost(), 30);
        assert_eq!(pool.stats().current_memory_bytes, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resident_memory_pressure() {
        let probe = Arc::new(FixedMemory(AtomicU64::new(0)));
        let pool = ResourcePool::with_probe("pressure", 4, 100, probe.clone());
        let cancel = CancellationToken::new();

        let held = pool.acquire(10, &cancel).await.unwrap();
        probe.0.store(85, Ordering::SeqCst);

        // an outstanding ticket may still free memory, so admission waits
        let waiting = tokio::time::timeout(Duration::from_millis(200), pool.acquire(10, &cancel)).await;
        assert!(waiting.is_err());

        drop(held);
        let err = pool.acquire(10, &cancel).await.err().unwrap();
        assert!(matches!(err, PoolError::MemoryPressure { threshold: 80, .. }));
    }
}
