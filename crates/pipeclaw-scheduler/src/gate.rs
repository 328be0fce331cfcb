//! Concurrency gate for rate-limited external resources.
//!
//! Two independent limits, shared across every concurrently running
//! pipeline in the process:
//! - `ResourceGate`: a counting semaphore bounding concurrent calls.
//!   Acquisition is scoped — the permit releases on drop, so every exit
//!   path (success, failure, panic unwind) frees the slot.
//! - `SweepBudget`: max items processed per dispatcher sweep, independent
//!   from call concurrency. Many cheap calls can still overwhelm a
//!   downstream system; the budget caps volume per sweep.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use pipeclaw_core::{PipeclawError, Result};

/// Bounded-parallelism guard for calls against a rate-limited resource.
pub struct ResourceGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A held gate slot. Dropping it releases the slot.
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl ResourceGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a slot. Suspends only the calling step's task.
    pub async fn acquire(&self) -> Result<GatePermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipeclawError::Other("Resource gate closed".into()))?;
        Ok(GatePermit { _permit: permit })
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Per-sweep item counter. The dispatcher resets it at the start of each
/// sweep; steps consuming the gated resource take from it per item.
pub struct SweepBudget {
    limit: usize,
    used: AtomicUsize,
}

impl SweepBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    /// Take one item slot. Returns false once the sweep's budget is spent.
    pub fn try_take(&self) -> bool {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                if used < self.limit { Some(used + 1) } else { None }
            })
            .is_ok()
    }

    /// Start a new sweep.
    pub fn reset(&self) {
        self.used.store(0, Ordering::SeqCst);
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used.load(Ordering::SeqCst))
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_gate_bounds_concurrency() {
        let gate = Arc::new(ResourceGate::new(2));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire().await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let gate = ResourceGate::new(1);
        {
            let _permit = gate.acquire().await.unwrap();
            assert_eq!(gate.available(), 0);
        }
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_permit_released_on_early_return() {
        async fn failing_call(gate: &ResourceGate) -> Result<()> {
            let _permit = gate.acquire().await?;
            Err(PipeclawError::step("gated", "upstream down"))
        }

        let gate = ResourceGate::new(1);
        assert!(failing_call(&gate).await.is_err());
        // The error path still released the slot.
        assert_eq!(gate.available(), 1);
    }

    #[test]
    fn test_budget_exhausts_and_resets() {
        let budget = SweepBudget::new(3);
        assert!(budget.try_take());
        assert!(budget.try_take());
        assert!(budget.try_take());
        assert!(!budget.try_take());
        assert_eq!(budget.remaining(), 0);

        budget.reset();
        assert_eq!(budget.remaining(), 3);
        assert!(budget.try_take());
    }

    #[test]
    fn test_budget_concurrent_takes_never_exceed_limit() {
        let budget = Arc::new(SweepBudget::new(10));
        let taken = Arc::new(AtomicUsize::new(0));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let budget = budget.clone();
            let taken = taken.clone();
            threads.push(std::thread::spawn(move || {
                for _ in 0..10 {
                    if budget.try_take() {
                        taken.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(taken.load(Ordering::SeqCst), 10);
    }
}
