//! Per-host concurrency gate.
//!
//! A counting admission control primitive built on `tokio::sync::Semaphore`,
//! which hands out permits in FIFO order. Slots are tracked explicitly in
//! `in_flight` so callers can pair `acquire`/`release` across code paths
//! where holding a guard is awkward; `acquire_owned` offers the RAII form.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{MisuseError, ThrottleError, ThrottleResult};

/// Bounds simultaneous in-flight requests to one host.
#[derive(Debug)]
pub struct ConcurrencyGate {
    host: String,
    semaphore: Semaphore,
    max_concurrency: usize,
    in_flight: AtomicUsize,
    total_acquired: AtomicU64,
    strict_misuse: bool,
}

impl ConcurrencyGate {
    pub fn new(host: impl Into<String>, max_concurrency: usize, strict_misuse: bool) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            host: host.into(),
            semaphore: Semaphore::new(max_concurrency),
            max_concurrency,
            in_flight: AtomicUsize::new(0),
            total_acquired: AtomicU64::new(0),
            strict_misuse,
        }
    }

    /// Wait for a free slot and take it.
    ///
    /// Cancel safe: dropping the future before it resolves leaves no slot
    /// held. Once it resolves the slot is held and must be released.
    pub async fn acquire(&self) -> ThrottleResult<()> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ThrottleError::GateClosed(self.host.clone()))?;
        // No await between here and the increment.
        permit.forget();
        self.mark_acquired();
        Ok(())
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.mark_acquired();
                true
            }
            Err(_) => false,
        }
    }

    /// Like `acquire`, but the slot is returned when the permit is dropped.
    pub async fn acquire_owned(self: Arc<Self>) -> ThrottleResult<GatePermit> {
        self.acquire().await?;
        Ok(GatePermit {
            gate: self,
            released: false,
        })
    }

    /// Return a slot taken by `acquire` or `try_acquire`.
    ///
    /// Releasing more than was acquired is a caller bug: it panics in strict
    /// mode, otherwise `in_flight` stays at zero and the error is logged and
    /// returned.
    pub fn release(&self) -> ThrottleResult<()> {
        match self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(_) => {
                self.semaphore.add_permits(1);
                Ok(())
            }
            Err(_) => {
                let err = MisuseError::ReleaseWithoutAcquire(self.host.clone());
                if self.strict_misuse {
                    panic!("{}", err);
                }
                warn!("{}; ignoring", err);
                Err(err.into())
            }
        }
    }

    /// Host key this gate guards.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Configured cap, never below one.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Slots that can be taken without waiting.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots handed out since the gate was created.
    pub fn total_acquired(&self) -> u64 {
        self.total_acquired.load(Ordering::Relaxed)
    }

    fn mark_acquired(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(now <= self.max_concurrency);
        self.total_acquired.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Acquired slot for {} ({}/{})",
            self.host, now, self.max_concurrency
        );
    }
}

/// A held gate slot, released on drop.
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<ConcurrencyGate>,
    released: bool,
}

impl GatePermit {
    pub fn host(&self) -> &str {
        self.gate.host()
    }

    /// Release now instead of at drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            // Balanced by construction; cannot underflow.
            let _ = self.gate.release();
        }
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.release_inner();
    }
}
