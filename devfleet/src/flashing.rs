//! Bounded concurrency for flashing operations.
//!
//! A [`FlashingPermit`] is held for the duration of one flash and returns to
//! the gate when dropped, on every exit path.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

pub struct FlashingPermits {
    semaphore: Option<Arc<Semaphore>>,
    limit: Option<usize>,
    waiting: Arc<AtomicUsize>,
}

impl FlashingPermits {
    /// `None` never blocks.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            semaphore: limit.map(|n| Arc::new(Semaphore::new(n))),
            limit,
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Free permits right now; `usize::MAX` when unbounded.
    pub fn available_permits(&self) -> usize {
        match &self.semaphore {
            Some(semaphore) => semaphore.available_permits(),
            None => usize::MAX,
        }
    }

    /// Callers currently blocked in [`acquire`](Self::acquire).
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Wait for a free permit.
    pub async fn acquire(&self) -> FlashingPermit {
        let Some(semaphore) = &self.semaphore else {
            return FlashingPermit::unbounded();
        };

        let queued = self.waiting.fetch_add(1, Ordering::AcqRel);
        let waiter = WaitingGuard(self.waiting.as_ref());
        tracing::info!(
            limit = ?self.limit,
            available = semaphore.available_permits(),
            queued,
            "Requesting a flashing permit"
        );
        let start = Instant::now();
        let permit = Arc::clone(semaphore).acquire_owned().await;
        drop(waiter);

        match permit {
            Ok(permit) => {
                tracing::info!(waited = ?start.elapsed(), "Flashing permit obtained");
                FlashingPermit {
                    permit: Some(permit),
                    acquired_at: Instant::now(),
                }
            }
            // The semaphore is never closed while the gate is alive.
            Err(_) => {
                tracing::error!("Flashing semaphore closed, proceeding without a permit");
                FlashingPermit::unbounded()
            }
        }
    }

    pub fn try_acquire(&self) -> Option<FlashingPermit> {
        let Some(semaphore) = &self.semaphore else {
            return Some(FlashingPermit::unbounded());
        };
        Arc::clone(semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| FlashingPermit {
                permit: Some(permit),
                acquired_at: Instant::now(),
            })
    }
}

/// Counts a caller in [`FlashingPermits::acquire`] until it stops waiting,
/// including when the acquiring future is dropped.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One unit of flashing concurrency.
#[must_use = "dropping the permit releases it immediately"]
pub struct FlashingPermit {
    permit: Option<OwnedSemaphorePermit>,
    acquired_at: Instant,
}

impl FlashingPermit {
    fn unbounded() -> Self {
        Self {
            permit: None,
            acquired_at: Instant::now(),
        }
    }

    pub fn held_for(&self) -> std::time::Duration {
        self.acquired_at.elapsed()
    }

    pub fn release(self) {}
}

impl Drop for FlashingPermit {
    fn drop(&mut self) {
        if self.permit.take().is_some() {
            tracing::info!(held = ?self.acquired_at.elapsed(), "Returned flashing permit");
        }
    }
}
