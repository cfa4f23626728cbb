//! Download concurrency gate.
//!
//! A counting semaphore that bounds how many downloads run at once across the
//! whole process. Acquisition is scoped: the permit returns its slot when
//! dropped, so every exit path — success, failure, cancellation, panic —
//! releases exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Global semaphore bounding concurrent downloads
pub struct DownloadGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    active: Arc<AtomicUsize>,
}

/// A held download slot; dropping it releases the slot
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DownloadGate {
    /// Create a gate with `capacity` slots (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a slot, or give up when `cancel` fires.
    ///
    /// Returns `None` on cancellation. The permit must be held for the whole
    /// download and released by dropping it.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<GatePermit> {
        let semaphore = self.semaphore.clone();

        let permit = tokio::select! {
            permit = semaphore.acquire_owned() => {
                match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        // The semaphore is never closed while the gate lives
                        tracing::warn!("download gate semaphore closed unexpectedly");
                        return None;
                    }
                }
            }
            _ = cancel.cancelled() => return None,
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        Some(GatePermit {
            _permit: permit,
            active: self.active.clone(),
        })
    }

    /// Number of downloads currently holding a slot
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Configured slot count
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
