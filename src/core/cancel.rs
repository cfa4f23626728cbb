//! Cancellation registry for in-flight downloads.
//!
//! One entry per active download, keyed by the item's external id. `cancel`
//! removes the entry and fires its token in one locked step, so among any
//! number of concurrent cancels for the same id exactly one observes the
//! entry and reports success.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Guarded map from external id to the abort token of its running download
#[derive(Default)]
pub struct CancelRegistry {
    entries: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a download's abort token.
    ///
    /// A stale entry under the same id (a previous attempt that failed to
    /// deregister) is replaced and its token fired, so the old child cannot
    /// linger unsupervised.
    pub fn register(&self, external_id: &str, token: CancellationToken) {
        let mut entries = self.lock();
        if let Some(stale) = entries.insert(external_id.to_string(), token) {
            tracing::warn!(item = %external_id, "replacing stale cancellation entry");
            stale.cancel();
        }
    }

    /// Remove an entry after the download finishes (any outcome)
    pub fn deregister(&self, external_id: &str) {
        self.lock().remove(external_id);
    }

    /// Take-and-cancel: remove the entry and fire its token.
    ///
    /// Returns `true` iff this call removed the entry. Concurrent cancels for
    /// one id resolve to exactly one `true`.
    pub fn cancel(&self, external_id: &str) -> bool {
        let removed = self.lock().remove(external_id);
        match removed {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a download is registered for this id
    pub fn contains(&self, external_id: &str) -> bool {
        self.lock().contains_key(external_id)
    }

    /// Number of registered downloads
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            // A poisoned registry still holds valid tokens
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
