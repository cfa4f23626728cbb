//! Shared state for API handlers

use crate::core::VodMirror;
use std::sync::Arc;

/// Application state shared across all API routes
#[derive(Clone)]
pub struct AppState {
    /// The processing core
    pub core: Arc<VodMirror>,
}

impl AppState {
    /// Create state over the shared core
    pub fn new(core: Arc<VodMirror>) -> Self {
        Self { core }
    }
}
