//! Progress reporting and cancellation.
//!
//! `ProgressCallback` decouples hashing runs from any particular front end.
//! Callbacks are invoked from worker threads and never influence the result.
//! `CancellationToken` is the external stop signal for a run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::HashError;

/// Trait for receiving progress updates from a hashing run.
///
/// Methods are called concurrently from worker threads, in no particular
/// order relative to each other.
pub trait ProgressCallback: Send + Sync {
    /// Called once before any file is hashed.
    fn on_run_started(&self, _label: &str) {}

    /// Called after a file was hashed successfully.
    fn on_file_hashed(&self, relative_path: &str, bytes: u64);

    /// Called when a file could not be enumerated or hashed.
    fn on_file_failed(&self, _error: &HashError) {}

    /// Called once after every admitted job finished.
    fn on_run_completed(&self, _files: usize, _bytes: u64) {}
}

/// Shared stop flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the run stop admitting work.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_shared_between_clones() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }
}
