//! Run configuration.
//!
//! `RunConfig` carries every knob of a make-manifest or verify run. Front
//! ends fill it from arguments and environment; the engine validates it and
//! derives the worker pool settings from it.

use std::path::PathBuf;
use std::thread;

use tracing::warn;

use crate::algorithm::{SelectorConfig, DEFAULT_EXTERNAL_PROGRAM};
use crate::checksums::Backend;
use crate::error::EngineError;
use crate::fs_ops::ExcludeRules;
use crate::pool::HashSettings;

/// Pending jobs buffered per worker before the enumerator blocks.
pub const QUEUE_DEPTH_PER_WORKER: usize = 4;

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Number of files hashed concurrently
    pub jobs: usize,
    /// Internal threads per file for the fast algorithm (0 = automatic)
    pub threads: usize,
    pub selector: SelectorConfig,
    /// Name or path of the external fast-hash program
    pub external_program: PathBuf,
    /// Abort the run on the first per-file error
    pub fail_fast: bool,
    /// Count extra destination files as verification failure
    pub strict: bool,
    /// Reduce `threads` so `jobs * threads` stays within the core count
    pub cap_parallelism: bool,
    pub excludes: ExcludeRules,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            jobs: logical_cores(),
            threads: 0,
            selector: SelectorConfig::default(),
            external_program: PathBuf::from(DEFAULT_EXTERNAL_PROGRAM),
            fail_fast: false,
            strict: false,
            cap_parallelism: true,
            excludes: ExcludeRules::default(),
        }
    }
}

impl RunConfig {
    /// Reject parameter combinations the engine cannot run.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.jobs == 0 {
            return Err(EngineError::Configuration("jobs must be a positive integer".to_string()));
        }
        if self.external_program.as_os_str().is_empty() {
            return Err(EngineError::Configuration(
                "external hash program name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Worker pool settings for `backend`, with threads resolved against
    /// the machine's logical core count.
    pub fn hash_settings(&self, backend: Backend) -> HashSettings {
        let threads = resolve_threads(&backend, self.jobs, self.threads, logical_cores(), self.cap_parallelism);
        HashSettings {
            backend,
            jobs: self.jobs,
            threads,
            fail_fast: self.fail_fast,
        }
    }
}

/// Logical core count, 1 if it cannot be determined.
pub fn logical_cores() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Decide the per-file internal thread count.
///
/// - The standard backend is single-threaded per file: always 1.
/// - `requested == 0` is automatic: the in-process backend gets
///   `max(1, cores / jobs)`, the external backend keeps 0 and chooses itself.
/// - With `cap` set, an explicit request is lowered to `max(1, cores / jobs)`
///   when `jobs * requested` exceeds `cores`.
pub fn resolve_threads(backend: &Backend, jobs: usize, requested: usize, cores: usize, cap: bool) -> usize {
    let fair_share = (cores / jobs.max(1)).max(1);
    match backend {
        _ if !backend.supports_internal_threads() => 1,
        Backend::InProcessLibrary if requested == 0 => fair_share,
        Backend::ExternalProcess { .. } if requested == 0 => 0,
        _ if cap && jobs.saturating_mul(requested) > cores => {
            warn!(
                jobs,
                requested,
                cores,
                capped = fair_share,
                "jobs x threads exceeds logical cores, capping threads per file"
            );
            fair_share
        }
        _ => requested,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RunConfig::default();
        assert!(config.jobs >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_jobs_is_rejected() {
        let config = RunConfig {
            jobs: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_standard_backend_is_single_threaded() {
        assert_eq!(resolve_threads(&Backend::BuiltinStandard, 2, 8, 16, true), 1);
        assert_eq!(resolve_threads(&Backend::BuiltinStandard, 2, 0, 16, false), 1);
    }

    #[test]
    fn test_automatic_threads() {
        assert_eq!(resolve_threads(&Backend::InProcessLibrary, 4, 0, 16, true), 4);
        assert_eq!(resolve_threads(&Backend::InProcessLibrary, 32, 0, 16, true), 1);
        let external = Backend::ExternalProcess {
            program: PathBuf::from("b3sum"),
        };
        assert_eq!(resolve_threads(&external, 4, 0, 16, true), 0);
    }

    #[test]
    fn test_oversubscription_is_capped() {
        assert_eq!(resolve_threads(&Backend::InProcessLibrary, 8, 8, 16, true), 2);
        assert_eq!(resolve_threads(&Backend::InProcessLibrary, 8, 8, 16, false), 8);
        assert_eq!(resolve_threads(&Backend::InProcessLibrary, 2, 8, 16, true), 8);
    }
}
