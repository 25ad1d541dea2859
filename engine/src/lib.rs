//! # Mirror Engine - Content-Addressed Manifests
//!
//! Proves that a bulk copy of a file tree landed byte-identical at its
//! destination. The engine hashes every regular file of the source tree into a
//! sorted, canonical manifest, and later rehashes the destination and
//! classifies each path against that manifest.
//!
//! ## Overview
//!
//! - Deterministic, symlink-free tree enumeration
//! - Fast (BLAKE3) or standard (SHA-256) digests, with backend fallback
//! - Bounded parallel hashing with per-file error isolation
//! - Atomic manifest writes, or streaming to stdout
//! - Verification with Match / Mismatch / Missing / Extra verdicts
//!
//! ## Basic Usage
//!
//! ```no_run
//! use mirror_engine::{
//!     make_manifest, read_manifest, resolve_backend, verify_against, Availability,
//!     CancellationToken, ManifestLocation, RunConfig,
//! };
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RunConfig::default();
//! let availability = Availability::probe(&config.external_program);
//! let backend = resolve_backend(&config, &availability)?;
//! let cancel = CancellationToken::new();
//!
//! let location = ManifestLocation::File("/data/src/BLAKE3SUMS".into());
//! make_manifest(Path::new("/data/src"), &location, &config, backend, &cancel, None)?;
//!
//! // ... copy /data/src to /mnt/dst ...
//!
//! let manifest = read_manifest(&location, None)?;
//! let report = verify_against(&manifest, Path::new("/mnt/dst"), &config, &availability, None, &cancel, None)?;
//! println!("passed: {}", report.passed());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (AlgorithmId, FileEntry, verdicts)
//! - **error**: Run-level and per-file error types
//! - **fs_ops**: Tree enumeration and low-level file operations
//! - **algorithm**: Algorithm and backend selection
//! - **checksums**: Digest backends
//! - **pool**: Bounded hash worker pool
//! - **manifest**: Manifest format, atomic and streamed output
//! - **verify**: Destination verification
//! - **copy**: Copy collaborators
//! - **config**: Run configuration
//! - **job**: Run pipeline (make-manifest, verify)
//! - **progress**: Progress callback trait and cancellation

pub mod algorithm;
pub mod checksums;
pub mod config;
pub mod copy;
pub mod error;
pub mod fs_ops;
pub mod job;
pub mod manifest;
pub mod model;
pub mod pool;
pub mod progress;
pub mod verify;

// Re-export main types and functions
pub use algorithm::{AlgorithmMode, Availability, SelectorConfig};
pub use checksums::Backend;
pub use config::RunConfig;
pub use copy::{CopyCollaborator, CopyReport, NativeCopier, RsyncCopier};
pub use error::{EngineError, HashError, HashErrorKind};
pub use fs_ops::ExcludeRules;
pub use job::{
    build_manifest, default_manifest_path, locate_manifest, make_manifest, manifest_hint, resolve_backend,
    verify_against, ManifestRun,
};
pub use manifest::{read_manifest, write_manifest, Manifest, ManifestLocation};
pub use model::{AlgorithmId, FileEntry, FileStatus, PathVerdict, VerificationCounts, VerificationReport};
pub use progress::{CancellationToken, ProgressCallback};
