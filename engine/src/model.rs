//! Core data model for manifest runs.
//!
//! This module defines the values that flow between components:
//! - AlgorithmId: which digest family a manifest was computed with
//! - HashJob: one file submitted to the worker pool
//! - FileEntry: one computed `(path, digest)` pair
//! - FileStatus, PathVerdict, VerificationReport: verifier output

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::HashError;

/// The digest algorithm recorded in a manifest.
///
/// Only the algorithm is persisted, never the backend that executed it:
/// every backend for a given algorithm produces the same digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AlgorithmId {
    /// BLAKE3, multi-threaded per file when the backend supports it
    #[serde(rename = "blake3")]
    FastParallel,
    /// SHA-256, always available
    #[serde(rename = "sha256")]
    Standard,
}

impl AlgorithmId {
    /// Name used in manifest headers and log output.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FastParallel => "blake3",
            Self::Standard => "sha256",
        }
    }

    /// Parse a manifest header name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "blake3" => Some(Self::FastParallel),
            "sha256" => Some(Self::Standard),
            _ => None,
        }
    }

    /// Default manifest file name for manifests of this algorithm.
    pub fn default_manifest_name(&self) -> &'static str {
        match self {
            Self::FastParallel => "BLAKE3SUMS",
            Self::Standard => "SHA256SUMS",
        }
    }

    /// Infer the algorithm from a default manifest file name.
    pub fn from_manifest_name(file_name: &str) -> Option<Self> {
        [Self::FastParallel, Self::Standard]
            .into_iter()
            .find(|algorithm| algorithm.default_manifest_name() == file_name)
    }

    /// Length of a digest in lowercase hex characters.
    pub fn hex_len(&self) -> usize {
        // both algorithms produce 256-bit digests
        64
    }
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A unit of hashing work, consumed exactly once by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashJob {
    /// Root-relative, forward-slash separated path
    pub relative_path: String,
    /// Path used to open the file
    pub absolute_path: PathBuf,
}

/// One hashed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub relative_path: String,
    /// Lowercase hex digest
    pub digest: String,
    pub algorithm: AlgorithmId,
}

/// Classification of one path after verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Match,
    Mismatch,
    MissingAtDestination,
    ExtraAtDestination,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileStatus::Match => write!(f, "OK"),
            FileStatus::Mismatch => write!(f, "MISMATCH"),
            FileStatus::MissingAtDestination => write!(f, "MISSING"),
            FileStatus::ExtraAtDestination => write!(f, "EXTRA"),
        }
    }
}

/// Verification outcome for a single path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathVerdict {
    pub relative_path: String,
    pub status: FileStatus,
    /// Digest recorded in the manifest (absent for extra files)
    pub expected: Option<String>,
    /// Digest computed at the destination (absent for missing files)
    pub actual: Option<String>,
}

/// Aggregate counts over a verification run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerificationCounts {
    pub matched: usize,
    pub mismatched: usize,
    pub missing: usize,
    pub extra: usize,
    /// Destination files that could not be hashed
    pub unreadable: usize,
}

/// Result of verifying a destination tree against a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub algorithm: AlgorithmId,
    /// Whether extra destination files count as failure
    pub strict: bool,
    /// One verdict per path, sorted by path
    pub verdicts: Vec<PathVerdict>,
    /// Destination files that could not be hashed, sorted by path
    pub errors: Vec<HashError>,
    pub counts: VerificationCounts,
}

impl VerificationReport {
    /// True when the destination is proven identical to the manifest.
    ///
    /// Requires no mismatched, missing, or unreadable files. Extra files
    /// only fail the run in strict mode.
    pub fn passed(&self) -> bool {
        self.counts.mismatched == 0
            && self.counts.missing == 0
            && self.counts.unreadable == 0
            && (!self.strict || self.counts.extra == 0)
    }

    /// Verdicts that are not a plain match.
    pub fn problems(&self) -> impl Iterator<Item = &PathVerdict> {
        self.verdicts.iter().filter(|v| v.status != FileStatus::Match)
    }

    /// Exit code for this report: 0 when passed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(counts: VerificationCounts, strict: bool) -> VerificationReport {
        VerificationReport {
            algorithm: AlgorithmId::Standard,
            strict,
            verdicts: Vec::new(),
            errors: Vec::new(),
            counts,
        }
    }

    #[test]
    fn test_algorithm_names_round_trip() {
        assert_eq!(AlgorithmId::from_name("blake3"), Some(AlgorithmId::FastParallel));
        assert_eq!(AlgorithmId::from_name("SHA256"), Some(AlgorithmId::Standard));
        assert_eq!(AlgorithmId::from_name("md5"), None);
        assert_eq!(AlgorithmId::FastParallel.to_string(), "blake3");
    }

    #[test]
    fn test_default_manifest_names() {
        assert_eq!(AlgorithmId::FastParallel.default_manifest_name(), "BLAKE3SUMS");
        assert_eq!(AlgorithmId::Standard.default_manifest_name(), "SHA256SUMS");
        assert_eq!(AlgorithmId::from_manifest_name("SHA256SUMS"), Some(AlgorithmId::Standard));
        assert_eq!(AlgorithmId::from_manifest_name("manifest.txt"), None);
    }

    #[test]
    fn test_extra_files_only_fail_in_strict_mode() {
        let counts = VerificationCounts {
            matched: 3,
            extra: 1,
            ..Default::default()
        };
        assert!(report(counts, false).passed());
        assert!(!report(counts, true).passed());
        assert_eq!(report(counts, true).exit_code(), 1);
    }

    #[test]
    fn test_missing_or_unreadable_fail() {
        let missing = VerificationCounts {
            missing: 1,
            ..Default::default()
        };
        assert!(!report(missing, false).passed());

        let unreadable = VerificationCounts {
            unreadable: 1,
            ..Default::default()
        };
        assert!(!report(unreadable, false).passed());
    }
}
