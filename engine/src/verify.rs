//! Destination verification.
//!
//! The verifier rehashes every regular file under the destination with the
//! manifest's own algorithm and diffs the result against the manifest. Sizes
//! and timestamps are never consulted.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{info, warn};

use crate::error::{EngineError, HashError};
use crate::fs_ops::{ExcludeRules, PathEnumerator};
use crate::manifest::Manifest;
use crate::model::{FileStatus, PathVerdict, VerificationCounts, VerificationReport};
use crate::pool::{HashPool, HashSettings, PoolOutcome};
use crate::progress::{CancellationToken, ProgressCallback};

/// Everything a verification run needs besides the manifest and the tree.
pub struct VerifyRequest<'a> {
    pub settings: HashSettings,
    /// Junk rules for files the manifest does not list
    pub excludes: ExcludeRules,
    /// Manifest file to leave out of the destination listing, if it lives there
    pub manifest_file: Option<&'a Path>,
    pub strict: bool,
}

/// Verify `destination` against `manifest`.
///
/// # Errors
/// `Configuration` if the backend does not compute the manifest's
/// algorithm; filesystem errors for an unusable destination root;
/// `Cancelled` if stopped. A failed comparison is not an error: inspect
/// [`VerificationReport::passed`].
pub fn verify_tree(
    manifest: &Manifest,
    destination: &Path,
    request: VerifyRequest<'_>,
    cancel: &CancellationToken,
    progress: Option<&dyn ProgressCallback>,
) -> Result<VerificationReport, EngineError> {
    let backend_algorithm = request.settings.backend.algorithm();
    if backend_algorithm != manifest.algorithm() {
        return Err(EngineError::Configuration(format!(
            "manifest uses {} but the verifier was given a {} backend",
            manifest.algorithm(),
            backend_algorithm
        )));
    }

    // Everything is hashed; junk rules only decide which unlisted files count as extra.
    let mut enumerator = PathEnumerator::new(destination, ExcludeRules::none())?;
    if let Some(manifest_file) = request.manifest_file {
        enumerator.exclude_file(manifest_file);
    }

    info!(
        destination = %destination.display(),
        algorithm = %manifest.algorithm(),
        expected = manifest.len(),
        "verifying destination"
    );
    if let Some(progress) = progress {
        progress.on_run_started("Verifying");
    }

    let pool = HashPool::new(request.settings);
    let observed = pool.run(enumerator.iter(), cancel, progress)?;
    let report = classify(manifest, observed, &request.excludes, request.strict);

    if report.passed() {
        info!(matched = report.counts.matched, extra = report.counts.extra, "verification passed");
    } else {
        warn!(
            mismatched = report.counts.mismatched,
            missing = report.counts.missing,
            unreadable = report.counts.unreadable,
            extra = report.counts.extra,
            "verification failed"
        );
    }
    Ok(report)
}

/// Diff observed destination digests against a manifest.
///
/// Pure: the same inputs always yield the same report, sorted by path.
/// A listed file that could not be hashed, or that lies under a directory
/// that could not be listed, gets no verdict and is counted as unreadable.
/// An unreadable directory hiding no listed file still counts once.
/// Unlisted files matching `excludes` are ignored; other unlisted files,
/// readable or not, are reported as extra.
pub fn classify(
    manifest: &Manifest,
    observed: PoolOutcome,
    excludes: &ExcludeRules,
    strict: bool,
) -> VerificationReport {
    let actual: BTreeMap<String, String> = observed
        .entries
        .into_iter()
        .map(|entry| (entry.relative_path, entry.digest))
        .collect();
    let (dir_errors, file_errors): (Vec<HashError>, Vec<HashError>) =
        observed.errors.into_iter().partition(HashError::is_directory);
    let file_errors: BTreeMap<String, HashError> = file_errors
        .into_iter()
        .map(|error| (error.relative_path.clone(), error))
        .collect();
    let hidden_by_directory = |path: &str| dir_errors.iter().any(|dir| dir.covers(path));

    let mut counts = VerificationCounts::default();
    let mut verdicts = Vec::with_capacity(manifest.len());

    for expected in manifest.entries() {
        let path = &expected.relative_path;
        let status = match actual.get(path) {
            Some(digest) if *digest == expected.digest => FileStatus::Match,
            Some(_) => FileStatus::Mismatch,
            None if file_errors.contains_key(path) || hidden_by_directory(path) => {
                counts.unreadable += 1;
                continue;
            }
            None => FileStatus::MissingAtDestination,
        };
        match status {
            FileStatus::Match => counts.matched += 1,
            FileStatus::Mismatch => counts.mismatched += 1,
            _ => counts.missing += 1,
        }
        verdicts.push(PathVerdict {
            relative_path: path.clone(),
            status,
            expected: Some(expected.digest.clone()),
            actual: actual.get(path).cloned(),
        });
    }

    counts.unreadable += dir_errors
        .iter()
        .filter(|dir| !manifest.entries().iter().any(|e| dir.covers(&e.relative_path)))
        .count();

    let extra_paths = actual
        .iter()
        .map(|(path, digest)| (path, Some(digest)))
        .chain(file_errors.keys().map(|path| (path, None)))
        .filter(|(path, _)| manifest.get(path).is_none() && !excludes.excludes_path(path));
    for (path, digest) in extra_paths {
        counts.extra += 1;
        verdicts.push(PathVerdict {
            relative_path: path.clone(),
            status: FileStatus::ExtraAtDestination,
            expected: None,
            actual: digest.cloned(),
        });
    }
    verdicts.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    let mut errors: Vec<HashError> = file_errors.into_values().chain(dir_errors).collect();
    errors.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    VerificationReport {
        algorithm: manifest.algorithm(),
        strict,
        verdicts,
        errors,
        counts,
    }
}
