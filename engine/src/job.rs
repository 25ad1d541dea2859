//! Run pipeline.
//!
//! Composes the enumerator, selector, worker pool, codec and verifier into
//! the steps a front end sequences:
//! - resolving the backend for a run
//! - building a manifest for a source tree and writing it
//! - verifying a destination tree against a manifest

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::algorithm::{backend_for_algorithm, select_backend, AlgorithmMode, Availability};
use crate::checksums::Backend;
use crate::config::RunConfig;
use crate::error::{EngineError, HashError};
use crate::fs_ops::PathEnumerator;
use crate::manifest::{write_manifest, Manifest, ManifestLocation};
use crate::model::{AlgorithmId, VerificationReport};
use crate::pool::HashPool;
use crate::progress::{CancellationToken, ProgressCallback};
use crate::verify::{verify_tree, VerifyRequest};

/// Result of hashing a source tree.
#[derive(Debug)]
pub struct ManifestRun {
    pub manifest: Manifest,
    /// Files that could not be hashed and are absent from the manifest
    pub errors: Vec<HashError>,
    pub bytes_hashed: u64,
}

impl ManifestRun {
    /// True if every enumerated file made it into the manifest.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate `config` and pick the backend for a make-manifest run.
///
/// # Errors
/// `Configuration` for invalid parameters or a forced fast algorithm with no
/// fast backend available.
pub fn resolve_backend(config: &RunConfig, availability: &Availability) -> Result<Backend, EngineError> {
    config.validate()?;
    let backend = select_backend(&config.selector, availability)?;
    info!(
        mode = %config.selector.mode,
        backend = %backend.describe(),
        algorithm = %backend.algorithm(),
        "algorithm resolved"
    );
    Ok(backend)
}

/// Hash every regular file under `source`.
///
/// `exclude` names a file (normally the manifest being produced) left out of
/// the listing if it lies under `source`. Per-file errors are returned in the
/// run unless `fail_fast` is set, in which case the first one aborts.
pub fn build_manifest(
    source: &Path,
    config: &RunConfig,
    backend: Backend,
    exclude: Option<&Path>,
    cancel: &CancellationToken,
    progress: Option<&dyn ProgressCallback>,
) -> Result<ManifestRun, EngineError> {
    config.validate()?;
    let mut enumerator = PathEnumerator::new(source, config.excludes.clone())?;
    if let Some(path) = exclude {
        enumerator.exclude_file(path);
    }

    let algorithm = backend.algorithm();
    let pool = HashPool::new(config.hash_settings(backend));
    info!(source = %source.display(), algorithm = %algorithm, "hashing source tree");
    if let Some(progress) = progress {
        progress.on_run_started("Hashing");
    }

    let outcome = pool.run(enumerator.iter(), cancel, progress)?;
    let manifest = Manifest::from_entries(algorithm, Some(source.to_path_buf()), outcome.entries)?;

    if !outcome.errors.is_empty() {
        warn!(
            failed = outcome.errors.len(),
            hashed = manifest.len(),
            "some files could not be hashed and are missing from the manifest"
        );
    }
    Ok(ManifestRun {
        manifest,
        errors: outcome.errors,
        bytes_hashed: outcome.bytes_hashed,
    })
}

/// Build the manifest for `source` and write it to `location`.
///
/// The manifest is written even when some files failed; check
/// [`ManifestRun::is_complete`]. A cancelled or fail-fast run writes nothing.
pub fn make_manifest(
    source: &Path,
    location: &ManifestLocation,
    config: &RunConfig,
    backend: Backend,
    cancel: &CancellationToken,
    progress: Option<&dyn ProgressCallback>,
) -> Result<ManifestRun, EngineError> {
    let run = build_manifest(source, config, backend, location.file_path(), cancel, progress)?;
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    write_manifest(&run.manifest, location.open_sink()?)?;
    info!(target = %location, entries = run.manifest.len(), "manifest saved");
    Ok(run)
}

/// Verify `destination` against `manifest`, recomputing with the manifest's
/// algorithm on whichever local backend can produce it.
pub fn verify_against(
    manifest: &Manifest,
    destination: &Path,
    config: &RunConfig,
    availability: &Availability,
    manifest_file: Option<&Path>,
    cancel: &CancellationToken,
    progress: Option<&dyn ProgressCallback>,
) -> Result<VerificationReport, EngineError> {
    config.validate()?;
    let backend = backend_for_algorithm(manifest.algorithm(), config.selector.prefer_external, availability)?;
    let request = VerifyRequest {
        settings: config.hash_settings(backend),
        excludes: config.excludes.clone(),
        manifest_file,
        strict: config.strict,
    };
    verify_tree(manifest, destination, request, cancel, progress)
}

/// Default manifest path for a make-manifest run: `<source>/<name>`.
pub fn default_manifest_path(source: &Path, algorithm: AlgorithmId) -> PathBuf {
    source.join(algorithm.default_manifest_name())
}

/// Find the manifest a verify run should read when none was named.
///
/// Looks in the destination first, then the source. In `auto` mode the
/// fast algorithm's name is tried before the standard one.
pub fn locate_manifest(source: Option<&Path>, destination: &Path, mode: AlgorithmMode) -> Option<PathBuf> {
    let names: &[AlgorithmId] = match mode {
        AlgorithmMode::Auto => &[AlgorithmId::FastParallel, AlgorithmId::Standard],
        AlgorithmMode::FastForced => &[AlgorithmId::FastParallel],
        AlgorithmMode::StandardForced => &[AlgorithmId::Standard],
    };
    std::iter::once(destination)
        .chain(source)
        .flat_map(|dir| names.iter().map(move |algorithm| default_manifest_path(dir, *algorithm)))
        .find(|candidate| candidate.is_file())
}

/// Algorithm to assume for a headerless manifest: the one implied by its
/// file name, else the one a forced mode names.
pub fn manifest_hint(location: &ManifestLocation, mode: AlgorithmMode) -> Option<AlgorithmId> {
    location.algorithm_hint().or(match mode {
        AlgorithmMode::Auto => None,
        AlgorithmMode::FastForced => Some(AlgorithmId::FastParallel),
        AlgorithmMode::StandardForced => Some(AlgorithmId::Standard),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::SelectorConfig;
    use crate::manifest::read_manifest;
    use crate::model::FileStatus;
    use std::fs;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn standard_config(jobs: usize) -> RunConfig {
        RunConfig {
            jobs,
            selector: SelectorConfig {
                mode: AlgorithmMode::StandardForced,
                prefer_external: false,
            },
            ..Default::default()
        }
    }

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("b")).expect("Failed to create dir");
        fs::write(root.join("a.txt"), b"abc").expect("Failed to write");
        fs::write(root.join("b/c.txt"), b"nested").expect("Failed to write");
        fs::write(root.join(".DS_Store"), b"junk").expect("Failed to write");
    }

    fn manifest_text(source: &Path, config: &RunConfig, backend: Backend) -> String {
        build_manifest(source, config, backend, None, &CancellationToken::new(), None)
            .expect("build manifest")
            .manifest
            .to_canonical_string()
    }

    #[test]
    fn test_manifest_is_independent_of_jobs() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        for i in 0..1000 {
            let dir = temp_dir.path().join(format!("d{:02}", i % 37));
            fs::create_dir_all(&dir).expect("Failed to create dir");
            fs::write(dir.join(format!("f{:04}.dat", i)), format!("content {}", i * 7919)).expect("Failed to write");
        }

        let serial = manifest_text(temp_dir.path(), &standard_config(1), Backend::BuiltinStandard);
        let parallel = manifest_text(temp_dir.path(), &standard_config(16), Backend::BuiltinStandard);
        assert_eq!(serial, parallel);
        assert_eq!(serial.lines().count(), 1001);
        assert_eq!(serial, manifest_text(temp_dir.path(), &standard_config(16), Backend::BuiltinStandard));
    }

    #[cfg(feature = "fast-hash")]
    #[test]
    fn test_fast_manifest_is_independent_of_threads() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        for i in 0..50 {
            fs::write(temp_dir.path().join(format!("f{}", i)), vec![i as u8; 70_000 * (i % 4)]).expect("Failed to write");
        }
        let mut config = standard_config(1);
        config.threads = 1;
        let single = manifest_text(temp_dir.path(), &config, Backend::InProcessLibrary);
        config.jobs = 8;
        config.threads = 4;
        config.cap_parallelism = false;
        let multi = manifest_text(temp_dir.path(), &config, Backend::InProcessLibrary);
        assert_eq!(single, multi);
        assert!(single.starts_with("; algorithm: blake3\n"));
    }

    #[test]
    fn test_round_trip_verifies_clean() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        sample_tree(temp_dir.path());
        let config = standard_config(4);
        let location = ManifestLocation::File(default_manifest_path(temp_dir.path(), AlgorithmId::Standard));

        let run = make_manifest(
            temp_dir.path(),
            &location,
            &config,
            Backend::BuiltinStandard,
            &CancellationToken::new(),
            None,
        )
        .expect("make manifest");
        assert!(run.is_complete());
        assert_eq!(run.manifest.len(), 2);
        assert_eq!(run.manifest.get("a.txt").map(|e| e.digest.as_str()), Some(ABC_SHA256));

        let manifest = read_manifest(&location, None).expect("read manifest");
        assert_eq!(manifest.entries(), run.manifest.entries());

        let report = verify_against(
            &manifest,
            temp_dir.path(),
            &RunConfig {
                strict: true,
                ..config
            },
            &Availability::none(),
            location.file_path(),
            &CancellationToken::new(),
            None,
        )
        .expect("verify");
        assert!(report.passed(), "{:?}", report.verdicts);
        assert_eq!(report.counts.matched, 2);
        assert_eq!(report.counts.extra, 0);
    }

    #[test]
    fn test_copy_with_corruption_is_detected() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        sample_tree(&src);
        sample_tree(&dst);
        fs::write(dst.join("a.txt"), b"abd").expect("Failed to write");
        fs::remove_file(dst.join("b/c.txt")).expect("Failed to remove");
        fs::write(dst.join("d.txt"), b"extra").expect("Failed to write");

        let config = standard_config(2);
        let run = build_manifest(&src, &config, Backend::BuiltinStandard, None, &CancellationToken::new(), None)
            .expect("build manifest");
        let report = verify_against(
            &run.manifest,
            &dst,
            &config,
            &Availability::none(),
            None,
            &CancellationToken::new(),
            None,
        )
        .expect("verify");

        let statuses: Vec<_> = report.verdicts.iter().map(|v| (v.relative_path.as_str(), v.status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("a.txt", FileStatus::Mismatch),
                ("b/c.txt", FileStatus::MissingAtDestination),
                ("d.txt", FileStatus::ExtraAtDestination),
            ]
        );
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_auto_without_fast_backend_falls_back_to_standard() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        sample_tree(temp_dir.path());
        let config = RunConfig {
            jobs: 2,
            ..Default::default()
        };

        let backend = resolve_backend(&config, &Availability::none()).expect("resolve");
        assert_eq!(backend, Backend::BuiltinStandard);

        let location = ManifestLocation::File(temp_dir.path().join("manifest.txt"));
        let run = make_manifest(temp_dir.path(), &location, &config, backend, &CancellationToken::new(), None)
            .expect("make manifest");
        assert_eq!(run.manifest.algorithm(), AlgorithmId::Standard);

        let manifest = read_manifest(&location, None).expect("read manifest");
        assert_eq!(manifest.algorithm(), AlgorithmId::Standard);
        let report = verify_against(
            &manifest,
            temp_dir.path(),
            &config,
            &Availability::none(),
            location.file_path(),
            &CancellationToken::new(),
            None,
        )
        .expect("verify");
        assert!(report.passed());
    }

    #[cfg(unix)]
    #[test]
    fn test_external_backend_round_trip() {
        use crate::checksums::{fake_b3sum, FAKE_B3SUM_DIGEST};

        let tool_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        sample_tree(temp_dir.path());
        let availability = Availability {
            external: Some(fake_b3sum(tool_dir.path(), None)),
            in_process: false,
        };
        let config = RunConfig {
            jobs: 2,
            strict: true,
            selector: SelectorConfig {
                mode: AlgorithmMode::FastForced,
                prefer_external: true,
            },
            ..Default::default()
        };

        let backend = resolve_backend(&config, &availability).expect("resolve");
        assert!(matches!(backend, Backend::ExternalProcess { .. }));

        let location = ManifestLocation::File(default_manifest_path(temp_dir.path(), AlgorithmId::FastParallel));
        let run = make_manifest(temp_dir.path(), &location, &config, backend, &CancellationToken::new(), None)
            .expect("make manifest");
        assert!(run.is_complete());

        let manifest = read_manifest(&location, None).expect("read manifest");
        assert_eq!(manifest.algorithm(), AlgorithmId::FastParallel);
        assert_eq!(manifest.len(), 2);
        assert!(manifest.entries().iter().all(|e| e.digest == FAKE_B3SUM_DIGEST));

        let report = verify_against(
            &manifest,
            temp_dir.path(),
            &config,
            &availability,
            location.file_path(),
            &CancellationToken::new(),
            None,
        )
        .expect("verify");
        assert!(report.passed(), "{:?}", report.verdicts);
        assert_eq!(report.counts.matched, 2);
    }

    #[test]
    fn test_forced_fast_without_backend_is_configuration_error() {
        let config = RunConfig {
            selector: SelectorConfig {
                mode: AlgorithmMode::FastForced,
                prefer_external: true,
            },
            ..Default::default()
        };
        let result = resolve_backend(&config, &Availability::none());
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_fast_manifest_cannot_verify_without_fast_backend() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let manifest = Manifest::from_entries(AlgorithmId::FastParallel, None, Vec::new()).expect("manifest");
        let result = verify_against(
            &manifest,
            temp_dir.path(),
            &RunConfig::default(),
            &Availability::none(),
            None,
            &CancellationToken::new(),
            None,
        );
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_cancelled_run_keeps_previous_manifest() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        sample_tree(temp_dir.path());
        let target = default_manifest_path(temp_dir.path(), AlgorithmId::Standard);
        fs::write(&target, b"previous manifest\n").expect("Failed to write");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = make_manifest(
            temp_dir.path(),
            &ManifestLocation::File(target.clone()),
            &standard_config(2),
            Backend::BuiltinStandard,
            &cancel,
            None,
        );

        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(fs::read(&target).expect("read"), b"previous manifest\n");
        let leftovers: Vec<_> = fs::read_dir(temp_dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_manifest_excludes_itself_on_rerun() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        sample_tree(temp_dir.path());
        let location = ManifestLocation::File(default_manifest_path(temp_dir.path(), AlgorithmId::Standard));
        let config = standard_config(2);

        let first = make_manifest(temp_dir.path(), &location, &config, Backend::BuiltinStandard, &CancellationToken::new(), None)
            .expect("first run");
        let second = make_manifest(temp_dir.path(), &location, &config, Backend::BuiltinStandard, &CancellationToken::new(), None)
            .expect("second run");
        assert_eq!(first.manifest.to_canonical_string(), second.manifest.to_canonical_string());
        assert!(second.manifest.get("SHA256SUMS").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_unrepresentable_name_is_reported_not_dropped() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        sample_tree(temp_dir.path());
        fs::write(temp_dir.path().join("bad\nname"), b"x").expect("Failed to write");
        let location = ManifestLocation::File(temp_dir.path().join("SHA256SUMS"));

        let run = make_manifest(
            temp_dir.path(),
            &location,
            &standard_config(2),
            Backend::BuiltinStandard,
            &CancellationToken::new(),
            None,
        )
        .expect("make manifest");
        assert!(!run.is_complete());
        assert_eq!(run.errors.len(), 1);
        assert_eq!(run.manifest.len(), 2);
        assert!(location.file_path().map(Path::exists).unwrap_or(false));
    }

    #[cfg(unix)]
    #[test]
    fn test_fail_fast_writes_nothing() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        sample_tree(temp_dir.path());
        fs::write(temp_dir.path().join("bad\rname"), b"x").expect("Failed to write");
        let target = temp_dir.path().join("SHA256SUMS");
        let config = RunConfig {
            fail_fast: true,
            ..standard_config(2)
        };

        let result = make_manifest(
            temp_dir.path(),
            &ManifestLocation::File(target.clone()),
            &config,
            Backend::BuiltinStandard,
            &CancellationToken::new(),
            None,
        );
        assert!(matches!(result, Err(EngineError::HashFailed(_))));
        assert!(!target.exists());
    }

    #[test]
    fn test_locate_manifest_prefers_destination() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        fs::create_dir_all(&src).expect("Failed to create dir");
        fs::create_dir_all(&dst).expect("Failed to create dir");

        assert_eq!(locate_manifest(Some(&src), &dst, AlgorithmMode::Auto), None);

        fs::write(src.join("SHA256SUMS"), b"").expect("Failed to write");
        assert_eq!(locate_manifest(Some(&src), &dst, AlgorithmMode::Auto), Some(src.join("SHA256SUMS")));
        assert_eq!(locate_manifest(Some(&src), &dst, AlgorithmMode::FastForced), None);

        fs::write(dst.join("BLAKE3SUMS"), b"").expect("Failed to write");
        assert_eq!(locate_manifest(Some(&src), &dst, AlgorithmMode::Auto), Some(dst.join("BLAKE3SUMS")));
        assert_eq!(
            locate_manifest(Some(&src), &dst, AlgorithmMode::StandardForced),
            Some(src.join("SHA256SUMS"))
        );
    }

    #[test]
    fn test_manifest_hint() {
        let named = ManifestLocation::File(PathBuf::from("/x/BLAKE3SUMS"));
        assert_eq!(manifest_hint(&named, AlgorithmMode::StandardForced), Some(AlgorithmId::FastParallel));
        assert_eq!(manifest_hint(&ManifestLocation::Stdio, AlgorithmMode::Auto), None);
        assert_eq!(
            manifest_hint(&ManifestLocation::Stdio, AlgorithmMode::StandardForced),
            Some(AlgorithmId::Standard)
        );
    }
}
