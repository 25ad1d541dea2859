//! Copy collaborators.
//!
//! The engine never copies bytes itself during a run; it hands the source
//! and destination roots to a [`CopyCollaborator`]. Two are provided: the
//! external `rsync` mirror and an in-process recursive copy.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::fs_ops::{self, ExcludeRules, PathEnumerator};
use crate::progress::CancellationToken;

/// Program name of the external mirroring utility.
pub const DEFAULT_RSYNC_PROGRAM: &str = "rsync";

/// What a copy step did, or would do in a dry run.
///
/// External collaborators that report on their own leave the counts at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CopyReport {
    pub files_planned: usize,
    pub bytes_planned: u64,
    pub files_copied: usize,
    pub bytes_copied: u64,
    /// Files already present with the same size and modification time
    pub files_unchanged: usize,
}

/// Produces a faithful copy of a source tree at a destination.
pub trait CopyCollaborator {
    /// Mirror `source` into `destination`. With `dry_run` nothing is written.
    fn mirror(
        &self,
        source: &Path,
        destination: &Path,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<CopyReport, EngineError>;

    /// Short name for logs and the banner.
    fn name(&self) -> &str;
}

/// Runs `rsync -a --info=stats2,progress2 [--dry-run] <src>/ <dst>/`.
///
/// rsync writes its own progress and statistics to the terminal.
#[derive(Debug, Clone)]
pub struct RsyncCopier {
    program: PathBuf,
}

impl RsyncCopier {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        RsyncCopier { program: program.into() }
    }

    fn arguments(source: &Path, destination: &Path, dry_run: bool) -> Vec<String> {
        let mut args = vec!["-a".to_string(), "--info=stats2,progress2".to_string()];
        if dry_run {
            args.push("--dry-run".to_string());
        }
        args.push(with_trailing_slash(source));
        args.push(with_trailing_slash(destination));
        args
    }
}

impl Default for RsyncCopier {
    fn default() -> Self {
        Self::new(DEFAULT_RSYNC_PROGRAM)
    }
}

/// rsync copies the contents of `dir/`, not `dir` itself.
fn with_trailing_slash(path: &Path) -> String {
    let text = path.display().to_string();
    if text.ends_with('/') {
        text
    } else {
        format!("{}/", text)
    }
}

impl CopyCollaborator for RsyncCopier {
    fn mirror(
        &self,
        source: &Path,
        destination: &Path,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<CopyReport, EngineError> {
        let args = Self::arguments(source, destination, dry_run);
        info!(program = %self.program.display(), args = ?args, "running copy collaborator");

        let status = Command::new(&self.program)
            .args(&args)
            .status()
            .map_err(|e| EngineError::Copy(format!("cannot run {}: {}", self.program.display(), e)))?;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if !status.success() {
            return Err(EngineError::Copy(format!(
                "{} exited with {}",
                self.program.display(),
                status
            )));
        }
        Ok(CopyReport::default())
    }

    fn name(&self) -> &str {
        "rsync"
    }
}

/// In-process recursive copy preserving modification times.
///
/// Symbolic links are not copied. A destination file with the same size
/// and modification time as its source is left alone. Per-file failures do
/// not stop the copy; they are summarized in one error at the end.
#[derive(Debug, Clone)]
pub struct NativeCopier {
    excludes: ExcludeRules,
}

impl NativeCopier {
    pub fn new(excludes: ExcludeRules) -> Self {
        NativeCopier { excludes }
    }
}

impl Default for NativeCopier {
    fn default() -> Self {
        Self::new(ExcludeRules::none())
    }
}

/// Size and mtime both match, the same quick check rsync uses.
fn is_unchanged(src: &fs::Metadata, dst: &Path) -> bool {
    let Ok(dst_meta) = fs::metadata(dst) else {
        return false;
    };
    if !dst_meta.is_file() || dst_meta.len() != src.len() {
        return false;
    }
    match (src.modified(), dst_meta.modified()) {
        (Ok(a), Ok(b)) => {
            filetime::FileTime::from_system_time(a).unix_seconds()
                == filetime::FileTime::from_system_time(b).unix_seconds()
        }
        _ => false,
    }
}

impl CopyCollaborator for NativeCopier {
    fn mirror(
        &self,
        source: &Path,
        destination: &Path,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<CopyReport, EngineError> {
        let enumerator = PathEnumerator::new(source, self.excludes.clone())?;
        if !dry_run {
            fs::create_dir_all(destination)
                .map_err(|e| EngineError::Copy(format!("cannot create {}: {}", destination.display(), e)))?;
        }

        let mut report = CopyReport::default();
        let mut failures: Vec<String> = Vec::new();

        for item in enumerator.iter() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let job = match item {
                Ok(job) => job,
                Err(error) => {
                    warn!(path = %error.relative_path, error = %error, "cannot copy");
                    failures.push(error.to_string());
                    continue;
                }
            };

            let target = destination.join(&job.relative_path);
            let metadata = match fs::metadata(&job.absolute_path) {
                Ok(m) => m,
                Err(e) => {
                    failures.push(format!("{}: {}", job.relative_path, e));
                    continue;
                }
            };
            if is_unchanged(&metadata, &target) {
                debug!(path = %job.relative_path, "destination up to date");
                report.files_unchanged += 1;
                continue;
            }

            report.files_planned += 1;
            report.bytes_planned += metadata.len();
            if dry_run {
                debug!(path = %job.relative_path, "would copy");
                continue;
            }

            match fs_ops::copy_file_with_metadata(&job.absolute_path, &target) {
                Ok(bytes) => {
                    report.files_copied += 1;
                    report.bytes_copied += bytes;
                }
                Err(e) => {
                    warn!(path = %job.relative_path, error = %e, "copy failed");
                    failures.push(format!("{}: {}", job.relative_path, e));
                }
            }
        }

        info!(
            planned = report.files_planned,
            copied = report.files_copied,
            unchanged = report.files_unchanged,
            bytes = report.bytes_copied,
            dry_run,
            "copy finished"
        );

        match failures.first() {
            None => Ok(report),
            Some(first) => Err(EngineError::Copy(format!(
                "{} file(s) could not be copied, first: {}",
                failures.len(),
                first
            ))),
        }
    }

    fn name(&self) -> &str {
        "native"
    }
}
