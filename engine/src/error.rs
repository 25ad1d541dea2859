//! Error types for the manifest engine.
//!
//! `EngineError` represents step-level failures: bad configuration, an
//! unusable root, an unreadable or malformed manifest. Any of these aborts
//! the current step. Failures of a single file while hashing are not
//! `EngineError`s; they are recorded as [`HashError`] values and aggregated
//! into the run outcome so sibling files keep being processed.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::Serialize;

/// Process exit code for usage, configuration, and I/O failures.
pub const EXIT_ERROR: i32 = 2;

/// Errors that abort a step (make-manifest, copy, or verify).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Forced algorithm without a backend, or an invalid parameter combination.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The tree root does not exist.
    #[error("root not found: {}", path.display())]
    RootNotFound { path: PathBuf },

    /// The tree root exists but is not a directory.
    #[error("root is not a directory: {}", path.display())]
    NotADirectory { path: PathBuf },

    /// The tree root cannot be read (usually permissions).
    #[error("cannot access root {}: {source}", path.display())]
    RootAccessDenied { path: PathBuf, source: io::Error },

    /// The manifest could not be opened or read.
    #[error("failed to read manifest {origin}: {source}")]
    ManifestRead { origin: String, source: io::Error },

    /// The manifest could not be written or moved into place.
    #[error("failed to write manifest {target}: {source}")]
    ManifestWrite { target: String, source: io::Error },

    /// A manifest line does not follow the `<digest>  <path>` format.
    #[error("{origin}:{line}: {reason}")]
    Format {
        origin: String,
        line: usize,
        reason: String,
    },

    /// The same relative path appears twice in one manifest.
    #[error("{origin}:{line}: duplicate path '{path}' (first listed on line {first_line})")]
    DuplicatePath {
        origin: String,
        line: usize,
        first_line: usize,
        path: String,
    },

    /// The copy collaborator failed.
    #[error("copy failed: {0}")]
    Copy(String),

    /// A per-file failure escalated because fail-fast is enabled.
    #[error("hashing aborted: {0}")]
    HashFailed(HashError),

    /// The run was stopped before completion; nothing was finalized.
    #[error("run cancelled before completion")]
    Cancelled,
}

impl EngineError {
    /// Exit code the command-line front end reports for this error.
    ///
    /// Every step-level error maps to 2. Verification failure is not an
    /// error and is reported through the verification report instead.
    pub fn exit_code(&self) -> i32 {
        EXIT_ERROR
    }

    pub(crate) fn format(origin: &str, line: usize, reason: impl Into<String>) -> Self {
        EngineError::Format {
            origin: origin.to_string(),
            line,
            reason: reason.into(),
        }
    }
}

/// Classification of a per-file hashing failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HashErrorKind {
    /// The file disappeared between enumeration and hashing.
    Vanished,
    /// The file or one of its directories is not readable.
    PermissionDenied,
    /// Any other read or device error.
    Io,
    /// The external hashing program failed or produced unusable output.
    ExternalTool,
    /// The name cannot be expressed in the manifest line format.
    UnrepresentablePath,
    /// A directory could not be listed; `relative_path` names the directory
    /// and nothing below it was enumerated.
    UnreadableDirectory,
}

impl fmt::Display for HashErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vanished => write!(f, "vanished"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::Io => write!(f, "i/o error"),
            Self::ExternalTool => write!(f, "external tool error"),
            Self::UnrepresentablePath => write!(f, "unrepresentable path"),
            Self::UnreadableDirectory => write!(f, "unreadable directory"),
        }
    }
}

/// A recoverable failure to hash a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashError {
    /// Root-relative path (lossy for names that are not valid UTF-8).
    pub relative_path: String,
    pub kind: HashErrorKind,
    pub message: String,
}

impl HashError {
    pub fn new(relative_path: impl Into<String>, kind: HashErrorKind, message: impl Into<String>) -> Self {
        HashError {
            relative_path: relative_path.into(),
            kind,
            message: message.into(),
        }
    }

    /// Build a per-file error from an I/O failure, classifying by error kind.
    pub fn from_io(relative_path: impl Into<String>, err: &io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => HashErrorKind::Vanished,
            io::ErrorKind::PermissionDenied => HashErrorKind::PermissionDenied,
            _ if err.get_ref().is_some_and(|inner| inner.is::<ExternalToolError>()) => {
                HashErrorKind::ExternalTool
            }
            _ => HashErrorKind::Io,
        };
        HashError::new(relative_path, kind, err.to_string())
    }

    /// A directory listing failure. The root directory is `""`.
    pub fn unreadable_directory(relative_path: impl Into<String>, err: &io::Error) -> Self {
        HashError::new(relative_path, HashErrorKind::UnreadableDirectory, err.to_string())
    }

    pub fn is_directory(&self) -> bool {
        self.kind == HashErrorKind::UnreadableDirectory
    }

    /// Whether a file at `relative_path` lies under this unreadable directory.
    pub fn covers(&self, relative_path: &str) -> bool {
        self.is_directory()
            && (self.relative_path.is_empty()
                || relative_path
                    .strip_prefix(self.relative_path.as_str())
                    .is_some_and(|rest| rest.starts_with('/')))
    }
}

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.relative_path, self.kind, self.message)
    }
}

/// Failure reported by an external hashing program, carried inside an
/// `io::Error` so backends share one error signature.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ExternalToolError(pub String);

impl ExternalToolError {
    pub fn into_io(message: impl Into<String>) -> io::Error {
        io::Error::new(io::ErrorKind::Other, ExternalToolError(message.into()))
    }
}
