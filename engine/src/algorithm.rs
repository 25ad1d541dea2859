//! Algorithm and backend selection.
//!
//! Selection is a pure function of the run configuration and an
//! [`Availability`] probe. The probe is the only part that touches the
//! environment, so the decision table can be tested without a filesystem.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::debug;

use crate::checksums::{self, Backend};
use crate::error::EngineError;
use crate::model::AlgorithmId;

/// Default name of the external fast-hash program.
pub const DEFAULT_EXTERNAL_PROGRAM: &str = "b3sum";

/// How the digest algorithm for a run is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlgorithmMode {
    /// Prefer the fast algorithm, fall back to the standard one
    #[default]
    Auto,
    /// Fast algorithm or a configuration error
    FastForced,
    /// Always the standard algorithm
    StandardForced,
}

impl fmt::Display for AlgorithmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgorithmMode::Auto => write!(f, "auto"),
            AlgorithmMode::FastForced => write!(f, "fast"),
            AlgorithmMode::StandardForced => write!(f, "standard"),
        }
    }
}

impl FromStr for AlgorithmMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(AlgorithmMode::Auto),
            "fast" | "blake3" => Ok(AlgorithmMode::FastForced),
            "standard" | "sha256" => Ok(AlgorithmMode::StandardForced),
            other => Err(EngineError::Configuration(format!(
                "unknown algorithm mode '{}': expected auto, fast, or standard",
                other
            ))),
        }
    }
}

/// Selection preferences for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SelectorConfig {
    pub mode: AlgorithmMode,
    /// Try the external program before the in-process library
    pub prefer_external: bool,
}

/// What fast-hash backends are usable on this machine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Availability {
    /// Resolved location of the external program, if found
    pub external: Option<PathBuf>,
    /// Whether the in-process library is compiled in
    pub in_process: bool,
}

impl Availability {
    /// Probe for the external program and the in-process library.
    pub fn probe(external_program: &Path) -> Self {
        let availability = Availability {
            external: find_program(external_program),
            in_process: checksums::in_process_fast_available(),
        };
        debug!(
            external = ?availability.external,
            in_process = availability.in_process,
            "probed fast-hash backends"
        );
        availability
    }

    /// Neither fast backend is usable.
    pub fn none() -> Self {
        Availability::default()
    }

    fn fast_candidates(&self, prefer_external: bool) -> Vec<Backend> {
        let external = self
            .external
            .clone()
            .map(|program| Backend::ExternalProcess { program });
        let in_process = self.in_process.then_some(Backend::InProcessLibrary);
        let ordered = if prefer_external {
            [external, in_process]
        } else {
            [in_process, external]
        };
        ordered.into_iter().flatten().collect()
    }
}

/// Resolve the backend for a run.
///
/// | mode     | order                                               |
/// |----------|-----------------------------------------------------|
/// | auto     | fast backends (preference order), then built-in     |
/// | fast     | fast backends (preference order), else error        |
/// | standard | built-in                                            |
pub fn select_backend(config: &SelectorConfig, availability: &Availability) -> Result<Backend, EngineError> {
    if config.mode == AlgorithmMode::StandardForced {
        return Ok(Backend::BuiltinStandard);
    }

    match availability.fast_candidates(config.prefer_external).into_iter().next() {
        Some(backend) => Ok(backend),
        None if config.mode == AlgorithmMode::Auto => Ok(Backend::BuiltinStandard),
        None => Err(EngineError::Configuration(
            "fast algorithm forced but neither the external b3sum program nor the in-process \
             library is available"
                .to_string(),
        )),
    }
}

/// Resolve a backend able to recompute digests of `algorithm`.
///
/// Used by verification: the manifest's algorithm wins over local
/// preferences, only the choice among equivalent backends is local.
pub fn backend_for_algorithm(
    algorithm: AlgorithmId,
    prefer_external: bool,
    availability: &Availability,
) -> Result<Backend, EngineError> {
    match algorithm {
        AlgorithmId::Standard => Ok(Backend::BuiltinStandard),
        AlgorithmId::FastParallel => availability
            .fast_candidates(prefer_external)
            .into_iter()
            .next()
            .ok_or_else(|| {
                EngineError::Configuration(
                    "manifest uses blake3 but no blake3 backend is available here".to_string(),
                )
            }),
    }
}

/// Locate an executable, searching `PATH` when `program` is a bare name.
pub fn find_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return is_executable(program).then(|| program.to_path_buf());
    }

    let search = env::var_os("PATH")?;
    env::split_paths(&search)
        .flat_map(|dir| executable_names(program).into_iter().map(move |name| dir.join(name)))
        .find(|candidate| is_executable(candidate))
}

#[cfg(windows)]
fn executable_names(program: &Path) -> Vec<PathBuf> {
    vec![program.to_path_buf(), program.with_extension("exe")]
}

#[cfg(not(windows))]
fn executable_names(program: &Path) -> Vec<PathBuf> {
    vec![program.to_path_buf()]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
