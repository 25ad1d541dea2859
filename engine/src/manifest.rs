//! Manifest codec.
//!
//! A manifest is a UTF-8 text file:
//!
//! ```text
//! ; algorithm: blake3
//! <64 lowercase hex>  <relative/path>
//! ...
//! ```
//!
//! The first line is a reserved header naming the algorithm. Entry lines are
//! sorted by path using byte-wise ordering, so a manifest for a given tree is
//! byte-identical no matter how its digests were scheduled.
//!
//! Writing to a named file goes through [`AtomicFileSink`]: the manifest is
//! written to a temporary sibling and renamed into place on commit, so a
//! crash or cancelled run never leaves a partial manifest under the canonical
//! name. Writing to standard output goes through [`StreamSink`], which cannot
//! be atomic: a failed run may leave partial output in the pipe.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::checksums::is_hex_digest;
use crate::error::EngineError;
use crate::model::{AlgorithmId, FileEntry};

/// Prefix of the reserved first line carrying the algorithm.
pub const HEADER_PREFIX: &str = "; algorithm: ";

/// Separator between digest and path.
pub const FIELD_SEPARATOR: &str = "  ";

/// Command-line sentinel meaning "standard input/output".
pub const STDIO_SENTINEL: &str = "-";

/// A sorted set of digests for one tree, all of one algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    algorithm: AlgorithmId,
    root: Option<PathBuf>,
    entries: Vec<FileEntry>,
}

impl Manifest {
    /// Build a manifest, sorting entries by path.
    ///
    /// # Errors
    /// `Configuration` if an entry carries another algorithm, `DuplicatePath`
    /// if a path occurs twice.
    pub fn from_entries(
        algorithm: AlgorithmId,
        root: Option<PathBuf>,
        mut entries: Vec<FileEntry>,
    ) -> Result<Self, EngineError> {
        if let Some(stray) = entries.iter().find(|e| e.algorithm != algorithm) {
            return Err(EngineError::Configuration(format!(
                "entry '{}' was hashed with {} but the manifest uses {}",
                stray.relative_path, stray.algorithm, algorithm
            )));
        }

        // String ordering is byte-wise, independent of locale.
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        if let Some(pair) = entries.windows(2).find(|w| w[0].relative_path == w[1].relative_path) {
            return Err(EngineError::DuplicatePath {
                origin: "<collected entries>".to_string(),
                line: 0,
                first_line: 0,
                path: pair[0].relative_path.clone(),
            });
        }

        Ok(Manifest {
            algorithm,
            root,
            entries,
        })
    }

    pub fn algorithm(&self) -> AlgorithmId {
        self.algorithm
    }

    /// Root the manifest was computed against, when known.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Entries sorted by relative path.
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up the entry for a relative path.
    pub fn get(&self, relative_path: &str) -> Option<&FileEntry> {
        self.entries
            .binary_search_by(|e| e.relative_path.as_str().cmp(relative_path))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Serialize in canonical form.
    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "{}{}", HEADER_PREFIX, self.algorithm.name())?;
        for entry in &self.entries {
            writeln!(out, "{}{}{}", entry.digest, FIELD_SEPARATOR, entry.relative_path)?;
        }
        Ok(())
    }

    /// Canonical serialization as a string.
    pub fn to_canonical_string(&self) -> String {
        let mut buffer = Vec::new();
        // writing into a Vec cannot fail
        let _ = self.write_to(&mut buffer);
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Destination of a serialized manifest.
pub trait ManifestSink {
    /// Writer receiving the manifest bytes.
    fn writer(&mut self) -> &mut dyn Write;

    /// Make the written manifest visible. Dropping a sink without
    /// committing discards what an atomic sink has written.
    fn commit(self: Box<Self>) -> Result<(), EngineError>;

    /// Human-readable target, for messages.
    fn describe(&self) -> String;
}

/// Writes to a temporary sibling file and renames it into place on commit.
pub struct AtomicFileSink {
    target: PathBuf,
    temp: BufWriter<NamedTempFile>,
}

impl AtomicFileSink {
    /// Create the temporary file next to `target`.
    pub fn create(target: &Path) -> Result<Self, EngineError> {
        let parent = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut builder = tempfile::Builder::new();
        builder.prefix(".manifest-").suffix(".tmp");
        // a persisted manifest gets ordinary file permissions, not the temp file's 0600
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            builder.permissions(std::fs::Permissions::from_mode(0o644));
        }
        let temp = builder.tempfile_in(parent).map_err(|e| write_error(target, e))?;
        debug!(target = %target.display(), temp = %temp.path().display(), "opened temporary manifest");
        Ok(AtomicFileSink {
            target: target.to_path_buf(),
            temp: BufWriter::new(temp),
        })
    }
}

impl ManifestSink for AtomicFileSink {
    fn writer(&mut self) -> &mut dyn Write {
        &mut self.temp
    }

    fn commit(self: Box<Self>) -> Result<(), EngineError> {
        let target = self.target;
        let temp = self.temp.into_inner().map_err(|e| write_error(&target, e.into_error()))?;
        temp.as_file().sync_all().map_err(|e| write_error(&target, e))?;
        temp.persist(&target).map_err(|e| write_error(&target, e.error))?;
        info!(path = %target.display(), "manifest written");
        Ok(())
    }

    fn describe(&self) -> String {
        self.target.display().to_string()
    }
}

/// Writes straight through to a stream. Not atomic.
pub struct StreamSink<W: Write> {
    inner: BufWriter<W>,
    label: String,
}

impl<W: Write> StreamSink<W> {
    pub fn new(inner: W, label: impl Into<String>) -> Self {
        StreamSink {
            inner: BufWriter::new(inner),
            label: label.into(),
        }
    }
}

impl<W: Write> ManifestSink for StreamSink<W> {
    fn writer(&mut self) -> &mut dyn Write {
        &mut self.inner
    }

    fn commit(mut self: Box<Self>) -> Result<(), EngineError> {
        self.inner.flush().map_err(|e| EngineError::ManifestWrite {
            target: self.label.clone(),
            source: e,
        })
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

fn write_error(target: &Path, source: io::Error) -> EngineError {
    EngineError::ManifestWrite {
        target: target.display().to_string(),
        source,
    }
}

/// Where a manifest is read from or written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestLocation {
    File(PathBuf),
    /// Standard output when writing, standard input when reading
    Stdio,
}

impl ManifestLocation {
    /// Interpret a command-line argument, where `-` means the stdio stream.
    pub fn from_arg(arg: &str) -> Self {
        if arg == STDIO_SENTINEL {
            ManifestLocation::Stdio
        } else {
            ManifestLocation::File(PathBuf::from(arg))
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        match self {
            ManifestLocation::File(path) => Some(path),
            ManifestLocation::Stdio => None,
        }
    }

    /// Algorithm implied by a default manifest file name.
    pub fn algorithm_hint(&self) -> Option<AlgorithmId> {
        self.file_path()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .and_then(AlgorithmId::from_manifest_name)
    }

    pub fn open_sink(&self) -> Result<Box<dyn ManifestSink>, EngineError> {
        match self {
            ManifestLocation::File(path) => Ok(Box::new(AtomicFileSink::create(path)?)),
            ManifestLocation::Stdio => Ok(Box::new(StreamSink::new(io::stdout(), "<stdout>"))),
        }
    }

    pub fn open_source(&self) -> Result<Box<dyn BufRead>, EngineError> {
        match self {
            ManifestLocation::File(path) => {
                let file = File::open(path).map_err(|e| EngineError::ManifestRead {
                    origin: path.display().to_string(),
                    source: e,
                })?;
                Ok(Box::new(BufReader::new(file)))
            }
            ManifestLocation::Stdio => Ok(Box::new(BufReader::new(io::stdin()))),
        }
    }
}

impl fmt::Display for ManifestLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestLocation::File(path) => write!(f, "{}", path.display()),
            ManifestLocation::Stdio => write!(f, "<stdio>"),
        }
    }
}

/// Serialize `manifest` into `sink` and commit it.
///
/// If serialization fails the sink is dropped uncommitted.
pub fn write_manifest(manifest: &Manifest, mut sink: Box<dyn ManifestSink + '_>) -> Result<(), EngineError> {
    let target = sink.describe();
    manifest
        .write_to(sink.writer())
        .map_err(|e| EngineError::ManifestWrite { target, source: e })?;
    sink.commit()
}

/// Read and strictly parse a manifest from `location`.
///
/// `hint` supplies the algorithm for headerless manifests, as written by
/// `b3sum` or `sha256sum`.
pub fn read_manifest(location: &ManifestLocation, hint: Option<AlgorithmId>) -> Result<Manifest, EngineError> {
    let reader = location.open_source()?;
    let manifest = parse_manifest(reader, &location.to_string(), hint)?;
    info!(
        origin = %location,
        algorithm = %manifest.algorithm(),
        entries = manifest.len(),
        "manifest loaded"
    );
    Ok(manifest)
}

/// Parse manifest text. `origin` names the source in error messages.
///
/// # Errors
/// `Format` with the 1-based line number for any malformed line,
/// `DuplicatePath` for repeated paths, `ManifestRead` for I/O failures.
pub fn parse_manifest<R: BufRead>(
    reader: R,
    origin: &str,
    hint: Option<AlgorithmId>,
) -> Result<Manifest, EngineError> {
    let mut algorithm: Option<AlgorithmId> = None;
    let mut entries = Vec::new();
    let mut first_seen: HashMap<String, usize> = HashMap::new();

    for (index, raw) in reader.split(b'\n').enumerate() {
        let line_no = index + 1;
        let raw = raw.map_err(|e| EngineError::ManifestRead {
            origin: origin.to_string(),
            source: e,
        })?;
        let line = String::from_utf8(raw).map_err(|_| EngineError::format(origin, line_no, "line is not valid UTF-8"))?;

        if line_no == 1 {
            if let Some(name) = line.strip_prefix(HEADER_PREFIX) {
                let parsed = AlgorithmId::from_name(name).ok_or_else(|| {
                    EngineError::format(origin, line_no, format!("unknown algorithm '{}' in header", name))
                })?;
                algorithm = Some(parsed);
                continue;
            }
            algorithm = Some(hint.ok_or_else(|| {
                EngineError::format(origin, line_no, "missing '; algorithm: <name>' header")
            })?);
        }
        let algorithm = algorithm.ok_or_else(|| EngineError::format(origin, line_no, "missing algorithm header"))?;

        let (digest, path) = parse_entry_line(&line, algorithm).map_err(|reason| EngineError::format(origin, line_no, reason))?;
        if let Some(&first_line) = first_seen.get(path) {
            return Err(EngineError::DuplicatePath {
                origin: origin.to_string(),
                line: line_no,
                first_line,
                path: path.to_string(),
            });
        }
        first_seen.insert(path.to_string(), line_no);
        entries.push(FileEntry {
            relative_path: path.to_string(),
            digest: digest.to_string(),
            algorithm,
        });
    }

    let algorithm = algorithm
        .or(hint)
        .ok_or_else(|| EngineError::format(origin, 1, "empty manifest without algorithm header"))?;
    Manifest::from_entries(algorithm, None, entries)
}

fn parse_entry_line(line: &str, algorithm: AlgorithmId) -> Result<(&str, &str), String> {
    if line.is_empty() {
        return Err("empty line".to_string());
    }
    if line.ends_with('\r') {
        return Err("carriage return at end of line".to_string());
    }
    let (digest, path) = line
        .split_once(FIELD_SEPARATOR)
        .ok_or_else(|| "expected '<digest>  <path>'".to_string())?;
    if !is_hex_digest(digest, algorithm.hex_len()) {
        return Err(format!(
            "'{}' is not a {}-character lowercase hex {} digest",
            digest,
            algorithm.hex_len(),
            algorithm
        ));
    }
    validate_relative_path(path)?;
    Ok((digest, path))
}

fn validate_relative_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("empty path".to_string());
    }
    if path.starts_with('/') {
        return Err(format!("path '{}' is absolute", path));
    }
    if path.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(format!("path '{}' is not a normalized relative path", path));
    }
    Ok(())
}
