//! Digest computation backends.
//!
//! This module provides:
//! - Streaming hashers for SHA-256 and BLAKE3
//! - `Backend`, the closed set of execution paths for an algorithm
//! - `Digester`, a per-worker handle that hashes whole files

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::ExternalToolError;
use crate::model::AlgorithmId;

/// Read size used when streaming a file through a hasher.
pub const STREAM_CHUNK: usize = 1024 * 1024;

/// Trait for incremental digest computation
pub trait ChecksumHasher {
    /// Update the hasher with new data
    fn update(&mut self, data: &[u8]);

    /// Finalize and return the lowercase hex digest
    fn finalize_hex(self: Box<Self>) -> String;
}

/// SHA-256 hasher (backed by sha2 crate)
struct Sha256Hasher {
    hasher: sha2::Sha256,
}

impl Sha256Hasher {
    fn new() -> Self {
        Sha256Hasher {
            hasher: sha2::Sha256::default(),
        }
    }
}

impl ChecksumHasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) {
        use sha2::Digest;
        self.hasher.update(data);
    }

    fn finalize_hex(self: Box<Self>) -> String {
        use sha2::Digest;
        format!("{:x}", self.hasher.finalize())
    }
}

/// BLAKE3 hasher (backed by blake3 crate)
#[cfg(feature = "fast-hash")]
struct Blake3Hasher {
    hasher: blake3::Hasher,
}

#[cfg(feature = "fast-hash")]
impl Blake3Hasher {
    fn new() -> Self {
        Blake3Hasher {
            hasher: blake3::Hasher::new(),
        }
    }
}

#[cfg(feature = "fast-hash")]
impl ChecksumHasher for Blake3Hasher {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn finalize_hex(self: Box<Self>) -> String {
        self.hasher.finalize().to_hex().to_string()
    }
}

/// Whether the in-process fast hash library was compiled in.
pub fn in_process_fast_available() -> bool {
    cfg!(feature = "fast-hash")
}

/// Stream a reader through a hasher, returning the hex digest.
pub fn digest_reader<R: Read>(mut reader: R, mut hasher: Box<dyn ChecksumHasher + Send>) -> io::Result<String> {
    let mut buffer = vec![0u8; STREAM_CHUNK];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(hasher.finalize_hex())
}

/// True if `s` is a lowercase hex string of exactly `len` characters.
pub fn is_hex_digest(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// The execution path used to compute digests for a run.
///
/// Every variant of a given algorithm yields identical digests, so the
/// backend is never recorded in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// BLAKE3 computed by an external `b3sum`-compatible program
    ExternalProcess { program: PathBuf },
    /// BLAKE3 computed by the linked `blake3` crate
    InProcessLibrary,
    /// SHA-256 computed by the linked `sha2` crate, always available
    BuiltinStandard,
}

impl Backend {
    /// Algorithm this backend computes.
    pub fn algorithm(&self) -> AlgorithmId {
        match self {
            Backend::ExternalProcess { .. } | Backend::InProcessLibrary => AlgorithmId::FastParallel,
            Backend::BuiltinStandard => AlgorithmId::Standard,
        }
    }

    /// Whether per-file internal threads have any effect.
    pub fn supports_internal_threads(&self) -> bool {
        !matches!(self, Backend::BuiltinStandard)
    }

    pub fn describe(&self) -> String {
        match self {
            Backend::ExternalProcess { program } => format!("external ({})", program.display()),
            Backend::InProcessLibrary => "in-process library".to_string(),
            Backend::BuiltinStandard => "built-in".to_string(),
        }
    }
}

/// Per-worker digest engine: a backend plus its internal thread setup.
///
/// `threads` is the number of internal threads used for one file. For the
/// external backend 0 leaves the choice to the program.
pub struct Digester {
    backend: Backend,
    threads: usize,
    #[cfg(feature = "fast-hash")]
    pool: Option<rayon::ThreadPool>,
}

impl Digester {
    /// Build a digester.
    ///
    /// # Errors
    /// Fails if the internal thread pool cannot be created.
    pub fn new(backend: Backend, threads: usize) -> io::Result<Self> {
        #[cfg(feature = "fast-hash")]
        let pool = if backend == Backend::InProcessLibrary && threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("blake3-{}", i))
                .build()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            Some(pool)
        } else {
            None
        };

        Ok(Digester {
            backend,
            threads,
            #[cfg(feature = "fast-hash")]
            pool,
        })
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Compute the hex digest of the file at `path`.
    pub fn digest_file(&self, path: &Path) -> io::Result<String> {
        match &self.backend {
            Backend::BuiltinStandard => {
                let file = File::open(path)?;
                digest_reader(file, Box::new(Sha256Hasher::new()))
            }
            Backend::InProcessLibrary => self.digest_in_process(path),
            Backend::ExternalProcess { program } => digest_external(program, path, self.threads),
        }
    }

    #[cfg(feature = "fast-hash")]
    fn digest_in_process(&self, path: &Path) -> io::Result<String> {
        match &self.pool {
            Some(pool) => pool.install(|| {
                let mut hasher = blake3::Hasher::new();
                hasher.update_mmap_rayon(path)?;
                Ok(hasher.finalize().to_hex().to_string())
            }),
            None => {
                let file = File::open(path)?;
                digest_reader(file, Box::new(Blake3Hasher::new()))
            }
        }
    }

    #[cfg(not(feature = "fast-hash"))]
    fn digest_in_process(&self, _path: &Path) -> io::Result<String> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "in-process BLAKE3 support was not compiled in",
        ))
    }
}

/// Hash one file with an external `b3sum`-compatible program.
fn digest_external(program: &Path, path: &Path, threads: usize) -> io::Result<String> {
    // vanished and permission failures surface as io kinds, not tool exits
    drop(File::open(path)?);

    let mut command = Command::new(program);
    command.arg("--no-names");
    if threads > 0 {
        command.arg("--num-threads").arg(threads.to_string());
    }
    command
        .arg("--")
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!(program = %program.display(), path = %path.display(), "running external hasher");
    let output = command.output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ExternalToolError::into_io(format!(
            "{} exited with {}: {}",
            program.display(),
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let digest = stdout.split_whitespace().next().unwrap_or_default();
    if !is_hex_digest(digest, AlgorithmId::FastParallel.hex_len()) {
        return Err(ExternalToolError::into_io(format!(
            "{} produced unexpected output: {:?}",
            program.display(),
            stdout.trim()
        )));
    }
    Ok(digest.to_string())
}

/// Writes a shell stand-in for `b3sum` that checks its argument shape and
/// prints `FAKE_B3SUM_DIGEST`. With `threads` set it demands `--num-threads`.
#[cfg(all(test, unix))]
pub(crate) fn fake_b3sum(dir: &Path, threads: Option<usize>) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let thread_check = match threads {
        Some(n) => format!("[ \"$1\" = --num-threads ] && [ \"$2\" = {n} ] || exit 4\nshift 2\n"),
        None => "[ \"$1\" = --num-threads ] && exit 4\n".to_string(),
    };
    let script = format!(
        "#!/bin/sh\n[ \"$1\" = --no-names ] || exit 3\nshift\n{thread_check}\
         [ \"$1\" = -- ] && [ $# -eq 2 ] && [ -f \"$2\" ] || exit 5\necho {FAKE_B3SUM_DIGEST}\n"
    );
    let program = dir.join("fake-b3sum");
    std::fs::write(&program, script).expect("Failed to write");
    std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).expect("Failed to chmod");

    // a fresh executable can be briefly busy while a forked child still holds the write handle
    for _ in 0..50 {
        match Command::new(&program).output() {
            Err(e) if e.raw_os_error() == Some(26) => std::thread::sleep(std::time::Duration::from_millis(20)),
            _ => break,
        }
    }
    program
}

#[cfg(all(test, unix))]
pub(crate) const FAKE_B3SUM_DIGEST: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_sha256_hasher() {
        let mut hasher = Box::new(Sha256Hasher::new());
        hasher.update(b"hello");
        assert_eq!(
            hasher.finalize_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_builtin_backend_hashes_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("a.txt");
        fs::write(&path, b"abc").expect("Failed to write");

        let digester = Digester::new(Backend::BuiltinStandard, 0).expect("digester");
        assert_eq!(digester.digest_file(&path).expect("digest"), ABC_SHA256);
    }

    #[test]
    fn test_digest_missing_file_is_not_found() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let digester = Digester::new(Backend::BuiltinStandard, 0).expect("digester");
        let err = digester
            .digest_file(&temp_dir.path().join("gone"))
            .expect_err("missing file should fail");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[cfg(feature = "fast-hash")]
    #[test]
    fn test_in_process_threads_do_not_change_digest() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("big.bin");
        let data: Vec<u8> = (0..3 * STREAM_CHUNK + 17).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).expect("Failed to write");

        let expected = blake3::hash(&data).to_hex().to_string();
        for threads in [0, 1, 4] {
            let digester = Digester::new(Backend::InProcessLibrary, threads).expect("digester");
            assert_eq!(digester.digest_file(&path).expect("digest"), expected, "threads={threads}");
        }
    }

    #[cfg(feature = "fast-hash")]
    #[test]
    fn test_in_process_empty_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("empty");
        fs::write(&path, b"").expect("Failed to write");

        let expected = blake3::hash(b"").to_hex().to_string();
        for threads in [1, 2] {
            let digester = Digester::new(Backend::InProcessLibrary, threads).expect("digester");
            assert_eq!(digester.digest_file(&path).expect("digest"), expected);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_external_backend_rejects_bad_output() {
        // `echo` ignores the b3sum flags and prints them back, which is not a digest
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("a.txt");
        fs::write(&path, b"abc").expect("Failed to write");

        let digester = Digester::new(
            Backend::ExternalProcess {
                program: PathBuf::from("echo"),
            },
            0,
        )
        .expect("digester");
        let err = digester.digest_file(&path).expect_err("echo is not a hasher");
        assert!(err.get_ref().is_some_and(|inner| inner.is::<ExternalToolError>()));
    }

    #[cfg(unix)]
    #[test]
    fn test_external_backend_passes_b3sum_arguments() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("a.txt");
        fs::write(&path, b"abc").expect("Failed to write");

        for threads in [None, Some(3)] {
            let tool_dir = tempfile::tempdir().expect("Failed to create temp dir");
            let program = fake_b3sum(tool_dir.path(), threads);
            let digester = Digester::new(Backend::ExternalProcess { program }, threads.unwrap_or(0)).expect("digester");
            assert_eq!(digester.digest_file(&path).expect("digest"), FAKE_B3SUM_DIGEST, "threads {threads:?}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_external_backend_reports_missing_file_as_io() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let program = fake_b3sum(temp_dir.path(), None);
        let digester = Digester::new(Backend::ExternalProcess { program }, 0).expect("digester");

        let err = digester.digest_file(&temp_dir.path().join("gone.txt")).expect_err("missing file");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_is_hex_digest() {
        assert!(is_hex_digest(ABC_SHA256, 64));
        assert!(!is_hex_digest(&ABC_SHA256.to_uppercase(), 64));
        assert!(!is_hex_digest("abc", 64));
    }

    #[test]
    fn test_backend_algorithms() {
        assert_eq!(Backend::InProcessLibrary.algorithm(), AlgorithmId::FastParallel);
        assert_eq!(
            Backend::ExternalProcess {
                program: PathBuf::from("b3sum")
            }
            .algorithm(),
            AlgorithmId::FastParallel
        );
        assert_eq!(Backend::BuiltinStandard.algorithm(), AlgorithmId::Standard);
        assert!(!Backend::BuiltinStandard.supports_internal_threads());
    }
}
