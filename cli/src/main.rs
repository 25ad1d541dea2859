//! mirror - Copy a directory tree and prove the copy with a content manifest.
//!
//! Sequences the engine's steps: hash the source into a manifest, mirror the
//! tree with a copy collaborator, then rehash the destination and verify it.
//! Exit codes: 0 success, 1 verification failed, 2 any other error.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use mirror_engine::algorithm::DEFAULT_EXTERNAL_PROGRAM;
use mirror_engine::{
    default_manifest_path, locate_manifest, make_manifest, manifest_hint, read_manifest, resolve_backend,
    verify_against, AlgorithmMode, Availability, CancellationToken, CopyCollaborator, EngineError, ExcludeRules,
    Manifest, ManifestLocation, NativeCopier, ProgressCallback, RsyncCopier, RunConfig,
    SelectorConfig, VerificationReport,
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Steps of a mirror run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Step {
    /// Make the manifest, copy, then verify
    All,
    MakeManifest,
    Copy,
    Verify,
}

impl Step {
    fn makes_manifest(self) -> bool {
        matches!(self, Step::All | Step::MakeManifest)
    }

    fn copies(self) -> bool {
        matches!(self, Step::All | Step::Copy)
    }

    fn verifies(self) -> bool {
        matches!(self, Step::All | Step::Verify)
    }
}

/// Copy collaborator used by the copy step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Copier {
    /// External `rsync -a`
    Rsync,
    /// Built-in recursive copy
    Native,
}

/// mirror - Mirror with content manifest and verification
#[derive(Parser, Debug)]
#[command(name = "mirror")]
#[command(version)]
#[command(about = "Mirror a directory tree and verify the copy against a content manifest")]
struct Args {
    /// Source directory
    #[arg(value_name = "SRC")]
    src: Option<PathBuf>,

    /// Destination directory
    #[arg(value_name = "DST")]
    dst: Option<PathBuf>,

    /// Run a single step or all of them
    #[arg(long, value_enum, default_value_t = Step::All)]
    step: Step,

    /// Files hashed in parallel (default: logical CPU count)
    #[arg(long, value_name = "N", env = "MIRROR_JOBS")]
    jobs: Option<usize>,

    /// Internal BLAKE3 threads per file (0 = automatic)
    #[arg(long, value_name = "N", visible_alias = "blake3-threads", env = "MIRROR_B3THREADS", default_value_t = 0)]
    threads: usize,

    /// Hash algorithm: auto (prefer blake3), blake3, or sha256
    #[arg(long, value_name = "ALGO", default_value = "auto")]
    algo: AlgorithmMode,

    /// Try the external b3sum program before the built-in BLAKE3 library
    #[arg(long, visible_alias = "prefer-external-b3")]
    prefer_external: bool,

    /// External BLAKE3 program
    #[arg(long, value_name = "PROGRAM", default_value = DEFAULT_EXTERNAL_PROGRAM)]
    b3sum: PathBuf,

    /// Manifest path, "-" for stdout/stdin. Default: SRC/BLAKE3SUMS or
    /// SRC/SHA256SUMS when writing; DST then SRC when verifying
    #[arg(long, value_name = "PATH")]
    manifest: Option<String>,

    /// Preview the copy without writing; skips manifest and verification
    #[arg(long)]
    dry_run: bool,

    /// Treat extra files at the destination as a verification failure
    #[arg(long)]
    strict: bool,

    /// Abort on the first file that cannot be hashed
    #[arg(long)]
    fail_fast: bool,

    /// Allow jobs x threads to exceed the logical CPU count
    #[arg(long)]
    no_cap: bool,

    /// Extra file name to skip, besides .DS_Store and ._* (repeatable)
    #[arg(long, value_name = "NAME")]
    exclude: Vec<String>,

    /// Copy collaborator
    #[arg(long, value_enum, default_value_t = Copier::Rsync)]
    copier: Copier,

    /// Print the verification report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn run_config(&self) -> RunConfig {
        let defaults = RunConfig::default();
        RunConfig {
            jobs: self.jobs.unwrap_or(defaults.jobs),
            threads: self.threads,
            selector: SelectorConfig {
                mode: self.algo,
                prefer_external: self.prefer_external,
            },
            external_program: self.b3sum.clone(),
            fail_fast: self.fail_fast,
            strict: self.strict,
            cap_parallelism: !self.no_cap,
            excludes: self
                .exclude
                .iter()
                .fold(ExcludeRules::default(), |rules, name| rules.with_name(name.as_str())),
        }
    }

    fn copier(&self) -> Box<dyn CopyCollaborator> {
        match self.copier {
            Copier::Rsync => Box::new(RsyncCopier::default()),
            Copier::Native => Box::new(NativeCopier::default()),
        }
    }
}

/// How a run ended when no fatal error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    VerificationFailed,
    /// The manifest was written but some files could not be hashed
    Incomplete,
}

impl Outcome {
    fn exit_code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::VerificationFailed => 1,
            Outcome::Incomplete => 2,
        }
    }
}

struct ProgressState {
    label: String,
    started: Instant,
    last_report: Instant,
}

/// Throttled stderr counter for hashing runs
struct CliProgress {
    files: AtomicUsize,
    bytes: AtomicU64,
    state: Mutex<ProgressState>,
}

impl CliProgress {
    const EVERY_FILES: usize = 100;
    const EVERY: Duration = Duration::from_millis(500);

    fn new() -> Self {
        let now = Instant::now();
        CliProgress {
            files: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
            state: Mutex::new(ProgressState {
                label: String::new(),
                started: now,
                last_report: now,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }
}

impl ProgressCallback for CliProgress {
    fn on_run_started(&self, label: &str) {
        self.files.store(0, Ordering::SeqCst);
        self.bytes.store(0, Ordering::SeqCst);
        let now = Instant::now();
        let mut state = self.state();
        state.label = label.to_string();
        state.started = now;
        state.last_report = now;
    }

    fn on_file_hashed(&self, _relative_path: &str, bytes: u64) {
        let files = self.files.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;

        let mut state = self.state();
        if files % Self::EVERY_FILES != 0 && state.last_report.elapsed() < Self::EVERY {
            return;
        }
        state.last_report = Instant::now();
        eprint!("\r{}: {} files, {}", state.label, files, Self::format_bytes(total));
        let _ = io::stderr().flush();
    }

    fn on_run_completed(&self, files: usize, bytes: u64) {
        let state = self.state();
        eprintln!(
            "\r{}: {} files, {} in {}",
            state.label,
            files,
            Self::format_bytes(bytes),
            Self::format_duration(state.started.elapsed())
        );
    }
}

/// Parse arguments, run the requested steps and exit with the run's code
fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let cancel = CancellationToken::new();
    install_interrupt_handler(cancel.clone());
    print_banner(&args);

    let exit_code = match run_cli(&args, &cancel) {
        Ok(outcome) => outcome.exit_code(),
        Err(EngineError::Cancelled) => {
            eprintln!("[ERROR] Interrupted.");
            EngineError::Cancelled.exit_code()
        }
        Err(e) => {
            eprintln!("[ERROR] {}", e);
            e.exit_code()
        }
    };

    std::process::exit(exit_code);
}

/// Log to stderr; stdout carries streamed manifests and JSON reports.
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// Cancel `cancel` on Ctrl-C. Workers finish the file in hand and the run
/// returns `Cancelled` without committing a manifest.
fn install_interrupt_handler(cancel: CancellationToken) {
    let spawned = thread::Builder::new().name("ctrl-c".to_string()).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(error = %e, "cannot listen for Ctrl-C");
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("interrupt received");
                cancel.cancel();
            }
        });
    });
    if let Err(e) = spawned {
        warn!(error = %e, "cannot start the Ctrl-C listener");
    }
}

fn print_banner(args: &Args) {
    let ts = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let step = args.step.to_possible_value().map(|v| v.get_name().to_string()).unwrap_or_default();
    eprintln!("=== Mirror ===");
    eprintln!("Time : {}", ts);
    eprintln!("Step : {}", step);
    eprintln!("Dry  : {}", args.dry_run);
    eprintln!("Algo : {}", args.algo);
    eprintln!();
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args, cancel: &CancellationToken) -> Result<Outcome, EngineError> {
    let config = args.run_config();
    config.validate()?;
    let availability = Availability::probe(&config.external_program);
    let progress = CliProgress::new();
    let named = args.manifest.as_deref().map(ManifestLocation::from_arg);
    if args.json && args.step.makes_manifest() && args.step.verifies() && named == Some(ManifestLocation::Stdio) {
        return Err(EngineError::Configuration(
            "--json and --manifest - would both write to stdout".to_string(),
        ));
    }

    // A dry run only previews the copy.
    let dry_all = args.dry_run && args.step == Step::All;

    let mut fresh: Option<(Manifest, ManifestLocation)> = None;
    if args.step.makes_manifest() && !dry_all {
        let src = required(&args.src, "SRC required for make-manifest")?;
        let backend = resolve_backend(&config, &availability)?;
        let location = named
            .clone()
            .unwrap_or_else(|| ManifestLocation::File(default_manifest_path(src, backend.algorithm())));

        eprintln!("[1/3] Creating manifest at source -> {} ({})", location, backend.describe());
        let run = make_manifest(src, &location, &config, backend, cancel, Some(&progress))?;
        if !run.is_complete() {
            eprintln!(
                "[ERROR] {} file(s) could not be hashed; manifest written without them.",
                run.errors.len()
            );
            return Ok(Outcome::Incomplete);
        }
        fresh = Some((run.manifest, location));
    }

    if args.step.copies() {
        let (src, dst) = match (&args.src, &args.dst) {
            (Some(src), Some(dst)) => (src.as_path(), dst.as_path()),
            _ => return Err(EngineError::Configuration("SRC and DST required for copy".to_string())),
        };
        let copier = args.copier();
        eprintln!("[2/3] Copying with {}...", copier.name());
        let report = copier.mirror(src, dst, args.dry_run, cancel)?;
        if args.dry_run {
            if report.files_planned > 0 {
                eprintln!(
                    "Would copy {} file(s), {}",
                    report.files_planned,
                    CliProgress::format_bytes(report.bytes_planned)
                );
            }
            eprintln!("[OK] Dry-run complete.");
            return Ok(Outcome::Success);
        }
    }

    if !args.step.verifies() {
        return Ok(Outcome::Success);
    }

    let target = args
        .dst
        .as_deref()
        .or(args.src.as_deref())
        .ok_or_else(|| EngineError::Configuration("Need DST or SRC for verify target".to_string()))?;

    let (manifest, location) = match fresh {
        Some(built) => built,
        None => {
            let location = match named {
                Some(location) => location,
                None => locate_manifest(args.src.as_deref(), target, args.algo)
                    .map(ManifestLocation::File)
                    .ok_or_else(|| {
                        EngineError::Configuration("Need SRC or --manifest for verify: no manifest found".to_string())
                    })?,
            };
            let manifest = read_manifest(&location, manifest_hint(&location, args.algo))?;
            (manifest, location)
        }
    };

    let exclude = location
        .file_path()
        .map(|path| manifest_in_target(path, args.src.as_deref(), target));
    eprintln!("[3/3] Verifying at {} using {}", target.display(), location);
    let report = verify_against(
        &manifest,
        target,
        &config,
        &availability,
        exclude.as_deref(),
        cancel,
        Some(&progress),
    )?;

    print_summary(&report);
    if args.json {
        if let Err(e) = print_json(&report) {
            warn!(error = %e, "cannot write JSON report");
        }
    }

    if report.passed() {
        eprintln!("[OK] Verification successful.");
        Ok(Outcome::Success)
    } else {
        Ok(Outcome::VerificationFailed)
    }
}

fn required<'a>(path: &'a Option<PathBuf>, message: &str) -> Result<&'a Path, EngineError> {
    path.as_deref()
        .ok_or_else(|| EngineError::Configuration(message.to_string()))
}

/// Where `manifest` sits inside `target`: its copied counterpart when it
/// was written under `source`, otherwise the file itself.
fn manifest_in_target(manifest: &Path, source: Option<&Path>, target: &Path) -> PathBuf {
    let relative = source.and_then(|source| {
        let manifest = manifest.canonicalize().ok()?;
        let source = source.canonicalize().ok()?;
        manifest.strip_prefix(&source).ok().map(Path::to_path_buf)
    });
    match relative {
        Some(relative) => target.join(relative),
        None => manifest.to_path_buf(),
    }
}

fn print_summary(report: &VerificationReport) {
    for verdict in report.problems() {
        eprintln!("[{}] {}", verdict.status, verdict.relative_path);
    }
    for error in &report.errors {
        eprintln!("[UNREADABLE] {}", error);
    }

    let counts = &report.counts;
    eprintln!(
        "Summary: {} ok, {} mismatch, {} missing, {} extra, {} unreadable",
        counts.matched, counts.mismatched, counts.missing, counts.extra, counts.unreadable
    );
    if !report.passed() {
        let problems = counts.mismatched
            + counts.missing
            + counts.unreadable
            + if report.strict { counts.extra } else { 0 };
        eprintln!("[ERROR] Verification failed: {} problem(s).", problems);
    }
}

fn print_json(report: &VerificationReport) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, report)?;
    writeln!(stdout)
}
