//! Bounded hash worker pool.
//!
//! The calling thread feeds jobs from the enumerator into a bounded
//! crossbeam channel and blocks when it is full. `jobs` scoped worker threads
//! each own a [`Digester`] and push results into one mutex-guarded collector.
//! No ordering is implied by submission or completion; callers sort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

use crossbeam_channel::{bounded, Receiver};
use tracing::{debug, info, warn};

use crate::checksums::{Backend, Digester};
use crate::config::QUEUE_DEPTH_PER_WORKER;
use crate::error::{EngineError, HashError};
use crate::model::{FileEntry, HashJob};
use crate::progress::{CancellationToken, ProgressCallback};

/// Read-only settings shared by every worker of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashSettings {
    pub backend: Backend,
    /// Number of concurrent workers
    pub jobs: usize,
    /// Internal threads per file, already resolved
    pub threads: usize,
    pub fail_fast: bool,
}

/// Everything a pool run produced, in no particular order.
#[derive(Debug, Default)]
pub struct PoolOutcome {
    pub entries: Vec<FileEntry>,
    pub errors: Vec<HashError>,
    pub bytes_hashed: u64,
}

#[derive(Default)]
struct Collector {
    outcome: PoolOutcome,
    first_fatal: Option<HashError>,
}

pub struct HashPool {
    settings: HashSettings,
}

impl HashPool {
    pub fn new(settings: HashSettings) -> Self {
        HashPool { settings }
    }

    pub fn settings(&self) -> &HashSettings {
        &self.settings
    }

    /// Hash every job exactly once.
    ///
    /// Enumeration failures (`Err` items) are recorded like hashing
    /// failures. With `fail_fast` the first failure stops admission and is
    /// returned as [`EngineError::HashFailed`].
    ///
    /// # Errors
    /// `Cancelled` if `cancel` fired before every job was admitted and
    /// finished; `HashFailed` under fail-fast; `Configuration` if a worker's
    /// internal thread pool cannot be built.
    pub fn run<I>(
        &self,
        jobs: I,
        cancel: &CancellationToken,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<PoolOutcome, EngineError>
    where
        I: IntoIterator<Item = Result<HashJob, HashError>>,
    {
        let workers = self.settings.jobs.max(1);
        let digesters = (0..workers)
            .map(|_| Digester::new(self.settings.backend.clone(), self.settings.threads))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EngineError::Configuration(format!("cannot start hash workers: {}", e)))?;

        info!(
            backend = %self.settings.backend.describe(),
            algorithm = %self.settings.backend.algorithm(),
            jobs = workers,
            threads = self.settings.threads,
            "starting hash workers"
        );

        let (sender, receiver) = bounded::<HashJob>(workers * QUEUE_DEPTH_PER_WORKER);
        let collector = Mutex::new(Collector::default());
        let stop = AtomicBool::new(false);
        let ctx = WorkerContext {
            collector: &collector,
            stop: &stop,
            cancel,
            progress,
            fail_fast: self.settings.fail_fast,
        };

        thread::scope(|scope| {
            for (worker_id, digester) in digesters.into_iter().enumerate() {
                let receiver = receiver.clone();
                let ctx = &ctx;
                scope.spawn(move || worker_loop(worker_id, digester, receiver, ctx));
            }
            drop(receiver);

            for item in jobs {
                if ctx.should_stop() {
                    break;
                }
                match item {
                    Ok(job) => {
                        // Only fails once every worker is gone.
                        if sender.send(job).is_err() {
                            break;
                        }
                    }
                    Err(error) => ctx.record_failure(error),
                }
            }
            drop(sender);
        });

        let Collector { mut outcome, first_fatal } = collector.into_inner().unwrap_or_else(|e| e.into_inner());
        if let Some(error) = first_fatal {
            return Err(EngineError::HashFailed(error));
        }
        if cancel.is_cancelled() {
            warn!(hashed = outcome.entries.len(), "hash run cancelled");
            return Err(EngineError::Cancelled);
        }

        outcome.errors.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        if let Some(progress) = progress {
            progress.on_run_completed(outcome.entries.len(), outcome.bytes_hashed);
        }
        info!(
            files = outcome.entries.len(),
            errors = outcome.errors.len(),
            bytes = outcome.bytes_hashed,
            "hash workers finished"
        );
        Ok(outcome)
    }
}

struct WorkerContext<'a> {
    collector: &'a Mutex<Collector>,
    stop: &'a AtomicBool,
    cancel: &'a CancellationToken,
    progress: Option<&'a dyn ProgressCallback>,
    fail_fast: bool,
}

impl WorkerContext<'_> {
    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.stop.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Collector> {
        self.collector.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_success(&self, entry: FileEntry, bytes: u64) {
        if let Some(progress) = self.progress {
            progress.on_file_hashed(&entry.relative_path, bytes);
        }
        let mut collector = self.lock();
        collector.outcome.bytes_hashed += bytes;
        collector.outcome.entries.push(entry);
    }

    fn record_failure(&self, error: HashError) {
        warn!(path = %error.relative_path, kind = %error.kind, "{}", error.message);
        if let Some(progress) = self.progress {
            progress.on_file_failed(&error);
        }
        let mut collector = self.lock();
        if self.fail_fast {
            self.stop.store(true, Ordering::SeqCst);
            if collector.first_fatal.is_none() {
                collector.first_fatal = Some(error.clone());
            }
        }
        collector.outcome.errors.push(error);
    }
}

fn worker_loop(worker_id: usize, digester: Digester, receiver: Receiver<HashJob>, ctx: &WorkerContext<'_>) {
    let algorithm = digester.backend().algorithm();
    let mut hashed = 0usize;

    // Keep draining after a stop so a producer blocked on a full queue wakes up.
    for job in receiver.iter() {
        if ctx.should_stop() {
            continue;
        }

        match digester.digest_file(&job.absolute_path) {
            Ok(digest) => {
                // size feeds progress only, never stands in for a digest
                let bytes = job.absolute_path.metadata().map(|m| m.len()).unwrap_or(0);
                hashed += 1;
                ctx.record_success(
                    FileEntry {
                        relative_path: job.relative_path,
                        digest,
                        algorithm,
                    },
                    bytes,
                );
            }
            Err(e) => ctx.record_failure(HashError::from_io(job.relative_path, &e)),
        }
    }

    debug!(worker_id, hashed, "hash worker exiting");
}
