//! Bounded pool of background workers.
//!
//! When the last handle to a file closes with work outstanding, the cache pool
//! hands the entry to this pool instead of finishing synchronously.
//!
//! # Design
//!
//! - Fixed number of named worker threads
//! - Bounded submission queue (reject-fast when full)
//! - Jobs are run by a [`JobHandler`], which owns the upload/download policy
//! - Dropping the pool closes the queue; workers drain it and are joined

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::{Condvar, Mutex};
use tracing::{Span, debug, error, info, trace, warn};

use crate::entry::FileCacheEntry;
use crate::error::{CacheError, CacheResult, SubmitError};

/// Background work for one entry.
#[derive(Debug)]
pub enum Job {
    /// Push dirty content to the remote, then drop the entry if idle.
    Upload(Arc<FileCacheEntry>),
    /// Finish a partial download, then drop the entry if idle.
    Download(Arc<FileCacheEntry>),
}

impl Job {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Job::Upload(_) => "upload",
            Job::Download(_) => "download",
        }
    }

    /// The entry this job works on.
    pub fn entry(&self) -> &Arc<FileCacheEntry> {
        match self {
            Job::Upload(entry) | Job::Download(entry) => entry,
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Work finished.
    Completed,
    /// Stopped early because the entry was reopened.
    Aborted,
    /// Gave up after an error.
    Failed,
}

/// Executes jobs on worker threads.
pub trait JobHandler: Send + Sync + 'static {
    /// Runs one job to completion, abort, or failure.
    fn handle(&self, job: &Job) -> JobOutcome;
}

/// Counters for the worker pool.
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Number of jobs submitted.
    pub jobs_submitted: AtomicU64,
    /// Number of jobs that completed.
    pub jobs_completed: AtomicU64,
    /// Number of jobs aborted by a reopen.
    pub jobs_aborted: AtomicU64,
    /// Number of jobs that failed.
    pub jobs_failed: AtomicU64,
    /// Number of jobs rejected because the queue was full.
    pub jobs_rejected: AtomicU64,
    /// Jobs queued or running.
    pub queue_depth: AtomicU64,
    /// Total execution time in nanoseconds.
    pub total_execution_nanos: AtomicU64,
}

impl WorkerStats {
    /// Record a job submission.
    pub fn record_submit(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished job.
    pub fn record_complete(&self, outcome: JobOutcome, duration: Duration) {
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
        let counter = match outcome {
            JobOutcome::Completed => &self.jobs_completed,
            JobOutcome::Aborted => &self.jobs_aborted,
            JobOutcome::Failed => &self.jobs_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation)]
        let nanos = duration.as_nanos() as u64;
        self.total_execution_nanos
            .fetch_add(nanos, Ordering::Relaxed);
    }

    /// Record a job rejection.
    pub fn record_reject(&self) {
        self.jobs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Average execution time over finished jobs.
    pub fn avg_execution_time(&self) -> Duration {
        let finished = self.jobs_completed.load(Ordering::Relaxed)
            + self.jobs_aborted.load(Ordering::Relaxed)
            + self.jobs_failed.load(Ordering::Relaxed);
        if finished == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_execution_nanos.load(Ordering::Relaxed) / finished)
    }
}

/// Tracks jobs that have been accepted but not finished.
#[derive(Debug, Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }

    fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Fixed pool of background worker threads fed by a bounded queue.
pub struct WorkerPool {
    submit_tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
    pending: Arc<Pending>,
    capacity: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.workers.len())
            .field("capacity", &self.capacity)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Starts `threads` workers running jobs through `handler`.
    ///
    /// Worker events are logged under `span`.
    pub fn new(
        handler: Arc<dyn JobHandler>,
        threads: usize,
        capacity: usize,
        span: &Span,
    ) -> CacheResult<Self> {
        let threads = threads.max(1);
        let capacity = capacity.max(1);
        let (submit_tx, submit_rx) = bounded(capacity);
        let stats = Arc::new(WorkerStats::default());
        let pending = Arc::new(Pending::default());

        let mut workers = Vec::with_capacity(threads);
        for worker_id in 0..threads {
            let rx = submit_rx.clone();
            let handler = Arc::clone(&handler);
            let stats = Arc::clone(&stats);
            let pending = Arc::clone(&pending);
            let span = span.clone();

            let handle = thread::Builder::new()
                .name(format!("kpfs-worker-{worker_id}"))
                .spawn(move || {
                    let _enter = span.enter();
                    worker_loop(worker_id, &rx, handler.as_ref(), &stats, &pending);
                })
                .map_err(CacheError::Spawn)?;
            workers.push(handle);
        }

        info!(
            parent: span,
            threads, capacity, "Background workers started"
        );

        Ok(Self {
            submit_tx: Some(submit_tx),
            workers,
            stats,
            pending,
            capacity,
        })
    }

    /// Queues a job without blocking.
    ///
    /// Returns the job back with the error if the queue is full or closed.
    pub fn try_submit(&self, job: Job) -> Result<(), (SubmitError, Job)> {
        let Some(tx) = self.submit_tx.as_ref() else {
            return Err((SubmitError::Shutdown, job));
        };

        self.pending.add();
        match tx.try_send(job) {
            Ok(()) => {
                self.stats.record_submit();
                trace!("Job queued");
                Ok(())
            }
            Err(TrySendError::Full(rejected)) => {
                self.pending.done();
                self.stats.record_reject();
                warn!(
                    capacity = self.capacity,
                    kind = rejected.kind(),
                    "Worker queue full, rejecting job"
                );
                Err((
                    SubmitError::QueueFull {
                        capacity: self.capacity,
                    },
                    rejected,
                ))
            }
            Err(TrySendError::Disconnected(rejected)) => {
                self.pending.done();
                error!("Worker channel disconnected");
                Err((SubmitError::Shutdown, rejected))
            }
        }
    }

    /// Blocks until every accepted job has finished.
    pub fn wait_idle(&self) {
        self.pending.wait();
    }

    /// Like [`wait_idle`](Self::wait_idle) with a timeout. Returns true if the
    /// pool went idle.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        self.pending.wait_for(timeout)
    }

    /// Worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Jobs queued or running.
    pub fn queue_depth(&self) -> u64 {
        self.stats.queue_depth.load(Ordering::Relaxed)
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Closes the queue, lets workers drain it, and joins them.
    pub fn shutdown(mut self) {
        self.close_and_join();
    }

    fn close_and_join(&mut self) {
        if self.submit_tx.take().is_none() {
            return;
        }
        debug!("Waiting for background workers to drain");
        for handle in std::mem::take(&mut self.workers) {
            if handle.join().is_err() {
                error!("Background worker panicked");
            }
        }
        info!("Background workers stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close_and_join();
    }
}

fn worker_loop(
    worker_id: usize,
    rx: &Receiver<Job>,
    handler: &dyn JobHandler,
    stats: &WorkerStats,
    pending: &Pending,
) {
    debug!(worker_id, "Worker started");

    // Ends once every sender is dropped and the queue is empty.
    for job in rx {
        let start = Instant::now();
        let kind = job.kind();
        trace!(worker_id, kind, path = %job.entry().path(), "Running job");

        let outcome = handler.handle(&job);
        let elapsed = start.elapsed();
        stats.record_complete(outcome, elapsed);
        drop(job);
        pending.done();

        trace!(
            worker_id,
            kind,
            ?outcome,
            elapsed_ms = elapsed.as_millis(),
            "Job finished"
        );
    }

    debug!(worker_id, "Worker exiting");
}
