//! The drain loop: pops jobs one at a time and runs each to completion.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use super::queue::{JobQueue, QueuedJob};
use super::JobContext;
use crate::store::RecordStatus;
use crate::telemetry::JobMetrics;

/// Configuration for the drain loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker name/identifier
    pub name: String,
    /// Upper bound on how long an idle loop sleeps before re-checking the queue
    pub poll_interval: Duration,
    /// Exit as soon as the queue is observed empty
    pub stop_when_empty: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "labkit-worker".to_string(),
            poll_interval: Duration::from_secs(1),
            stop_when_empty: false,
        }
    }
}

/// Statistics for the drain loop.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Total jobs processed
    pub processed: Arc<AtomicU64>,
    /// Jobs whose run returned Ok
    pub succeeded: Arc<AtomicU64>,
    /// Jobs that returned a JobError or panicked
    pub failed: Arc<AtomicU64>,
    /// Currently running jobs (0 or 1)
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// How one job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Finished,
    Failed,
    Panicked,
}

/// Handle for controlling a running drain loop.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    stats: WorkerStats,
    accepting: Arc<Mutex<bool>>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Ask the loop to stop after the job it is running, if any.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// True once the loop has stopped taking jobs, even if its task has not
    /// returned yet.
    pub fn is_finished(&self) -> bool {
        !*self.accepting.lock() || self.task.is_finished()
    }

    /// Wait for the loop task to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(error = %e, "Worker task ended abnormally");
        }
    }
}

/// Single consumer of a [`JobQueue`].
pub struct JobWorker {
    queue: Arc<JobQueue>,
    ctx: JobContext,
    config: WorkerConfig,
    stats: WorkerStats,
    /// Cleared, under its own lock, when the loop decides to exit on an empty queue.
    accepting: Arc<Mutex<bool>>,
}

impl JobWorker {
    pub fn new(queue: Arc<JobQueue>, ctx: JobContext, config: WorkerConfig) -> Self {
        Self {
            queue,
            ctx,
            config,
            stats: WorkerStats::new(),
            accepting: Arc::new(Mutex::new(true)),
        }
    }

    /// Spawn the drain loop, returning a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let accepting = Arc::clone(&self.accepting);
        let task = tokio::spawn(async move { self.drain(shutdown_rx).await });

        WorkerHandle {
            shutdown: shutdown_tx,
            stats,
            accepting,
            task,
        }
    }

    /// Pop and run jobs until shut down, or until the queue is empty when
    /// `stop_when_empty` is set.
    pub async fn drain(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker = %self.config.name,
            stop_when_empty = self.config.stop_when_empty,
            "Job worker started"
        );

        loop {
            if *shutdown.borrow() {
                info!(worker = %self.config.name, "Worker shutting down");
                break;
            }

            if let Some(queued) = self.queue.pop() {
                self.execute(queued).await;
                continue;
            }

            if self.config.stop_when_empty || self.queue.is_closed() {
                if self.retire_if_idle() {
                    info!(worker = %self.config.name, "Queue empty, worker stopping");
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = self.queue.wait() => {}
                changed = shutdown.changed() => {
                    // Sender dropped: nobody can stop us any more, keep draining.
                    if changed.is_err() {
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        *self.accepting.lock() = false;
        info!(
            worker = %self.config.name,
            processed = self.stats.processed(),
            failed = self.stats.failed(),
            "Worker stopped"
        );
    }

    /// Stop accepting jobs if the queue is still empty.
    ///
    /// Checked under the same lock [`WorkerHandle::is_finished`] takes, so a job
    /// put before a caller saw this loop as alive is never left behind.
    pub fn retire_if_idle(&self) -> bool {
        let mut accepting = self.accepting.lock();
        if !self.queue.is_empty() {
            return false;
        }
        *accepting = false;
        true
    }

    /// Run one job inside its own task so a panic cannot take the loop down.
    pub async fn execute(&self, queued: QueuedJob) -> JobOutcome {
        let QueuedJob { id, job, .. } = queued;
        let kind = job.kind();
        let record = job.record();
        let span = info_span!("job", job_id = %id, job_kind = %kind);

        self.stats.active.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        info!(parent: &span, record = ?record, "Job started");

        let ctx = self.ctx.clone();
        let result = tokio::spawn(async move { job.run(&ctx).await }.instrument(span.clone())).await;
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(Ok(())) => {
                info!(parent: &span, elapsed_ms = elapsed.as_millis() as u64, "Job finished");
                JobMetrics::record_completed(kind.as_str(), elapsed);
                JobOutcome::Finished
            }
            Ok(Err(err)) => {
                warn!(parent: &span, error = %err, "Job failed");
                JobMetrics::record_failed(kind.as_str(), "job_error", elapsed);
                JobOutcome::Failed
            }
            Err(join_err) => {
                error!(parent: &span, error = %join_err, "Job panicked");
                if let Some(record) = record {
                    if let Err(e) = self.ctx.store.set_status(record, RecordStatus::Error).await {
                        warn!(parent: &span, record = %record, error = %e, "Could not mark record as ERROR");
                    }
                }
                JobMetrics::record_failed(kind.as_str(), "panic", elapsed);
                JobOutcome::Panicked
            }
        };

        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        if outcome == JobOutcome::Finished {
            self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }
}
