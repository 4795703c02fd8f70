//! In-process FIFO job queue.
//!
//! Insertion order is execution order. The queue only answers "is this job
//! still pending"; once the drain loop pops a job it owns it exclusively and
//! the job can no longer be peeked or cancelled.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

use super::{Job, JobId, JobKind, JobPayload};
use crate::error::{ErrorCode, LabError};
use crate::telemetry::JobMetrics;

#[derive(Debug, thiserror::Error)]
pub enum JobQueueError {
    #[error("Job {0} not found in the queue")]
    NotFound(JobId),

    #[error("Job queue is closed")]
    Closed,
}

impl From<JobQueueError> for LabError {
    fn from(error: JobQueueError) -> Self {
        match &error {
            JobQueueError::NotFound(id) => {
                LabError::new(ErrorCode::JobNotFound, format!("Job {} not found", id))
                    .with_context("job_id", id.to_string())
                    .with_source(error)
            }
            JobQueueError::Closed => {
                LabError::new(ErrorCode::QueueClosed, "Job queue is closed").with_source(error)
            }
        }
    }
}

/// Serializable snapshot of a pending job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub enqueued_at: DateTime<Utc>,
}

/// A job waiting in the queue.
#[derive(Debug)]
pub struct QueuedJob {
    pub id: JobId,
    pub enqueued_at: DateTime<Utc>,
    pub job: Box<dyn Job>,
}

impl QueuedJob {
    pub fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id,
            kind: self.job.kind(),
            payload: self.job.payload().clone(),
            enqueued_at: self.enqueued_at,
        }
    }
}

/// Unbounded single-consumer queue.
#[derive(Debug, Default)]
pub struct JobQueue {
    pending: Mutex<VecDeque<QueuedJob>>,
    notify: Notify,
    closed: AtomicBool,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job. Never blocks; fails only once the queue is closed.
    ///
    /// The returned snapshot is taken before the job becomes visible to the
    /// consumer, so it is valid even if the job starts right away.
    pub fn put(&self, job: Box<dyn Job>) -> Result<JobInfo, JobQueueError> {
        if self.is_closed() {
            return Err(JobQueueError::Closed);
        }
        let queued = QueuedJob {
            id: JobId::new(),
            enqueued_at: Utc::now(),
            job,
        };
        let info = queued.info();
        let depth = {
            let mut pending = self.pending.lock();
            pending.push_back(queued);
            pending.len()
        };
        JobMetrics::set_queue_depth(depth);
        self.notify.notify_one();
        Ok(info)
    }

    /// Snapshot of a pending job without removing it.
    pub fn peek(&self, id: JobId) -> Result<JobInfo, JobQueueError> {
        self.pending
            .lock()
            .iter()
            .find(|q| q.id == id)
            .map(QueuedJob::info)
            .ok_or(JobQueueError::NotFound(id))
    }

    /// Remove and return a pending job.
    pub fn get(&self, id: JobId) -> Result<QueuedJob, JobQueueError> {
        let mut pending = self.pending.lock();
        let position = pending
            .iter()
            .position(|q| q.id == id)
            .ok_or(JobQueueError::NotFound(id))?;
        let removed = pending.remove(position).ok_or(JobQueueError::NotFound(id))?;
        JobMetrics::set_queue_depth(pending.len());
        Ok(removed)
    }

    /// Take the head of the queue.
    pub fn pop(&self) -> Option<QueuedJob> {
        let mut pending = self.pending.lock();
        let head = pending.pop_front();
        if head.is_some() {
            JobMetrics::set_queue_depth(pending.len());
        }
        head
    }

    /// Pending jobs in execution order.
    pub fn list(&self) -> Vec<JobInfo> {
        self.pending.lock().iter().map(QueuedJob::info).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Refuse further `put`s and wake any waiting consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves after the next `put` (or immediately if one happened since the
    /// last wait).
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}
