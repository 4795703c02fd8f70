//! The job service: the one object handlers talk to.
//!
//! Owns the queue and at most one drain loop. Submission builds the job,
//! persists DELIVERED inline and only then makes the job visible to the loop.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::queue::{JobInfo, JobQueue, JobQueueError};
use super::worker::{JobWorker, WorkerConfig, WorkerHandle, WorkerStats};
use super::{
    ConverterListJob, DatasetJob, ExplorerJob, Job, JobContext, JobError, JobId, JobKind,
    JobPayload, JobStage, ModelJob, PredictJob,
};
use crate::config::QueueConfig;
use crate::error::LabError;
use crate::telemetry::JobMetrics;

/// Construct the job matching `kind` from its payload.
pub fn build_job(kind: JobKind, payload: JobPayload) -> Result<Box<dyn Job>, JobError> {
    Ok(match kind {
        JobKind::Model => Box::new(ModelJob::from_payload(payload)?),
        JobKind::Predict => Box::new(PredictJob::from_payload(payload)?),
        JobKind::Explorer => Box::new(ExplorerJob::from_payload(payload)?),
        JobKind::ConverterList => Box::new(ConverterListJob::from_payload(payload)?),
        JobKind::Dataset => Box::new(DatasetJob::from_payload(payload)?),
    })
}

pub struct JobService {
    queue: Arc<JobQueue>,
    ctx: JobContext,
    worker: Mutex<Option<WorkerHandle>>,
    poll_interval: Duration,
}

impl JobService {
    pub fn new(ctx: JobContext, config: &QueueConfig) -> Self {
        Self {
            queue: Arc::new(JobQueue::new()),
            ctx,
            worker: Mutex::new(None),
            poll_interval: config.poll_interval,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    /// Build, deliver and queue a job.
    ///
    /// A closed queue is rejected before delivery so the record keeps its status.
    pub async fn enqueue(&self, kind: JobKind, payload: JobPayload) -> Result<JobInfo, LabError> {
        let job = build_job(kind, payload)?;
        if self.queue.is_closed() {
            return Err(JobQueueError::Closed.into());
        }
        job.mark_delivered(&self.ctx).await?;
        let record = job.record();
        let info = match self.queue.put(job) {
            Ok(info) => info,
            Err(e) => {
                // Closed between the check and the put: the record is DELIVERED with no job behind it.
                if let Some(record) = record {
                    let err = JobError::new(JobStage::Deliver, e.to_string()).with_record(record);
                    self.ctx.fail(kind, err).await;
                }
                return Err(e.into());
            }
        };
        JobMetrics::record_enqueued(kind.as_str());
        info!(job_id = %info.id, job_kind = %kind, "Job enqueued");
        Ok(info)
    }

    /// Start the drain loop unless one is already running.
    ///
    /// A `stop_when_empty` loop that has already retired counts as stopped.
    /// Returns whether a new loop was started.
    pub fn start_loop(&self, stop_when_empty: bool) -> bool {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        let config = WorkerConfig {
            poll_interval: self.poll_interval,
            stop_when_empty,
            ..WorkerConfig::default()
        };
        let handle = JobWorker::new(Arc::clone(&self.queue), self.ctx.clone(), config).start();
        *worker = Some(handle);
        info!(stop_when_empty, "Job queue loop started");
        true
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Counters of the current (or last) loop.
    pub fn stats(&self) -> Option<WorkerStats> {
        self.worker.lock().as_ref().map(|handle| handle.stats().clone())
    }

    /// Remove a pending job. Its record stays where delivery left it.
    pub fn cancel(&self, id: JobId) -> Result<JobInfo, JobQueueError> {
        let removed = self.queue.get(id)?;
        let info = removed.info();
        JobMetrics::record_cancelled(info.kind.as_str());
        info!(job_id = %id, job_kind = %info.kind, "Job cancelled");
        Ok(info)
    }

    pub fn peek(&self, id: JobId) -> Result<JobInfo, JobQueueError> {
        self.queue.peek(id)
    }

    pub fn list(&self) -> Vec<JobInfo> {
        self.queue.list()
    }

    /// Wait for the current loop to exit on its own, e.g. one started with
    /// `stop_when_empty`.
    pub async fn wait_idle(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            handle.join().await;
        }
    }

    /// Close the queue and stop the loop after the job it is running.
    pub async fn shutdown(&self) {
        self.queue.close();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            handle.shutdown();
            handle.join().await;
        }
        info!(pending = self.queue.len(), "Job service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::ComponentRegistry;
    use crate::config::StorageConfig;
    use crate::error::ErrorCode;
    use crate::store::InMemoryRecordStore;
    use serde_json::json;

    fn service() -> JobService {
        let ctx = JobContext::new(
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(ComponentRegistry::with_defaults()),
            StorageConfig::default(),
        );
        JobService::new(ctx, &QueueConfig::default())
    }

    #[test]
    fn test_build_job_per_kind() {
        let payload = json!({"run_id": 1, "dataset_id": 2, "explorer_id": 3,
            "converter_list_id": 4, "target_column_index": 1});
        for kind in [JobKind::Model, JobKind::Predict, JobKind::Explorer, JobKind::ConverterList] {
            let job = build_job(kind, payload.as_object().unwrap().clone()).unwrap();
            assert_eq!(job.kind(), kind);
        }
        assert!(build_job(JobKind::Dataset, payload.as_object().unwrap().clone()).is_err());
    }

    #[tokio::test]
    async fn test_enqueue_unknown_record_is_rejected() {
        let service = service();
        let payload = json!({"run_id": 42});
        let err = service
            .enqueue(JobKind::Model, payload.as_object().unwrap().clone())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RecordNotFound);
        assert!(service.list().is_empty());
    }

    #[tokio::test]
    async fn test_start_loop_is_idempotent() {
        let service = service();
        assert!(service.start_loop(false));
        assert!(!service.start_loop(false));
        assert!(service.is_running());
        service.shutdown().await;
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_start_loop_replaces_retired_loop() {
        let service = service();
        assert!(service.start_loop(true));
        while service.is_running() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(service.start_loop(false));
        assert!(service.is_running());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_rejected() {
        let service = service();
        service.shutdown().await;
        let payload = json!({"run_id": 42});
        let err = service
            .enqueue(JobKind::Model, payload.as_object().unwrap().clone())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::QueueClosed);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let service = service();
        let err = service.cancel(JobId::new()).unwrap_err();
        assert!(matches!(err, JobQueueError::NotFound(_)));
    }
}
