//! Asynchronous job execution.
//!
//! - **Job**: a payload plus `mark_delivered` / `run`, one type per pipeline
//! - **Queue**: in-process FIFO of pending jobs
//! - **Worker**: the single drain loop; at most one job runs at a time
//! - **Service**: submission, cancellation and loop control for handlers
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             JobService                               │
//! │                                                                      │
//! │  enqueue ──▶ build_job ──▶ mark_delivered ──▶ JobQueue (FIFO)        │
//! │                              (DELIVERED)          │                  │
//! │  cancel ◀───────────── get(id) while pending ─────┤                  │
//! │                                                   ▼                  │
//! │                                   JobWorker drain loop (one at once) │
//! │                                   run(): STARTED ─▶ FINISHED | ERROR │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Serial execution is what keeps two jobs from writing the same dataset
//! files or database rows concurrently; nothing else locks them.

mod converter_job;
mod dataset_job;
mod explorer_job;
mod job;
mod model_job;
pub mod pipeline;
mod predict_job;
mod queue;
mod service;
mod worker;

pub use converter_job::{convert_dataset, ConverterListJob};
pub use dataset_job::{build_dataset, DatasetArgs, DatasetJob};
pub use explorer_job::{explore, ExplorerJob};
pub use job::{
    payload_id, Job, JobContext, JobError, JobId, JobKind, JobPayload, JobStage, ResolveExt,
    StageExt,
};
pub use model_job::{partition_parameters, train, ModelJob, TrainedRun};
pub use predict_job::{predict_dataset, PredictJob, PREDICTION_COLUMN};
pub use queue::{JobInfo, JobQueue, JobQueueError, QueuedJob};
pub use service::{build_job, JobService};
pub use worker::{JobOutcome, JobWorker, WorkerConfig, WorkerHandle, WorkerStats};
