#![allow(clippy::result_large_err)]
//! # LabKit Core
//!
//! Job execution core of the AI experimentation backend.
//!
//! ## Architecture
//!
//! - **Jobs**: model training, prediction, exploration, converter pipelines
//!   and dataset creation, each a multi-stage pipeline with a persisted status
//! - **Queue**: a strictly ordered single-consumer queue drained by one loop
//! - **Components**: converters, models, metrics, optimizers, tasks, explorers
//!   and data loaders resolved by name from an explicit registry
//! - **Datasets**: three-split tabular frames stored as JSON on disk
//! - **Store**: persistent records whose status the jobs drive
//! - **Telemetry**: structured logging and Prometheus metrics

pub mod api;
pub mod components;
pub mod config;
pub mod dataset;
pub mod error;
pub mod jobs;
pub mod store;
pub mod telemetry;

pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, LabError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::components::ComponentRegistry;
    pub use crate::config::Config;
    pub use crate::dataset::{Cell, Column, DatasetSplits, Frame, Splits};
    pub use crate::error::{ErrorCode, LabError, Result};
    pub use crate::jobs::{
        Job, JobContext, JobError, JobId, JobInfo, JobKind, JobPayload, JobQueue, JobQueueError,
        JobService, JobStage,
    };
    pub use crate::store::{InMemoryRecordStore, PgRecordStore, RecordRef, RecordStatus, RecordStore};
}
