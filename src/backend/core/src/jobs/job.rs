//! Job definitions and the contract every job type implements.
//!
//! - **Job trait**: `mark_delivered` runs inline with the submitting request,
//!   `run` runs on the drain loop
//! - **JobError**: business failure carrying the failing stage and record
//! - **JobContext**: shared collaborators handed to every job

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::components::{ComponentRegistry, RegistryError};
use crate::config::StorageConfig;
use crate::dataset::{self, DatasetMetadata};
use crate::error::{ErrorCode, LabError};
use crate::store::{RecordId, RecordRef, RecordStatus, RecordStore};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Queue handle of a pending job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Kind & Payload
// ═══════════════════════════════════════════════════════════════════════════════

/// Discriminates the pipeline a job runs. Serialized with the names clients submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    #[serde(rename = "ModelJob")]
    Model,
    #[serde(rename = "PredictJob")]
    Predict,
    #[serde(rename = "ExplorerJob")]
    Explorer,
    #[serde(rename = "ConverterListJob")]
    ConverterList,
    #[serde(rename = "DatasetJob")]
    Dataset,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::Model,
        JobKind::Predict,
        JobKind::Explorer,
        JobKind::ConverterList,
        JobKind::Dataset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "ModelJob",
            Self::Predict => "PredictJob",
            Self::Explorer => "ExplorerJob",
            Self::ConverterList => "ConverterListJob",
            Self::Dataset => "DatasetJob",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                LabError::new(ErrorCode::UnknownJobType, format!("Unknown job type: {}", s))
                    .with_context("job_type", s)
            })
    }
}

/// Open string-keyed arguments; each job type validates its own keys.
pub type JobPayload = Map<String, Value>;

/// Read a required integer id from a payload.
pub fn payload_id(payload: &JobPayload, key: &str) -> Result<RecordId, JobError> {
    match payload.get(key) {
        Some(value) => value.as_i64().ok_or_else(|| {
            JobError::invalid_payload(format!("{} must be an integer, got {}", key, value))
        }),
        None => Err(JobError::invalid_payload(format!("missing required field {}", key))),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Pipeline stage a job failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Deliver,
    LoadRecord,
    LoadDataset,
    ValidateTarget,
    ResolveComponent,
    ResolveScope,
    PrepareData,
    Fit,
    Transform,
    Optimize,
    Evaluate,
    Predict,
    Explore,
    SaveArtifacts,
    Persist,
    Execute,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deliver => "deliver",
            Self::LoadRecord => "load_record",
            Self::LoadDataset => "load_dataset",
            Self::ValidateTarget => "validate_target",
            Self::ResolveComponent => "resolve_component",
            Self::ResolveScope => "resolve_scope",
            Self::PrepareData => "prepare_data",
            Self::Fit => "fit",
            Self::Transform => "transform",
            Self::Optimize => "optimize",
            Self::Evaluate => "evaluate",
            Self::Predict => "predict",
            Self::Explore => "explore",
            Self::SaveArtifacts => "save_artifacts",
            Self::Persist => "persist",
            Self::Execute => "execute",
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure inside a job's business logic.
#[derive(Debug)]
pub struct JobError {
    message: String,
    stage: JobStage,
    record: Option<RecordRef>,
    code: ErrorCode,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl JobError {
    pub fn new(stage: JobStage, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stage,
            record: None,
            code: ErrorCode::JobFailed,
            source: None,
        }
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(JobStage::Deliver, message).with_code(ErrorCode::InvalidJobPayload)
    }

    /// A referenced record does not exist.
    pub fn missing(stage: JobStage, record: RecordRef) -> Self {
        Self::new(stage, format!("{} not found", record)).with_code(ErrorCode::RecordNotFound)
    }

    pub fn with_record(mut self, record: RecordRef) -> Self {
        self.record = Some(record);
        self
    }

    /// Prepend context to the message, keeping stage, record and source.
    pub fn prefixed(mut self, prefix: impl fmt::Display) -> Self {
        self.message = format!("{}: {}", prefix, self.message);
        self
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = code;
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        self.source = Some(source.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stage(&self) -> JobStage {
        self.stage
    }

    pub fn record(&self) -> Option<RecordRef> {
        self.record
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }
        write!(f, " (stage: {}", self.stage)?;
        if let Some(record) = &self.record {
            write!(f, ", record: {}", record)?;
        }
        write!(f, ")")
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<JobError> for LabError {
    fn from(error: JobError) -> Self {
        let code = error.code;
        let message = error.message.clone();
        let stage = error.stage;
        let mut lab = LabError::with_internal(code, message, error.to_string())
            .with_context("stage", stage.as_str());
        if let Some(record) = error.record {
            lab = lab.with_context("record", record.to_string());
        }
        lab.with_source(error)
    }
}

/// Attach a stage and message to any fallible step.
pub trait StageExt<T> {
    fn stage(self, stage: JobStage, message: impl Into<String>) -> Result<T, JobError>;

    fn stage_with<F, S>(self, stage: JobStage, message: F) -> Result<T, JobError>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> StageExt<T> for Result<T, E>
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    fn stage(self, stage: JobStage, message: impl Into<String>) -> Result<T, JobError> {
        self.map_err(|e| JobError::new(stage, message).with_source(e))
    }

    fn stage_with<F, S>(self, stage: JobStage, message: F) -> Result<T, JobError>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| JobError::new(stage, message()).with_source(e))
    }
}

/// [`StageExt`] for registry lookups: stage `ResolveComponent`, with the
/// component error code kept.
pub trait ResolveExt<T> {
    fn resolve_with<F, S>(self, message: F) -> Result<T, JobError>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResolveExt<T> for Result<T, RegistryError> {
    fn resolve_with<F, S>(self, message: F) -> Result<T, JobError>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| {
            let code = e.code();
            JobError::new(JobStage::ResolveComponent, message())
                .with_code(code)
                .with_source(e)
        })
    }
}

/// Read the split metadata of the dataset at `root`, keeping the storage
/// error code (`SplitMetadataMissing` for an absent or empty file).
pub(crate) fn read_split_metadata(root: &Path) -> Result<DatasetMetadata, JobError> {
    dataset::read_metadata(root).map_err(|e| {
        let code = e.code();
        JobError::new(JobStage::LoadDataset, "Can not read dataset split metadata")
            .with_code(code)
            .with_source(e)
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Collaborators shared by every job.
#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<dyn RecordStore>,
    pub registry: Arc<ComponentRegistry>,
    pub storage: StorageConfig,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("registry", &self.registry)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl JobContext {
    pub fn new(
        store: Arc<dyn RecordStore>,
        registry: Arc<ComponentRegistry>,
        storage: StorageConfig,
    ) -> Self {
        Self {
            store,
            registry,
            storage,
        }
    }

    /// Persist a status transition of `record` as its own unit of work.
    pub async fn set_status(
        &self,
        record: RecordRef,
        status: RecordStatus,
        stage: JobStage,
    ) -> Result<(), JobError> {
        self.store
            .set_status(record, status)
            .await
            .map_err(|e| {
                let code = e.code();
                JobError::new(stage, format!("Error while setting {} as {}", record, status))
                    .with_record(record)
                    .with_code(code)
                    .with_source(e)
            })
    }

    /// Log `err`, flip its record to ERROR and hand the error back.
    ///
    /// A failure of the flip itself is logged and does not replace `err`.
    pub async fn fail(&self, kind: JobKind, err: JobError) -> JobError {
        error!(
            job_kind = %kind,
            stage = %err.stage(),
            record = ?err.record(),
            error = %err,
            "Job stage failed"
        );
        if let Some(record) = err.record() {
            if let Err(flip) = self.store.set_status(record, RecordStatus::Error).await {
                warn!(record = %record, error = %flip, "Could not mark record as ERROR");
            }
        }
        err
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A unit of queued work.
///
/// Any failure inside `run` must leave the job's record at ERROR before the
/// error is returned. Jobs own no long-lived resources and are dropped after
/// `run` returns.
#[async_trait]
pub trait Job: Send + Sync + fmt::Debug {
    fn kind(&self) -> JobKind;

    fn payload(&self) -> &JobPayload;

    /// Status-bearing record this job drives, if any.
    fn record(&self) -> Option<RecordRef>;

    /// Persist DELIVERED on the job's record before it is queued.
    async fn mark_delivered(&self, ctx: &JobContext) -> Result<(), JobError>;

    async fn run(&self, ctx: &JobContext) -> Result<(), JobError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::error::Error as _;

    #[test]
    fn test_job_kind_wire_names() {
        assert_eq!(serde_json::to_value(JobKind::ConverterList).unwrap(), json!("ConverterListJob"));
        assert_eq!("ModelJob".parse::<JobKind>().unwrap(), JobKind::Model);
        let err = "TrainJob".parse::<JobKind>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownJobType);
    }

    #[test]
    fn test_payload_id() {
        let payload = json!({"run_id": 4, "name": "x"});
        let payload = payload.as_object().unwrap();
        assert_eq!(payload_id(payload, "run_id").unwrap(), 4);

        let err = payload_id(payload, "name").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidJobPayload);
        assert_eq!(err.stage(), JobStage::Deliver);
        assert!(payload_id(payload, "dataset_id").is_err());
    }

    #[test]
    fn test_job_error_display_carries_stage_and_record() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = JobError::new(JobStage::LoadDataset, "Can not load dataset 3")
            .with_record(RecordRef::converter_list(9))
            .with_source(io);
        let text = err.to_string();
        assert!(text.contains("Can not load dataset 3: gone"));
        assert!(text.contains("stage: load_dataset"));
        assert!(text.contains("record: converter_list 9"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_stage_ext_wraps_errors() {
        let failed: Result<(), std::fmt::Error> = Err(std::fmt::Error);
        let err = failed.stage(JobStage::Fit, "fit failed").unwrap_err();
        assert_eq!(err.stage(), JobStage::Fit);
        assert_eq!(err.code(), ErrorCode::JobFailed);
    }

    #[test]
    fn test_into_lab_error_keeps_code() {
        let err = JobError::missing(JobStage::LoadRecord, RecordRef::run(1));
        let lab: LabError = err.into();
        assert_eq!(lab.code(), ErrorCode::RecordNotFound);
    }
}
