//! Persistent records that jobs read and whose status they drive.
//!
//! The job core treats the store as a transactional status sink: every call
//! is one load or one mutate-and-commit unit, and nothing holds a session open
//! across a whole job run.

mod memory;
mod postgres;

pub use memory::InMemoryRecordStore;
pub use postgres::PgRecordStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{ErrorCode, LabError, Result};

/// Primary key of every persisted record.
pub type RecordId = i64;

// ═══════════════════════════════════════════════════════════════════════════════
// Record Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle of a status-bearing record.
///
/// `NotStarted -> Delivered -> Started -> {Finished | Error}`. Terminal
/// states are final and `Error` is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    NotStarted,
    Delivered,
    Started,
    Finished,
    Error,
}

impl RecordStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }

    /// Whether moving from `self` to `next` keeps the path monotonic.
    ///
    /// Re-delivering an already delivered record is allowed so that
    /// `mark_delivered` can be called more than once before enqueue.
    pub fn can_transition_to(&self, next: RecordStatus) -> bool {
        use RecordStatus::*;
        matches!(
            (self, next),
            (NotStarted, Delivered)
                | (NotStarted, Started)
                | (NotStarted, Error)
                | (Delivered, Delivered)
                | (Delivered, Started)
                | (Delivered, Error)
                | (Started, Finished)
                | (Started, Error)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Delivered => "DELIVERED",
            Self::Started => "STARTED",
            Self::Finished => "FINISHED",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NOT_STARTED" => Ok(Self::NotStarted),
            "DELIVERED" => Ok(Self::Delivered),
            "STARTED" => Ok(Self::Started),
            "FINISHED" => Ok(Self::Finished),
            "ERROR" => Ok(Self::Error),
            other => Err(LabError::with_internal(
                ErrorCode::DeserializationError,
                "Unknown record status",
                format!("unknown status {:?}", other),
            )),
        }
    }
}

/// Status plus the timestamps stamped by each transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTrack {
    pub status: RecordStatus,
    pub delivery_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Default for StatusTrack {
    fn default() -> Self {
        Self {
            status: RecordStatus::NotStarted,
            delivery_time: None,
            start_time: None,
            end_time: None,
        }
    }
}

impl StatusTrack {
    /// Validate and apply a transition, stamping the matching timestamp.
    pub fn transition(&mut self, next: RecordStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(LabError::new(
                ErrorCode::InvalidStatusTransition,
                format!("Invalid status transition: {} -> {}", self.status, next),
            )
            .with_context("from", self.status.as_str())
            .with_context("to", next.as_str()));
        }
        let now = Utc::now();
        match next {
            RecordStatus::Delivered => self.delivery_time = Some(now),
            RecordStatus::Started => self.start_time = Some(now),
            RecordStatus::Finished | RecordStatus::Error => self.end_time = Some(now),
            RecordStatus::NotStarted => {}
        }
        self.status = next;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Record References
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Run,
    Experiment,
    Dataset,
    ConverterList,
    Explorer,
    Exploration,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Experiment => "experiment",
            Self::Dataset => "dataset",
            Self::ConverterList => "converter_list",
            Self::Explorer => "explorer",
            Self::Exploration => "exploration",
        }
    }

    /// Kinds that carry a [`StatusTrack`].
    pub fn has_status(&self) -> bool {
        matches!(self, Self::Run | Self::ConverterList | Self::Explorer)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed pointer to a persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    pub kind: RecordKind,
    pub id: RecordId,
}

impl RecordRef {
    pub fn run(id: RecordId) -> Self {
        Self { kind: RecordKind::Run, id }
    }

    pub fn converter_list(id: RecordId) -> Self {
        Self { kind: RecordKind::ConverterList, id }
    }

    pub fn explorer(id: RecordId) -> Self {
        Self { kind: RecordKind::Explorer, id }
    }

    pub fn dataset(id: RecordId) -> Self {
        Self { kind: RecordKind::Dataset, id }
    }

    pub fn experiment(id: RecordId) -> Self {
        Self { kind: RecordKind::Experiment, id }
    }

    pub fn exploration(id: RecordId) -> Self {
        Self { kind: RecordKind::Exploration, id }
    }

    pub fn not_found(&self) -> LabError {
        LabError::not_found(self.kind.as_str(), self.id.to_string())
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub id: RecordId,
    pub name: String,
    /// Dataset root directory; splits live under `<file_path>/dataset`.
    pub file_path: PathBuf,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

/// Fields needed to create a dataset record; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDataset {
    pub name: String,
    pub file_path: PathBuf,
}

/// Fractions used when split indices have to be recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitFractions {
    pub train: f64,
    pub test: f64,
    pub validation: f64,
}

impl Default for SplitFractions {
    fn default() -> Self {
        Self {
            train: 0.6,
            test: 0.2,
            validation: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: RecordId,
    pub dataset_id: RecordId,
    pub task_name: String,
    pub input_columns: Vec<String>,
    pub output_columns: Vec<String>,
    #[serde(default)]
    pub splits: SplitFractions,
    #[serde(default)]
    pub seed: Option<u64>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RecordId,
    pub experiment_id: RecordId,
    pub name: String,
    pub model_name: String,
    /// Model parameters; optimizable entries are objects with `optimize: true`.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub optimizer_name: Option<String>,
    #[serde(default)]
    pub optimizer_parameters: Map<String, Value>,
    #[serde(default)]
    pub goal_metric: Option<String>,
    #[serde(default)]
    pub train_metrics: Option<Value>,
    #[serde(default)]
    pub validation_metrics: Option<Value>,
    #[serde(default)]
    pub test_metrics: Option<Value>,
    #[serde(default)]
    pub run_path: Option<PathBuf>,
    #[serde(default)]
    pub trials_path: Option<PathBuf>,
    #[serde(flatten)]
    pub track: StatusTrack,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConverterList {
    pub id: RecordId,
    pub dataset_id: RecordId,
    /// Persisted converter spec, `{ name: { order, params, scope, children } }`.
    pub converters: Value,
    #[serde(flatten)]
    pub track: StatusTrack,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exploration {
    pub id: RecordId,
    pub dataset_id: RecordId,
    pub name: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explorer {
    pub id: RecordId,
    pub exploration_id: RecordId,
    pub name: String,
    /// Registry name of the explorer component.
    pub exploration_type: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub exploration_path: Option<PathBuf>,
    #[serde(flatten)]
    pub track: StatusTrack,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Persistent record store consumed by the job core.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_run(&self, id: RecordId) -> Result<Option<Run>>;
    async fn save_run(&self, run: &Run) -> Result<()>;

    async fn get_experiment(&self, id: RecordId) -> Result<Option<Experiment>>;
    async fn save_experiment(&self, experiment: &Experiment) -> Result<()>;

    async fn get_dataset(&self, id: RecordId) -> Result<Option<DatasetRecord>>;
    async fn save_dataset(&self, dataset: &DatasetRecord) -> Result<()>;
    async fn insert_dataset(&self, dataset: NewDataset) -> Result<DatasetRecord>;
    async fn find_dataset_by_name(&self, name: &str) -> Result<Option<DatasetRecord>>;
    /// Refresh `last_modified` after the dataset files changed on disk.
    async fn touch_dataset(&self, id: RecordId) -> Result<()>;

    async fn get_converter_list(&self, id: RecordId) -> Result<Option<ConverterList>>;
    async fn save_converter_list(&self, list: &ConverterList) -> Result<()>;

    async fn get_explorer(&self, id: RecordId) -> Result<Option<Explorer>>;
    async fn save_explorer(&self, explorer: &Explorer) -> Result<()>;

    async fn get_exploration(&self, id: RecordId) -> Result<Option<Exploration>>;
    async fn save_exploration(&self, exploration: &Exploration) -> Result<()>;

    /// Current status of a status-bearing record, `None` when it does not exist.
    async fn status_of(&self, record: RecordRef) -> Result<Option<RecordStatus>> {
        let status = match record.kind {
            RecordKind::Run => self.get_run(record.id).await?.map(|r| r.track.status),
            RecordKind::ConverterList => self
                .get_converter_list(record.id)
                .await?
                .map(|r| r.track.status),
            RecordKind::Explorer => self.get_explorer(record.id).await?.map(|r| r.track.status),
            other => return Err(no_status(other)),
        };
        Ok(status)
    }

    /// Load, transition and save a status-bearing record as one unit.
    async fn set_status(&self, record: RecordRef, next: RecordStatus) -> Result<()> {
        match record.kind {
            RecordKind::Run => {
                let mut run = self.get_run(record.id).await?.ok_or_else(|| record.not_found())?;
                run.track.transition(next)?;
                run.last_modified = Utc::now();
                self.save_run(&run).await
            }
            RecordKind::ConverterList => {
                let mut list = self
                    .get_converter_list(record.id)
                    .await?
                    .ok_or_else(|| record.not_found())?;
                list.track.transition(next)?;
                list.last_modified = Utc::now();
                self.save_converter_list(&list).await
            }
            RecordKind::Explorer => {
                let mut explorer = self
                    .get_explorer(record.id)
                    .await?
                    .ok_or_else(|| record.not_found())?;
                explorer.track.transition(next)?;
                explorer.last_modified = Utc::now();
                self.save_explorer(&explorer).await
            }
            other => Err(no_status(other)),
        }
    }
}

fn no_status(kind: RecordKind) -> LabError {
    LabError::new(
        ErrorCode::InvalidInput,
        format!("{} records do not carry a status", kind),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_allowed() {
        let mut track = StatusTrack::default();
        track.transition(RecordStatus::Delivered).unwrap();
        track.transition(RecordStatus::Started).unwrap();
        track.transition(RecordStatus::Finished).unwrap();

        assert_eq!(track.status, RecordStatus::Finished);
        assert!(track.delivery_time.is_some());
        assert!(track.start_time.is_some());
        assert!(track.end_time.is_some());
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [RecordStatus::Finished, RecordStatus::Error] {
            for next in [
                RecordStatus::NotStarted,
                RecordStatus::Delivered,
                RecordStatus::Started,
                RecordStatus::Finished,
                RecordStatus::Error,
            ] {
                assert!(!terminal.can_transition_to(next), "{} -> {}", terminal, next);
            }
        }
    }

    #[test]
    fn test_no_regression_to_delivered() {
        assert!(!RecordStatus::Started.can_transition_to(RecordStatus::Delivered));
        assert!(!RecordStatus::Started.can_transition_to(RecordStatus::Started));
        assert!(RecordStatus::Delivered.can_transition_to(RecordStatus::Delivered));
    }

    #[test]
    fn test_error_reachable_from_non_terminal() {
        for from in [
            RecordStatus::NotStarted,
            RecordStatus::Delivered,
            RecordStatus::Started,
        ] {
            assert!(from.can_transition_to(RecordStatus::Error));
        }
    }

    #[test]
    fn test_invalid_transition_error_code() {
        let mut track = StatusTrack {
            status: RecordStatus::Finished,
            ..StatusTrack::default()
        };
        let err = track.transition(RecordStatus::Started).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStatusTransition);
        assert_eq!(track.status, RecordStatus::Finished);
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            RecordStatus::NotStarted,
            RecordStatus::Delivered,
            RecordStatus::Started,
            RecordStatus::Finished,
            RecordStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<RecordStatus>().unwrap(), status);
        }
        assert!("RUNNING".parse::<RecordStatus>().is_err());
    }
}
