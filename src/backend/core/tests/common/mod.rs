//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use labkit_core::components::ComponentRegistry;
use labkit_core::config::{QueueConfig, StorageConfig};
use labkit_core::dataset::{self, Cell, Column, DatasetMetadata, DatasetSplits, Frame, Splits};
use labkit_core::error::{ErrorCode, LabError, Result};
use labkit_core::jobs::{JobContext, JobPayload, JobService};
use labkit_core::store::{
    ConverterList, DatasetRecord, Experiment, Exploration, Explorer, InMemoryRecordStore,
    NewDataset, RecordId, RecordRef, RecordStatus, RecordStore, Run, SplitFractions, StatusTrack,
};

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<InMemoryRecordStore>,
    /// The store jobs see; wraps `store` and fails on request.
    pub faults: Arc<FaultyStore>,
    pub storage: StorageConfig,
    pub service: Arc<JobService>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_registry(ComponentRegistry::with_defaults())
    }

    pub fn with_registry(registry: ComponentRegistry) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig::under(dir.path());
        storage.ensure_dirs().unwrap();
        let store = Arc::new(InMemoryRecordStore::new());
        let faults = Arc::new(FaultyStore::new(Arc::clone(&store)));
        let ctx = JobContext::new(
            faults.clone() as Arc<dyn RecordStore>,
            Arc::new(registry),
            storage.clone(),
        );
        let queue = QueueConfig {
            autostart: false,
            stop_when_empty: false,
            poll_interval: Duration::from_millis(10),
        };
        let service = Arc::new(JobService::new(ctx, &queue));
        Self {
            dir,
            store,
            faults,
            storage,
            service,
        }
    }

    /// Write `splits` under the datasets root and register the dataset.
    pub async fn add_dataset(&self, name: &str, splits: &DatasetSplits) -> DatasetRecord {
        let root = self.storage.datasets_path.join(name);
        dataset::save_dataset(&root, splits).unwrap();
        let (table, boundaries) = splits.concat().unwrap();
        let train_end = boundaries.train;
        let test_end = train_end + boundaries.test;
        let metadata = DatasetMetadata {
            split_indices: Some(Splits {
                train: (0..train_end).collect(),
                test: (train_end..test_end).collect(),
                validation: (test_end..table.n_rows()).collect(),
            }),
            columns: table.column_names(),
        };
        dataset::write_metadata(&root, &metadata).unwrap();
        self.store
            .insert_dataset(NewDataset {
                name: name.to_string(),
                file_path: root,
            })
            .await
            .unwrap()
    }

    pub async fn add_converter_list(
        &self,
        id: RecordId,
        dataset_id: RecordId,
        converters: Value,
    ) -> RecordRef {
        let now = Utc::now();
        self.store
            .save_converter_list(&ConverterList {
                id,
                dataset_id,
                converters,
                track: StatusTrack::default(),
                created: now,
                last_modified: now,
            })
            .await
            .unwrap();
        RecordRef::converter_list(id)
    }

    pub async fn add_experiment(&self, id: RecordId, dataset_id: RecordId, task: &str, inputs: &[&str], output: &str) {
        self.store
            .save_experiment(&Experiment {
                id,
                dataset_id,
                task_name: task.to_string(),
                input_columns: inputs.iter().map(|s| s.to_string()).collect(),
                output_columns: vec![output.to_string()],
                splits: SplitFractions::default(),
                seed: Some(1),
                created: Utc::now(),
            })
            .await
            .unwrap();
    }

    pub async fn add_run(&self, id: RecordId, experiment_id: RecordId, model: &str, parameters: Value) -> RecordRef {
        let now = Utc::now();
        self.store
            .save_run(&Run {
                id,
                experiment_id,
                name: format!("run-{}", id),
                model_name: model.to_string(),
                parameters: parameters.as_object().cloned().unwrap_or_default(),
                optimizer_name: None,
                optimizer_parameters: Map::new(),
                goal_metric: None,
                train_metrics: None,
                validation_metrics: None,
                test_metrics: None,
                run_path: None,
                trials_path: None,
                track: StatusTrack::default(),
                created: now,
                last_modified: now,
            })
            .await
            .unwrap();
        RecordRef::run(id)
    }

    pub async fn status(&self, record: RecordRef) -> RecordStatus {
        self.store.status_of(record).await.unwrap().unwrap()
    }

    pub fn dataset_root(&self, name: &str) -> PathBuf {
        self.storage.datasets_path.join(name)
    }

    /// Run every queued job to completion.
    pub async fn drain(&self) {
        assert!(self.service.start_loop(true));
        tokio::time::timeout(Duration::from_secs(30), self.service.wait_idle())
            .await
            .unwrap();
    }
}

/// Record store that delegates to an in-memory store and fails on request.
pub struct FaultyStore {
    inner: Arc<InMemoryRecordStore>,
    dataset_read_failures: AtomicUsize,
    reject_finished_runs: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<InMemoryRecordStore>) -> Self {
        Self {
            inner,
            dataset_read_failures: AtomicUsize::new(0),
            reject_finished_runs: AtomicBool::new(false),
        }
    }

    /// Fail the next `n` dataset lookups.
    pub fn fail_dataset_reads(&self, n: usize) {
        self.dataset_read_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every save of a run whose status is FINISHED.
    pub fn reject_finished_runs(&self, reject: bool) {
        self.reject_finished_runs.store(reject, Ordering::SeqCst);
    }

    fn outage(what: &str) -> LabError {
        LabError::new(ErrorCode::DatabaseQueryFailed, format!("{} failed: connection reset", what))
    }
}

#[async_trait]
impl RecordStore for FaultyStore {
    async fn get_run(&self, id: RecordId) -> Result<Option<Run>> {
        self.inner.get_run(id).await
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        if run.track.status == RecordStatus::Finished
            && self.reject_finished_runs.load(Ordering::SeqCst)
        {
            return Err(Self::outage("save_run"));
        }
        self.inner.save_run(run).await
    }

    async fn get_experiment(&self, id: RecordId) -> Result<Option<Experiment>> {
        self.inner.get_experiment(id).await
    }

    async fn save_experiment(&self, experiment: &Experiment) -> Result<()> {
        self.inner.save_experiment(experiment).await
    }

    async fn get_dataset(&self, id: RecordId) -> Result<Option<DatasetRecord>> {
        let pending = self
            .dataset_read_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(Self::outage("get_dataset"));
        }
        self.inner.get_dataset(id).await
    }

    async fn save_dataset(&self, dataset: &DatasetRecord) -> Result<()> {
        self.inner.save_dataset(dataset).await
    }

    async fn insert_dataset(&self, dataset: NewDataset) -> Result<DatasetRecord> {
        self.inner.insert_dataset(dataset).await
    }

    async fn find_dataset_by_name(&self, name: &str) -> Result<Option<DatasetRecord>> {
        self.inner.find_dataset_by_name(name).await
    }

    async fn touch_dataset(&self, id: RecordId) -> Result<()> {
        self.inner.touch_dataset(id).await
    }

    async fn get_converter_list(&self, id: RecordId) -> Result<Option<ConverterList>> {
        self.inner.get_converter_list(id).await
    }

    async fn save_converter_list(&self, list: &ConverterList) -> Result<()> {
        self.inner.save_converter_list(list).await
    }

    async fn get_explorer(&self, id: RecordId) -> Result<Option<Explorer>> {
        self.inner.get_explorer(id).await
    }

    async fn save_explorer(&self, explorer: &Explorer) -> Result<()> {
        self.inner.save_explorer(explorer).await
    }

    async fn get_exploration(&self, id: RecordId) -> Result<Option<Exploration>> {
        self.inner.get_exploration(id).await
    }

    async fn save_exploration(&self, exploration: &Exploration) -> Result<()> {
        self.inner.save_exploration(exploration).await
    }
}

pub fn payload(value: Value) -> JobPayload {
    value.as_object().cloned().unwrap()
}

/// `rows` x `cols` float table with columns `c1..c<cols>`; cell value is
/// `offset + row * cols + col`.
pub fn numeric_frame(rows: usize, cols: usize, offset: usize) -> Frame {
    Frame::new(
        (0..cols)
            .map(|col| {
                Column::new(
                    format!("c{}", col + 1),
                    (0..rows)
                        .map(|row| Cell::Float(((offset + row) * cols + col) as f64))
                        .collect(),
                )
            })
            .collect(),
    )
    .unwrap()
}

/// Numeric splits of `train`/`test`/`validation` rows.
pub fn numeric_splits(train: usize, test: usize, validation: usize, cols: usize) -> DatasetSplits {
    Splits {
        train: numeric_frame(train, cols, 0),
        test: numeric_frame(test, cols, train),
        validation: numeric_frame(validation, cols, train + test),
    }
}

/// Two numeric features and a three-class `species` label.
pub fn classification_splits() -> DatasetSplits {
    let frame = |start: usize, n: usize| {
        let rows = start..start + n;
        Frame::new(vec![
            Column::new("a", rows.clone().map(|i| Cell::Float((i % 3) as f64 * 10.0)).collect()),
            Column::new("b", rows.clone().map(|i| Cell::Float(i as f64 * 0.01)).collect()),
            Column::new(
                "species",
                rows.map(|i| Cell::from(["setosa", "versicolor", "virginica"][i % 3])).collect(),
            ),
        ])
        .unwrap()
    };
    Splits {
        train: frame(0, 18),
        test: frame(18, 6),
        validation: frame(24, 6),
    }
}
