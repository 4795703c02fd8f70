//! In-process record store used by tests and local development.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::{
    ConverterList, DatasetRecord, Experiment, Exploration, Explorer, NewDataset, RecordId,
    RecordStore, Run,
};
use crate::error::{ErrorCode, LabError, Result};

#[derive(Default)]
struct Tables {
    runs: BTreeMap<RecordId, Run>,
    experiments: BTreeMap<RecordId, Experiment>,
    datasets: BTreeMap<RecordId, DatasetRecord>,
    converter_lists: BTreeMap<RecordId, ConverterList>,
    explorers: BTreeMap<RecordId, Explorer>,
    explorations: BTreeMap<RecordId, Exploration>,
}

/// Record store backed by ordered maps behind one lock.
///
/// `save_*` upserts by id. Every call takes the lock once, which gives the
/// same one-unit-per-call behaviour as a committed database statement.
#[derive(Default)]
pub struct InMemoryRecordStore {
    tables: RwLock<Tables>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of dataset records, for assertions in tests.
    pub fn dataset_count(&self) -> usize {
        self.tables.read().datasets.len()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get_run(&self, id: RecordId) -> Result<Option<Run>> {
        Ok(self.tables.read().runs.get(&id).cloned())
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        self.tables.write().runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_experiment(&self, id: RecordId) -> Result<Option<Experiment>> {
        Ok(self.tables.read().experiments.get(&id).cloned())
    }

    async fn save_experiment(&self, experiment: &Experiment) -> Result<()> {
        self.tables
            .write()
            .experiments
            .insert(experiment.id, experiment.clone());
        Ok(())
    }

    async fn get_dataset(&self, id: RecordId) -> Result<Option<DatasetRecord>> {
        Ok(self.tables.read().datasets.get(&id).cloned())
    }

    async fn save_dataset(&self, dataset: &DatasetRecord) -> Result<()> {
        let mut tables = self.tables.write();
        let clash = tables
            .datasets
            .values()
            .any(|d| d.name == dataset.name && d.id != dataset.id);
        if clash {
            return Err(duplicate_name(&dataset.name));
        }
        tables.datasets.insert(dataset.id, dataset.clone());
        Ok(())
    }

    async fn insert_dataset(&self, dataset: NewDataset) -> Result<DatasetRecord> {
        let mut tables = self.tables.write();
        if tables.datasets.values().any(|d| d.name == dataset.name) {
            return Err(duplicate_name(&dataset.name));
        }
        let id = tables.datasets.keys().next_back().copied().unwrap_or(0) + 1;
        let now = Utc::now();
        let record = DatasetRecord {
            id,
            name: dataset.name,
            file_path: dataset.file_path,
            created: now,
            last_modified: now,
        };
        tables.datasets.insert(id, record.clone());
        Ok(record)
    }

    async fn find_dataset_by_name(&self, name: &str) -> Result<Option<DatasetRecord>> {
        Ok(self
            .tables
            .read()
            .datasets
            .values()
            .find(|d| d.name == name)
            .cloned())
    }

    async fn touch_dataset(&self, id: RecordId) -> Result<()> {
        let mut tables = self.tables.write();
        let dataset = tables
            .datasets
            .get_mut(&id)
            .ok_or_else(|| LabError::not_found("dataset", id.to_string()))?;
        dataset.last_modified = Utc::now();
        Ok(())
    }

    async fn get_converter_list(&self, id: RecordId) -> Result<Option<ConverterList>> {
        Ok(self.tables.read().converter_lists.get(&id).cloned())
    }

    async fn save_converter_list(&self, list: &ConverterList) -> Result<()> {
        self.tables
            .write()
            .converter_lists
            .insert(list.id, list.clone());
        Ok(())
    }

    async fn get_explorer(&self, id: RecordId) -> Result<Option<Explorer>> {
        Ok(self.tables.read().explorers.get(&id).cloned())
    }

    async fn save_explorer(&self, explorer: &Explorer) -> Result<()> {
        self.tables
            .write()
            .explorers
            .insert(explorer.id, explorer.clone());
        Ok(())
    }

    async fn get_exploration(&self, id: RecordId) -> Result<Option<Exploration>> {
        Ok(self.tables.read().explorations.get(&id).cloned())
    }

    async fn save_exploration(&self, exploration: &Exploration) -> Result<()> {
        self.tables
            .write()
            .explorations
            .insert(exploration.id, exploration.clone());
        Ok(())
    }
}

fn duplicate_name(name: &str) -> LabError {
    LabError::new(
        ErrorCode::DuplicateRecord,
        format!("A dataset named {:?} already exists", name),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RecordRef, RecordStatus, StatusTrack};
    use std::path::PathBuf;

    fn run(id: RecordId) -> Run {
        let now = Utc::now();
        Run {
            id,
            experiment_id: 1,
            name: "run".to_string(),
            model_name: "DummyClassifier".to_string(),
            parameters: Default::default(),
            optimizer_name: None,
            optimizer_parameters: Default::default(),
            goal_metric: None,
            train_metrics: None,
            validation_metrics: None,
            test_metrics: None,
            run_path: None,
            trials_path: None,
            track: StatusTrack::default(),
            created: now,
            last_modified: now,
        }
    }

    #[tokio::test]
    async fn test_set_status_persists_transition() {
        let store = InMemoryRecordStore::new();
        store.save_run(&run(3)).await.unwrap();

        store
            .set_status(RecordRef::run(3), RecordStatus::Delivered)
            .await
            .unwrap();

        let status = store.status_of(RecordRef::run(3)).await.unwrap();
        assert_eq!(status, Some(RecordStatus::Delivered));
    }

    #[tokio::test]
    async fn test_set_status_rejects_regression() {
        let store = InMemoryRecordStore::new();
        let mut finished = run(4);
        finished.track.status = RecordStatus::Finished;
        store.save_run(&finished).await.unwrap();

        let err = store
            .set_status(RecordRef::run(4), RecordStatus::Delivered)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStatusTransition);
    }

    #[tokio::test]
    async fn test_set_status_missing_record() {
        let store = InMemoryRecordStore::new();
        let err = store
            .set_status(RecordRef::run(99), RecordStatus::Delivered)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RecordNotFound);
    }

    #[tokio::test]
    async fn test_insert_dataset_assigns_ids_and_rejects_duplicates() {
        let store = InMemoryRecordStore::new();
        let first = store
            .insert_dataset(NewDataset {
                name: "iris".to_string(),
                file_path: PathBuf::from("/tmp/iris"),
            })
            .await
            .unwrap();
        let second = store
            .insert_dataset(NewDataset {
                name: "wine".to_string(),
                file_path: PathBuf::from("/tmp/wine"),
            })
            .await
            .unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);

        let dup = store
            .insert_dataset(NewDataset {
                name: "iris".to_string(),
                file_path: PathBuf::from("/tmp/other"),
            })
            .await
            .unwrap_err();
        assert_eq!(dup.code(), ErrorCode::DuplicateRecord);

        let found = store.find_dataset_by_name("wine").await.unwrap().unwrap();
        assert_eq!(found.id, 2);
    }

    #[tokio::test]
    async fn test_datasets_have_no_status() {
        let store = InMemoryRecordStore::new();
        let err = store
            .status_of(RecordRef::dataset(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }
}
