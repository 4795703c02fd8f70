//! Applies a converter list to a stored dataset and writes it back in place.

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::job::read_split_metadata;
use super::pipeline::{apply_plan, build_plan};
use super::{payload_id, Job, JobContext, JobError, JobKind, JobPayload, JobStage, StageExt};
use crate::components::ComponentRegistry;
use crate::dataset::{self, DatasetSplits};
use crate::store::{RecordId, RecordRef, RecordStatus};

#[derive(Debug)]
pub struct ConverterListJob {
    payload: JobPayload,
    converter_list_id: RecordId,
    /// 1-based position of the target column in the original dataset.
    target_column_index: i64,
}

impl ConverterListJob {
    pub fn from_payload(payload: JobPayload) -> Result<Self, JobError> {
        let converter_list_id = payload_id(&payload, "converter_list_id")?;
        let target_column_index = payload_id(&payload, "target_column_index")?;
        Ok(Self {
            payload,
            converter_list_id,
            target_column_index,
        })
    }

    fn list_ref(&self) -> RecordRef {
        RecordRef::converter_list(self.converter_list_id)
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let list_ref = self.list_ref();
        let list = ctx
            .store
            .get_converter_list(self.converter_list_id)
            .await
            .stage(JobStage::LoadRecord, "Error while loading the converter list info")?
            .ok_or_else(|| JobError::missing(JobStage::LoadRecord, list_ref))?;
        ctx.set_status(list_ref, RecordStatus::Started, JobStage::LoadRecord)
            .await?;

        let dataset_ref = RecordRef::dataset(list.dataset_id);
        let dataset = ctx
            .store
            .get_dataset(list.dataset_id)
            .await
            .stage(JobStage::LoadRecord, "Error while loading the dataset info")?
            .ok_or_else(|| JobError::missing(JobStage::LoadRecord, dataset_ref))?;

        let registry = Arc::clone(&ctx.registry);
        let root = dataset.file_path.clone();
        let spec = list.converters.clone();
        let target_index = self.target_column_index;
        let dataset_id = dataset.id;
        tokio::task::spawn_blocking(move || {
            convert_dataset(&registry, &root, &spec, target_index).map_err(|e| {
                e.prefixed(format!(
                    "Error while applying converters to dataset with id {}",
                    dataset_id
                ))
            })
        })
        .await
        .stage(JobStage::Execute, "Converter task was aborted")??;

        ctx.set_status(list_ref, RecordStatus::Finished, JobStage::Persist)
            .await?;
        if let Err(e) = ctx.store.touch_dataset(dataset_id).await {
            warn!(dataset_id, error = %e, "Could not refresh dataset record");
        }
        info!(
            converter_list_id = self.converter_list_id,
            dataset_id, "Converters applied"
        );
        Ok(())
    }
}

/// Load, convert and save a dataset. Nothing is written unless every
/// converter succeeded.
pub fn convert_dataset(
    registry: &ComponentRegistry,
    root: &Path,
    spec: &Value,
    target_column_index: i64,
) -> Result<(), JobError> {
    let splits = dataset::load_dataset(root).stage_with(JobStage::LoadDataset, || {
        format!("Can not load dataset from path {}", root.display())
    })?;
    let mut metadata = read_split_metadata(root)?;
    let (mut table, boundaries) = splits
        .concat()
        .stage(JobStage::LoadDataset, "Dataset splits have different columns")?;
    if table.n_cols() == 0 || table.n_rows() == 0 {
        return Err(JobError::new(
            JobStage::LoadDataset,
            format!("Dataset at {} has no rows or no columns", root.display()),
        ));
    }

    let original_columns = table.column_names();
    if target_column_index < 1 || target_column_index as u64 > original_columns.len() as u64 {
        return Err(JobError::new(
            JobStage::ValidateTarget,
            format!(
                "Target column index {} is out of bounds [1, {}]",
                target_column_index,
                original_columns.len()
            ),
        ));
    }
    let target = original_columns[target_column_index as usize - 1].clone();

    let mut plan = build_plan(registry, spec, original_columns.len(), table.n_rows())?;
    apply_plan(&mut table, &original_columns, &target, &mut plan)?;

    let converted = DatasetSplits::resplit(&table, &boundaries)
        .stage(JobStage::SaveArtifacts, "Converted dataset lost rows")?;
    dataset::save_dataset(root, &converted)
        .stage(JobStage::SaveArtifacts, "Error while saving the converted dataset")?;

    // Keep recorded split indices, refresh the column list.
    metadata.columns = table.column_names();
    dataset::write_metadata(root, &metadata)
        .stage(JobStage::SaveArtifacts, "Error while updating dataset metadata")
}

#[async_trait]
impl Job for ConverterListJob {
    fn kind(&self) -> JobKind {
        JobKind::ConverterList
    }

    fn payload(&self) -> &JobPayload {
        &self.payload
    }

    fn record(&self) -> Option<RecordRef> {
        Some(self.list_ref())
    }

    async fn mark_delivered(&self, ctx: &JobContext) -> Result<(), JobError> {
        let list_ref = self.list_ref();
        ctx.store
            .get_converter_list(self.converter_list_id)
            .await
            .stage(JobStage::Deliver, "Error while loading the converter list info")?
            .ok_or_else(|| JobError::missing(JobStage::Deliver, list_ref))?;
        ctx.set_status(list_ref, RecordStatus::Delivered, JobStage::Deliver)
            .await
    }

    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        match self.execute(ctx).await {
            Ok(()) => Ok(()),
            Err(e) => Err(ctx.fail(self.kind(), e.with_record(self.list_ref())).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Cell, Column, DatasetMetadata, Frame, Splits};
    use crate::error::ErrorCode;
    use serde_json::json;

    fn write_dataset(root: &Path) -> DatasetSplits {
        let frame = |start: i64, n: i64| {
            Frame::new(vec![
                Column::new("x", (start..start + n).map(|i| Cell::Float(i as f64)).collect()),
                Column::new("label", (start..start + n).map(|i| Cell::Int(i % 2)).collect()),
            ])
            .unwrap()
        };
        let splits = Splits {
            train: frame(0, 6),
            test: frame(6, 2),
            validation: frame(8, 2),
        };
        dataset::save_dataset(root, &splits).unwrap();
        let metadata = DatasetMetadata {
            split_indices: None,
            columns: vec!["x".into(), "label".into()],
        };
        dataset::write_metadata(root, &metadata).unwrap();
        splits
    }

    #[test]
    fn test_payload_requires_both_fields() {
        let missing = json!({"converter_list_id": 1});
        assert!(ConverterListJob::from_payload(missing.as_object().unwrap().clone()).is_err());
        let ok = json!({"converter_list_id": 1, "target_column_index": 2});
        let job = ConverterListJob::from_payload(ok.as_object().unwrap().clone()).unwrap();
        assert_eq!(job.record(), Some(RecordRef::converter_list(1)));
    }

    #[test]
    fn test_convert_dataset_keeps_split_sizes() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());
        let registry = ComponentRegistry::with_defaults();
        let spec = json!({"MinMaxScaler": {"order": 1, "scope": {"columns": [1]}}});

        convert_dataset(&registry, dir.path(), &spec, 2).unwrap();

        let converted = dataset::load_dataset(dir.path()).unwrap();
        assert_eq!(converted.train.n_rows(), 6);
        assert_eq!(converted.test.n_rows(), 2);
        assert_eq!(converted.validation.n_rows(), 2);
        let last = converted.validation.column("x").unwrap().to_f64().unwrap();
        assert_eq!(last[1], 1.0);
    }

    #[test]
    fn test_bad_target_leaves_files_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let before = write_dataset(dir.path());
        let registry = ComponentRegistry::with_defaults();
        let spec = json!({"MinMaxScaler": {"order": 1}});

        for index in [0, 3] {
            let err = convert_dataset(&registry, dir.path(), &spec, index).unwrap_err();
            assert_eq!(err.stage(), JobStage::ValidateTarget);
        }
        assert_eq!(dataset::load_dataset(dir.path()).unwrap(), before);
    }

    #[test]
    fn test_missing_metadata_fails_before_converting() {
        let dir = tempfile::tempdir().unwrap();
        let before = write_dataset(dir.path());
        std::fs::remove_file(dir.path().join("dataset").join("metadata.json")).unwrap();
        let registry = ComponentRegistry::with_defaults();
        let spec = json!({"MinMaxScaler": {"order": 1, "scope": {"columns": [1]}}});

        let err = convert_dataset(&registry, dir.path(), &spec, 2).unwrap_err();
        assert_eq!(err.stage(), JobStage::LoadDataset);
        assert_eq!(err.code(), ErrorCode::SplitMetadataMissing);
        assert_eq!(dataset::load_dataset(dir.path()).unwrap(), before);
    }
}
