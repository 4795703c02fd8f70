//! Batch prediction with the model of a finished run.

use async_trait::async_trait;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::{payload_id, Job, JobContext, JobError, JobKind, JobPayload, JobStage, StageExt};
use crate::components::{ComponentRegistry, RegistryError};
use crate::dataset::{self, Column, DatasetMetadata, Splits};
use crate::error::ErrorCode;
use crate::store::{NewDataset, RecordId, RecordRef, RecordStatus, Run};

/// Name of the column holding model output in prediction datasets.
pub const PREDICTION_COLUMN: &str = "prediction";

#[derive(Debug)]
pub struct PredictJob {
    payload: JobPayload,
    run_id: RecordId,
    dataset_id: RecordId,
}

impl PredictJob {
    pub fn from_payload(payload: JobPayload) -> Result<Self, JobError> {
        let run_id = payload_id(&payload, "run_id")?;
        let dataset_id = payload_id(&payload, "dataset_id")?;
        Ok(Self {
            payload,
            run_id,
            dataset_id,
        })
    }

    async fn load_finished_run(&self, ctx: &JobContext, stage: JobStage) -> Result<Run, JobError> {
        let run_ref = RecordRef::run(self.run_id);
        let run = ctx
            .store
            .get_run(self.run_id)
            .await
            .stage(stage, "Error while loading the run info")?
            .ok_or_else(|| JobError::missing(stage, run_ref))?;
        if run.track.status != RecordStatus::Finished {
            return Err(JobError::new(
                stage,
                format!("Run {} is {}, predictions need a FINISHED run", run.id, run.track.status),
            )
            .with_code(ErrorCode::RecordNotReady));
        }
        Ok(run)
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let run = self.load_finished_run(ctx, JobStage::LoadRecord).await?;
        let experiment = ctx
            .store
            .get_experiment(run.experiment_id)
            .await
            .stage(JobStage::LoadRecord, "Error while loading the experiment info")?
            .ok_or_else(|| {
                JobError::missing(JobStage::LoadRecord, RecordRef::experiment(run.experiment_id))
            })?;
        let dataset = ctx
            .store
            .get_dataset(self.dataset_id)
            .await
            .stage(JobStage::LoadRecord, "Error while loading the dataset info")?
            .ok_or_else(|| {
                JobError::missing(JobStage::LoadRecord, RecordRef::dataset(self.dataset_id))
            })?;

        let name = format!("{}_pred", dataset.name);
        let existing = ctx
            .store
            .find_dataset_by_name(&name)
            .await
            .stage(JobStage::LoadRecord, "Error while looking up the prediction dataset")?;
        if let Some(existing) = existing {
            info!(dataset_id = existing.id, name = %name, "Prediction dataset already exists");
            return Ok(());
        }

        let model_path = run.run_path.clone().ok_or_else(|| {
            JobError::new(JobStage::LoadRecord, format!("Run {} has no stored model", run.id))
        })?;
        let registry = Arc::clone(&ctx.registry);
        let output = ctx.storage.datasets_path.join(&name);
        let source = dataset.file_path.clone();
        let model_name = run.model_name.clone();
        let inputs = experiment.input_columns.clone();
        let target = output.clone();
        tokio::task::spawn_blocking(move || {
            predict_dataset(&registry, &model_name, &model_path, &source, &inputs, &target)
        })
        .await
        .stage(JobStage::Execute, "Prediction task was aborted")??;

        let record = ctx
            .store
            .insert_dataset(NewDataset {
                name: name.clone(),
                file_path: output.clone(),
            })
            .await;
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&output) {
                    warn!(path = %output.display(), error = %cleanup, "Could not remove prediction output");
                }
                return Err(JobError::new(JobStage::Persist, "Error while storing the prediction dataset")
                    .with_source(e));
            }
        };

        info!(
            run_id = run.id,
            dataset_id = record.id,
            name = %record.name,
            "Predictions stored"
        );
        Ok(())
    }
}

/// Predict over the train split of `source` and write `<inputs> + prediction`
/// as a new dataset at `target`. Test and validation are empty.
pub fn predict_dataset(
    registry: &ComponentRegistry,
    model_name: &str,
    model_path: &Path,
    source: &Path,
    input_columns: &[String],
    target: &Path,
) -> Result<(), JobError> {
    let model = registry.load_model(model_name, model_path).map_err(|e| {
        let code = e
            .downcast_ref::<RegistryError>()
            .map_or(ErrorCode::JobFailed, RegistryError::code);
        JobError::new(
            JobStage::ResolveComponent,
            format!("Can not load model {} from {}", model_name, model_path.display()),
        )
        .with_code(code)
        .with_source(e)
    })?;
    let splits = dataset::load_dataset(source).stage_with(JobStage::LoadDataset, || {
        format!("Can not load dataset from path {}", source.display())
    })?;
    let mut x = splits
        .train
        .select(input_columns)
        .stage(JobStage::PrepareData, "Input columns are missing from the dataset")?;

    let predictions = model
        .predict(&x)
        .stage(JobStage::Predict, "Model prediction failed")?;
    x.push_column(Column::new(PREDICTION_COLUMN, predictions))
        .stage(JobStage::Predict, "Prediction count does not match the input rows")?;

    let output = Splits {
        test: x.empty_like(),
        validation: x.empty_like(),
        train: x,
    };
    dataset::save_dataset(target, &output)
        .stage(JobStage::SaveArtifacts, "Error while saving the prediction dataset")?;
    let metadata = DatasetMetadata {
        split_indices: None,
        columns: output.train.column_names(),
    };
    dataset::write_metadata(target, &metadata)
        .stage(JobStage::SaveArtifacts, "Error while saving prediction metadata")
}

#[async_trait]
impl Job for PredictJob {
    fn kind(&self) -> JobKind {
        JobKind::Predict
    }

    fn payload(&self) -> &JobPayload {
        &self.payload
    }

    /// Predictions never move the run, which is already terminal.
    fn record(&self) -> Option<RecordRef> {
        None
    }

    async fn mark_delivered(&self, ctx: &JobContext) -> Result<(), JobError> {
        self.load_finished_run(ctx, JobStage::Deliver).await.map(|_| ())
    }

    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        match self.execute(ctx).await {
            Ok(()) => Ok(()),
            Err(e) => Err(ctx.fail(self.kind(), e).await),
        }
    }
}
