//! Creates a dataset from raw data: load, partition, save, register.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::{Job, JobContext, JobError, JobKind, JobPayload, JobStage, ResolveExt, StageExt};
use crate::components::{ComponentRegistry, DataSource, Params};
use crate::dataset::{self, split_indexes, DatasetMetadata, DatasetSplits};
use crate::error::ErrorCode;
use crate::store::{NewDataset, RecordRef, SplitFractions};

/// Arguments accepted by a dataset job.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetArgs {
    pub name: String,
    /// Registry name of the data loader.
    pub dataloader: String,
    pub source: DataSource,
    #[serde(default)]
    pub splits: SplitFractions,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Loader parameters.
    #[serde(default)]
    pub params: Params,
}

#[derive(Debug)]
pub struct DatasetJob {
    payload: JobPayload,
    args: DatasetArgs,
}

impl DatasetJob {
    pub fn from_payload(payload: JobPayload) -> Result<Self, JobError> {
        let args: DatasetArgs = serde_json::from_value(Value::Object(payload.clone()))
            .map_err(|e| JobError::invalid_payload(format!("Invalid dataset arguments: {}", e)))?;
        let name = args.name.trim();
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(JobError::invalid_payload(format!(
                "Invalid dataset name {:?}",
                args.name
            )));
        }
        Ok(Self { payload, args })
    }

    async fn ensure_name_free(&self, ctx: &JobContext, stage: JobStage) -> Result<(), JobError> {
        let existing = ctx
            .store
            .find_dataset_by_name(&self.args.name)
            .await
            .stage(stage, "Error while looking up the dataset name")?;
        match existing {
            Some(dataset) => Err(JobError::new(
                stage,
                format!("Dataset with name {} already exists", self.args.name),
            )
            .with_record(RecordRef::dataset(dataset.id))
            .with_code(ErrorCode::DatasetAlreadyExists)),
            None => Ok(()),
        }
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        self.ensure_name_free(ctx, JobStage::LoadRecord).await?;
        let root = ctx.storage.datasets_path.join(&self.args.name);
        if root.exists() {
            return Err(JobError::new(
                JobStage::SaveArtifacts,
                format!("Dataset directory {} already exists", root.display()),
            )
            .with_code(ErrorCode::DatasetAlreadyExists));
        }
        fs::create_dir_all(&root).stage_with(JobStage::SaveArtifacts, || {
            format!("Can not create dataset directory {}", root.display())
        })?;

        let registry = Arc::clone(&ctx.registry);
        let args = self.args.clone();
        let target = root.clone();
        let built = tokio::task::spawn_blocking(move || build_dataset(&registry, &args, &target))
            .await
            .stage(JobStage::Execute, "Dataset task was aborted")
            .and_then(|built| built);
        if let Err(e) = built {
            remove_partial(&root);
            return Err(e);
        }

        let record = ctx
            .store
            .insert_dataset(NewDataset {
                name: self.args.name.clone(),
                file_path: root.clone(),
            })
            .await;
        match record {
            Ok(record) => {
                info!(dataset_id = record.id, name = %record.name, "Dataset created");
                Ok(())
            }
            Err(e) => {
                remove_partial(&root);
                Err(JobError::new(JobStage::Persist, "Error while storing the dataset record")
                    .with_source(e))
            }
        }
    }
}

/// Load raw data with the named loader and write the partitioned dataset
/// into `root`.
pub fn build_dataset(
    registry: &ComponentRegistry,
    args: &DatasetArgs,
    root: &Path,
) -> Result<(), JobError> {
    let loader = registry
        .loader(&args.dataloader)
        .resolve_with(|| {
            format!("Unable to find DataLoader with name {} in registry", args.dataloader)
        })?;
    let table = loader
        .load_data(&args.source, &args.params)
        .stage(JobStage::LoadDataset, "Can not load data from the uploaded source")?;
    if table.n_rows() == 0 || table.n_cols() == 0 {
        return Err(JobError::new(JobStage::LoadDataset, "Uploaded data is empty"));
    }

    let fractions = args.splits;
    let indices = split_indexes(
        table.n_rows(),
        fractions.train,
        fractions.test,
        fractions.validation,
        args.seed,
    );
    let splits = DatasetSplits::from_indices(&table, &indices)
        .stage(JobStage::PrepareData, "Can not partition the dataset")?;
    dataset::save_dataset(root, &splits)
        .stage(JobStage::SaveArtifacts, "Error while saving the dataset")?;
    let metadata = DatasetMetadata {
        split_indices: Some(indices),
        columns: table.column_names(),
    };
    dataset::write_metadata(root, &metadata)
        .stage(JobStage::SaveArtifacts, "Error while saving the dataset metadata")
}

fn remove_partial(root: &Path) {
    if let Err(e) = fs::remove_dir_all(root) {
        warn!(path = %root.display(), error = %e, "Could not remove partially created dataset");
    }
}

#[async_trait]
impl Job for DatasetJob {
    fn kind(&self) -> JobKind {
        JobKind::Dataset
    }

    fn payload(&self) -> &JobPayload {
        &self.payload
    }

    /// The dataset record only exists once the job succeeds.
    fn record(&self) -> Option<RecordRef> {
        None
    }

    async fn mark_delivered(&self, ctx: &JobContext) -> Result<(), JobError> {
        self.ensure_name_free(ctx, JobStage::Deliver).await
    }

    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        match self.execute(ctx).await {
            Ok(()) => Ok(()),
            Err(e) => Err(ctx.fail(self.kind(), e).await),
        }
    }
}
