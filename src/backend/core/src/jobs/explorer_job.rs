//! Runs one explorer of an exploration and stores its result.

use async_trait::async_trait;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{payload_id, Job, JobContext, JobError, JobKind, JobPayload, JobStage, ResolveExt, StageExt};
use crate::components::Explorer as ExplorerComponent;
use crate::dataset;
use crate::store::{RecordId, RecordRef, RecordStatus};

#[derive(Debug)]
pub struct ExplorerJob {
    payload: JobPayload,
    explorer_id: RecordId,
}

impl ExplorerJob {
    pub fn from_payload(payload: JobPayload) -> Result<Self, JobError> {
        let explorer_id = payload_id(&payload, "explorer_id")?;
        Ok(Self {
            payload,
            explorer_id,
        })
    }

    fn explorer_ref(&self) -> RecordRef {
        RecordRef::explorer(self.explorer_id)
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let explorer_ref = self.explorer_ref();
        let explorer = ctx
            .store
            .get_explorer(self.explorer_id)
            .await
            .stage(JobStage::LoadRecord, "Error while loading the explorer info")?
            .ok_or_else(|| JobError::missing(JobStage::LoadRecord, explorer_ref))?;
        ctx.set_status(explorer_ref, RecordStatus::Started, JobStage::LoadRecord)
            .await?;

        let exploration = ctx
            .store
            .get_exploration(explorer.exploration_id)
            .await
            .stage(JobStage::LoadRecord, "Error while loading the exploration info")?
            .ok_or_else(|| {
                JobError::missing(
                    JobStage::LoadRecord,
                    RecordRef::exploration(explorer.exploration_id),
                )
            })?;
        let dataset = ctx
            .store
            .get_dataset(exploration.dataset_id)
            .await
            .stage(JobStage::LoadRecord, "Error while loading the dataset info")?
            .ok_or_else(|| {
                JobError::missing(JobStage::LoadRecord, RecordRef::dataset(exploration.dataset_id))
            })?;

        let component = ctx
            .registry
            .explorer(&explorer.exploration_type, &explorer.parameters)
            .resolve_with(|| {
                format!(
                    "Unable to instantiate explorer {} from registry",
                    explorer.exploration_type
                )
            })?;

        let save_dir = ctx.storage.explorations_path.join(format!(
            "{}_{}",
            exploration.id,
            sanitize(&exploration.name)
        ));
        let columns = explorer.columns.clone();
        let root = dataset.file_path.clone();
        let explorer_id = explorer.id;
        let path = tokio::task::spawn_blocking(move || {
            explore(component.as_ref(), &root, &columns, &save_dir, explorer_id)
        })
        .await
        .stage(JobStage::Execute, "Exploration task was aborted")??;

        let mut explorer = ctx
            .store
            .get_explorer(self.explorer_id)
            .await
            .stage(JobStage::Persist, "Error while reloading the explorer")?
            .ok_or_else(|| JobError::missing(JobStage::Persist, explorer_ref))?;
        explorer.exploration_path = Some(path);
        explorer
            .track
            .transition(RecordStatus::Finished)
            .stage(JobStage::Persist, "Error while finishing the explorer")?;
        explorer.last_modified = Utc::now();
        ctx.store
            .save_explorer(&explorer)
            .await
            .stage(JobStage::Persist, "Error while storing the exploration result")?;

        info!(
            explorer_id = explorer.id,
            exploration_id = exploration.id,
            "Exploration finished"
        );
        Ok(())
    }
}

/// Prepare, launch and save one exploration; returns the written result path.
pub fn explore(
    explorer: &dyn ExplorerComponent,
    dataset_root: &Path,
    columns: &[String],
    save_dir: &Path,
    explorer_id: RecordId,
) -> Result<PathBuf, JobError> {
    let splits = dataset::load_dataset(dataset_root).stage_with(JobStage::LoadDataset, || {
        format!("Can not load dataset from path {}", dataset_root.display())
    })?;
    let prepared = explorer
        .prepare_dataset(&splits, columns)
        .stage(JobStage::PrepareData, "Error while preparing the dataset for exploration")?;
    let result = explorer
        .launch_exploration(&prepared)
        .stage(JobStage::Explore, "Error while launching the exploration")?;
    fs::create_dir_all(save_dir).stage_with(JobStage::SaveArtifacts, || {
        format!("Can not create exploration directory {}", save_dir.display())
    })?;
    explorer
        .save_exploration(&result, save_dir, explorer_id)
        .stage(JobStage::SaveArtifacts, "Error while saving the exploration result")
}

/// Directory-safe form of a user supplied name.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl Job for ExplorerJob {
    fn kind(&self) -> JobKind {
        JobKind::Explorer
    }

    fn payload(&self) -> &JobPayload {
        &self.payload
    }

    fn record(&self) -> Option<RecordRef> {
        Some(self.explorer_ref())
    }

    async fn mark_delivered(&self, ctx: &JobContext) -> Result<(), JobError> {
        let explorer_ref = self.explorer_ref();
        ctx.store
            .get_explorer(self.explorer_id)
            .await
            .stage(JobStage::Deliver, "Error while loading the explorer info")?
            .ok_or_else(|| JobError::missing(JobStage::Deliver, explorer_ref))?;
        ctx.set_status(explorer_ref, RecordStatus::Delivered, JobStage::Deliver)
            .await
    }

    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        match self.execute(ctx).await {
            Ok(()) => Ok(()),
            Err(e) => Err(ctx.fail(self.kind(), e.with_record(self.explorer_ref())).await),
        }
    }
}
