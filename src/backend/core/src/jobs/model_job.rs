//! Trains (and optionally optimizes) the model of a run and scores it on
//! every split.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::job::read_split_metadata;
use super::{payload_id, Job, JobContext, JobError, JobKind, JobPayload, JobStage, ResolveExt, StageExt};
use crate::components::optimizers::ParamRange;
use crate::components::{
    ComponentRegistry, Metric, Model, OptimizationProblem, Params, SearchSpace, Trial,
};
use crate::dataset::{self, split_indexes, Column, DatasetSplits, Frame, SplitName, Splits};
use crate::error::ErrorCode;
use crate::store::{Experiment, RecordId, RecordRef, RecordStatus, Run};

const MODEL_FILE: &str = "model.json";
const TRIALS_FILE: &str = "trials.json";

#[derive(Debug)]
pub struct ModelJob {
    payload: JobPayload,
    run_id: RecordId,
}

/// Artifacts of a finished training, persisted onto the run in one save.
#[derive(Debug)]
pub struct TrainedRun {
    pub metrics: Splits<Value>,
    pub run_path: PathBuf,
    pub trials_path: Option<PathBuf>,
}

impl ModelJob {
    pub fn from_payload(payload: JobPayload) -> Result<Self, JobError> {
        let run_id = payload_id(&payload, "run_id")?;
        Ok(Self { payload, run_id })
    }

    fn run_ref(&self) -> RecordRef {
        RecordRef::run(self.run_id)
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let run_ref = self.run_ref();
        let run = ctx
            .store
            .get_run(self.run_id)
            .await
            .stage(JobStage::LoadRecord, "Error while loading the run info")?
            .ok_or_else(|| JobError::missing(JobStage::LoadRecord, run_ref))?;
        ctx.set_status(run_ref, RecordStatus::Started, JobStage::LoadRecord)
            .await?;

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
            .get_dataset(experiment.dataset_id)
            .await
            .stage(JobStage::LoadRecord, "Error while loading the dataset info")?
            .ok_or_else(|| {
                JobError::missing(JobStage::LoadRecord, RecordRef::dataset(experiment.dataset_id))
            })?;

        let registry = Arc::clone(&ctx.registry);
        let run_dir = ctx.storage.runs_path.join(run.id.to_string());
        let trained = tokio::task::spawn_blocking(move || {
            train(&registry, &run, &experiment, &dataset.file_path, &run_dir)
        })
        .await
        .stage(JobStage::Execute, "Training task was aborted")??;

        // Reload so the STARTED stamp written above is kept.
        let mut run = ctx
            .store
            .get_run(self.run_id)
            .await
            .stage(JobStage::Persist, "Error while reloading the run")?
            .ok_or_else(|| JobError::missing(JobStage::Persist, run_ref))?;
        let Splits {
            train,
            test,
            validation,
        } = trained.metrics;
        run.train_metrics = Some(train);
        run.test_metrics = Some(test);
        run.validation_metrics = Some(validation);
        run.run_path = Some(trained.run_path);
        run.trials_path = trained.trials_path;
        run.track
            .transition(RecordStatus::Finished)
            .stage(JobStage::Persist, "Error while finishing the run")?;
        run.last_modified = Utc::now();
        ctx.store
            .save_run(&run)
            .await
            .stage(JobStage::Persist, "Error while storing the run results")?;

        info!(run_id = run.id, model = %run.model_name, "Run finished");
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Training Pipeline
// ═══════════════════════════════════════════════════════════════════════════════

/// Fit or optimize the run's model, score it and write its artifacts into
/// `run_dir`.
pub fn train(
    registry: &ComponentRegistry,
    run: &Run,
    experiment: &Experiment,
    dataset_root: &Path,
    run_dir: &Path,
) -> Result<TrainedRun, JobError> {
    let splits = load_splits(dataset_root, experiment)?;

    let task = registry
        .task(&experiment.task_name)
        .resolve_with(|| {
            format!("Unable to find Task with name {} in registry", experiment.task_name)
        })?;
    let splits = task
        .prepare_for_task(splits, &experiment.output_columns)
        .stage(JobStage::PrepareData, "Can not prepare dataset for the task")?;

    let x = splits
        .select(&experiment.input_columns)
        .stage(JobStage::PrepareData, "Input columns are missing from the dataset")?;
    let target = experiment.output_columns.first().ok_or_else(|| {
        JobError::new(JobStage::PrepareData, "Experiment has no output columns")
    })?;
    let y = splits.try_map(|split, frame| {
        frame.column(target).cloned().ok_or_else(|| {
            JobError::new(
                JobStage::PrepareData,
                format!("Output column {} is missing from the {} split", target, split),
            )
        })
    })?;

    let metrics = registry.metrics_for_task(&experiment.task_name);
    if metrics.is_empty() {
        return Err(JobError::new(
            JobStage::ResolveComponent,
            format!("No metric is compatible with task {}", experiment.task_name),
        ));
    }

    let (fixed, search_space) = partition_parameters(&run.parameters)?;
    let factory = registry
        .model_factory(&run.model_name)
        .resolve_with(|| {
            format!("Unable to find Model with name {} in registry", run.model_name)
        })?;

    let (model, trials): (Box<dyn Model>, Option<Vec<Trial>>) = if search_space.is_empty() {
        let mut model = factory(&fixed)
            .stage_with(JobStage::ResolveComponent, || {
                format!("Invalid parameters for model {}", run.model_name)
            })
            .map_err(|e| e.with_code(ErrorCode::InvalidComponentParameters))?;
        model
            .fit(&x.train, &y.train)
            .stage(JobStage::Fit, "Model training failed")?;
        (model, None)
    } else {
        let optimizer_name = run.optimizer_name.as_deref().ok_or_else(|| {
            JobError::new(
                JobStage::Optimize,
                "Run has optimizable parameters but no optimizer",
            )
        })?;
        let goal_name = run.goal_metric.as_deref().ok_or_else(|| {
            JobError::new(JobStage::Optimize, "Run has optimizable parameters but no goal metric")
        })?;
        let goal = metrics
            .iter()
            .find(|(name, _)| name == goal_name)
            .map(|(_, metric)| metric.as_ref())
            .ok_or_else(|| {
                JobError::new(
                    JobStage::ResolveComponent,
                    format!(
                        "Goal metric {} is not compatible with task {}",
                        goal_name, experiment.task_name
                    ),
                )
            })?;
        let mut optimizer = registry
            .optimizer(optimizer_name, &run.optimizer_parameters)
            .resolve_with(|| {
                format!("Unable to find Optimizer with name {} in registry", optimizer_name)
            })?;

        debug!(
            run_id = run.id,
            optimizer = optimizer_name,
            params = ?search_space.keys().collect::<Vec<_>>(),
            "Optimizing model"
        );
        let result = optimizer
            .optimize(OptimizationProblem {
                build: &*factory,
                fixed: &fixed,
                search_space: &search_space,
                x: &x,
                y: &y,
                goal,
            })
            .stage(JobStage::Optimize, "Model optimization failed")?;
        (result.model, Some(result.trials))
    };

    let scores = evaluate(model.as_ref(), &metrics, &x, &y)?;

    fs::create_dir_all(run_dir).stage_with(JobStage::SaveArtifacts, || {
        format!("Can not create run directory {}", run_dir.display())
    })?;
    let model_path = run_dir.join(MODEL_FILE);
    model
        .save(&model_path)
        .stage(JobStage::SaveArtifacts, "Error while saving the trained model")?;
    let trials_path = match trials {
        Some(trials) => {
            let path = run_dir.join(TRIALS_FILE);
            let json = serde_json::to_vec_pretty(&trials)
                .stage(JobStage::SaveArtifacts, "Can not serialize optimization trials")?;
            fs::write(&path, json)
                .stage(JobStage::SaveArtifacts, "Error while saving optimization trials")?;
            Some(path)
        }
        None => None,
    };

    Ok(TrainedRun {
        metrics: scores,
        run_path: model_path,
        trials_path,
    })
}

/// Stored splits when the dataset was partitioned on creation, otherwise
/// a fresh partition using the experiment's fractions and seed.
fn load_splits(root: &Path, experiment: &Experiment) -> Result<DatasetSplits, JobError> {
    let stored = dataset::load_dataset(root).stage_with(JobStage::LoadDataset, || {
        format!("Can not load dataset from path {}", root.display())
    })?;
    let metadata = read_split_metadata(root)?;
    if metadata.split_indices.is_some() {
        return Ok(stored);
    }

    let (table, _) = stored
        .concat()
        .stage(JobStage::LoadDataset, "Dataset splits have different columns")?;
    let fractions = experiment.splits;
    let indices = split_indexes(
        table.n_rows(),
        fractions.train,
        fractions.test,
        fractions.validation,
        experiment.seed,
    );
    DatasetSplits::from_indices(&table, &indices)
        .stage(JobStage::LoadDataset, "Can not partition dataset")
}

/// Per-split `{metric: score}` maps. Empty splits get an empty map.
fn evaluate(
    model: &dyn Model,
    metrics: &[(String, Box<dyn Metric>)],
    x: &Splits<Frame>,
    y: &Splits<Column>,
) -> Result<Splits<Value>, JobError> {
    Splits::<()>::default().try_map(|split: SplitName, ()| {
        let (x, y) = (x.get(split), y.get(split));
        let mut scores = Map::new();
        if x.n_rows() == 0 {
            return Ok(Value::Object(scores));
        }
        let predictions = model.predict(x).stage_with(JobStage::Evaluate, || {
            format!("Prediction on the {} split failed", split)
        })?;
        for (name, metric) in metrics {
            let score = metric
                .score(&y.values, &predictions)
                .stage_with(JobStage::Evaluate, || format!("Metric {} failed", name))?;
            scores.insert(name.clone(), json!(score));
        }
        Ok(Value::Object(scores))
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Parameter Partitioning
// ═══════════════════════════════════════════════════════════════════════════════

/// Split run parameters into fixed values and a search space.
///
/// An entry shaped `{optimize, fixed_value, lower_bound, upper_bound}` is
/// searched when `optimize` is true and contributes `fixed_value` otherwise.
/// Any other value is passed through as fixed.
pub fn partition_parameters(parameters: &Params) -> Result<(Params, SearchSpace), JobError> {
    let mut fixed = Params::new();
    let mut space = SearchSpace::new();

    for (name, value) in parameters {
        let spec = match value.as_object() {
            Some(spec) if spec.contains_key("optimize") => spec,
            _ => {
                fixed.insert(name.clone(), value.clone());
                continue;
            }
        };

        if spec.get("optimize").and_then(Value::as_bool).unwrap_or(false) {
            let bound = |key: &str| {
                spec.get(key).filter(|v| v.is_number()).ok_or_else(|| {
                    JobError::new(
                        JobStage::PrepareData,
                        format!("Optimizable parameter {} needs a numeric {}", name, key),
                    )
                })
            };
            let (lower, upper) = (bound("lower_bound")?, bound("upper_bound")?);
            let range = ParamRange {
                lower: lower.as_f64().unwrap_or_default(),
                upper: upper.as_f64().unwrap_or_default(),
                integer: !lower.is_f64() && !upper.is_f64(),
            };
            if range.lower > range.upper {
                return Err(JobError::new(
                    JobStage::PrepareData,
                    format!(
                        "Parameter {} has lower bound {} above upper bound {}",
                        name, range.lower, range.upper
                    ),
                ));
            }
            space.insert(name.clone(), range);
        } else if let Some(fixed_value) = spec.get("fixed_value") {
            fixed.insert(name.clone(), fixed_value.clone());
        }
    }
    Ok((fixed, space))
}

#[async_trait]
impl Job for ModelJob {
    fn kind(&self) -> JobKind {
        JobKind::Model
    }

    fn payload(&self) -> &JobPayload {
        &self.payload
    }

    fn record(&self) -> Option<RecordRef> {
        Some(self.run_ref())
    }

    async fn mark_delivered(&self, ctx: &JobContext) -> Result<(), JobError> {
        let run_ref = self.run_ref();
        ctx.store
            .get_run(self.run_id)
            .await
            .stage(JobStage::Deliver, "Error while loading the run info")?
            .ok_or_else(|| JobError::missing(JobStage::Deliver, run_ref))?;
        ctx.set_status(run_ref, RecordStatus::Delivered, JobStage::Deliver)
            .await
    }

    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        match self.execute(ctx).await {
            Ok(()) => Ok(()),
            Err(e) => Err(ctx.fail(self.kind(), e.with_record(self.run_ref())).await),
        }
    }
}
