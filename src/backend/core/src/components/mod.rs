//! Pluggable ML components resolved by name at job run time.
//!
//! Every component family is a trait object built by a factory registered in
//! the [`ComponentRegistry`]. Component code reports failures with
//! [`anyhow::Result`]; jobs attach stage and record context on the way out.

pub mod converters;
pub mod explorers;
pub mod loaders;
pub mod metrics;
pub mod models;
pub mod optimizers;
pub mod registry;
pub mod tasks;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::dataset::{Cell, Column, DatasetSplits, Frame, Splits};

pub use loaders::DataSource;
pub use optimizers::{OptimizationResult, SearchSpace, Trial};
pub use registry::{ComponentKind, ComponentRegistry, RegistryError};

/// Constructor parameters, as persisted on records.
pub type Params = Map<String, Value>;

/// Deserialize a parameter map into a typed configuration.
pub fn parse_params<T: DeserializeOwned>(params: &Params) -> anyhow::Result<T> {
    Ok(serde_json::from_value(Value::Object(params.clone()))?)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Component Contracts
// ═══════════════════════════════════════════════════════════════════════════════

/// Tabular transform fitted on a scoped slice and applied to every row.
pub trait Converter: Send {
    fn fit(&mut self, x: &Frame, y: &Column) -> anyhow::Result<()>;

    /// Replacement columns for `x`; row count must match `x`.
    fn transform(&self, x: &Frame, y: &Column) -> anyhow::Result<Frame>;
}

pub trait Model: Send {
    fn fit(&mut self, x: &Frame, y: &Column) -> anyhow::Result<()>;

    fn predict(&self, x: &Frame) -> anyhow::Result<Vec<Cell>>;

    /// Write the fitted model to `path` so the registry can load it back.
    fn save(&self, path: &Path) -> anyhow::Result<()>;
}

pub trait Metric: Send + Sync {
    fn score(&self, y_true: &[Cell], y_pred: &[Cell]) -> anyhow::Result<f64>;

    fn greater_is_better(&self) -> bool {
        true
    }
}

/// Search over the optimizable parameters of a model.
pub trait Optimizer: Send {
    fn optimize(&mut self, problem: OptimizationProblem<'_>) -> anyhow::Result<OptimizationResult>;
}

/// Everything an optimizer needs to build, fit and score candidates.
pub struct OptimizationProblem<'a> {
    pub build: &'a (dyn Fn(&Params) -> anyhow::Result<Box<dyn Model>> + Sync),
    pub fixed: &'a Params,
    pub search_space: &'a SearchSpace,
    pub x: &'a Splits<Frame>,
    pub y: &'a Splits<Column>,
    pub goal: &'a dyn Metric,
}

pub trait Task: Send + Sync {
    /// Cast and validate the dataset for this task.
    fn prepare_for_task(
        &self,
        splits: DatasetSplits,
        output_columns: &[String],
    ) -> anyhow::Result<DatasetSplits>;
}

pub trait Explorer: Send + Sync {
    /// Reduce the dataset to what the exploration looks at.
    fn prepare_dataset(&self, splits: &DatasetSplits, columns: &[String]) -> anyhow::Result<Frame>;

    fn launch_exploration(&self, data: &Frame) -> anyhow::Result<Value>;

    /// Persist `result` inside `dir` and return the written path.
    fn save_exploration(&self, result: &Value, dir: &Path, explorer_id: i64)
        -> anyhow::Result<PathBuf>;
}

pub trait DataLoader: Send + Sync {
    fn load_data(&self, source: &DataSource, params: &Params) -> anyhow::Result<Frame>;
}
