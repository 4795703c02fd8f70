//! Task definitions: validate and cast datasets before training.

use anyhow::{bail, Context};

use super::registry::ComponentRegistry;
use super::Task;
use crate::dataset::{Cell, Column, DatasetSplits, Frame};

pub const CLASSIFICATION_TASK: &str = "TabularClassificationTask";
pub const REGRESSION_TASK: &str = "RegressionTask";

pub(super) fn register(registry: &mut ComponentRegistry) {
    registry.register_task(CLASSIFICATION_TASK, || Box::new(TabularClassificationTask));
    registry.register_task(REGRESSION_TASK, || Box::new(RegressionTask));
}

fn single_output(output_columns: &[String]) -> anyhow::Result<&str> {
    match output_columns {
        [one] => Ok(one.as_str()),
        _ => bail!(
            "task expects exactly one output column, got {}",
            output_columns.len()
        ),
    }
}

/// Replace column `name` in every split with `f(column)`.
fn recast(
    splits: DatasetSplits,
    name: &str,
    f: impl Fn(&Column) -> anyhow::Result<Vec<Cell>>,
) -> anyhow::Result<DatasetSplits> {
    splits.try_map(|split, frame| {
        let column = frame
            .column(name)
            .with_context(|| format!("output column {name:?} missing from {split} split"))?;
        let values = f(column).with_context(|| format!("in {split} split"))?;
        let columns = frame
            .into_columns()
            .into_iter()
            .map(|c| {
                if c.name == name {
                    Column::new(c.name, values.clone())
                } else {
                    c
                }
            })
            .collect();
        Ok(Frame::new(columns)?)
    })
}

/// Classification over tabular inputs; labels are kept as categorical cells.
#[derive(Debug, Clone, Copy, Default)]
pub struct TabularClassificationTask;

impl Task for TabularClassificationTask {
    fn prepare_for_task(
        &self,
        splits: DatasetSplits,
        output_columns: &[String],
    ) -> anyhow::Result<DatasetSplits> {
        let output = single_output(output_columns)?;
        recast(splits, output, |column| {
            if let Some(row) = column.values.iter().position(Cell::is_null) {
                bail!("label column {:?} has a missing value at row {}", column.name, row);
            }
            // Float labels such as 1.0 are folded into integers.
            Ok(column
                .values
                .iter()
                .map(|cell| match cell {
                    Cell::Float(f) if f.fract() == 0.0 => Cell::Int(*f as i64),
                    other => other.clone(),
                })
                .collect())
        })
    }
}

/// Regression with one numeric target.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegressionTask;

impl Task for RegressionTask {
    fn prepare_for_task(
        &self,
        splits: DatasetSplits,
        output_columns: &[String],
    ) -> anyhow::Result<DatasetSplits> {
        let output = single_output(output_columns)?;
        recast(splits, output, |column| {
            Ok(column.to_f64()?.into_iter().map(Cell::Float).collect())
        })
    }
}
