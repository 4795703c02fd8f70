//! Built-in tabular converters.

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;
use std::collections::BTreeSet;

use super::registry::ComponentRegistry;
use super::{parse_params, Converter, Params};
use crate::dataset::{Cell, Column, Frame};

pub(super) fn register(registry: &mut ComponentRegistry) {
    registry.register_converter("StandardScaler", |params| {
        Ok(Box::new(StandardScaler::new(parse_params(params)?)))
    });
    registry.register_converter("MinMaxScaler", |params| {
        Ok(Box::new(MinMaxScaler::new(parse_params(params)?)?))
    });
    registry.register_converter("LabelBinarizer", |params| {
        Ok(Box::new(LabelBinarizer::new(parse_params(params)?)))
    });
    registry.register_converter("DropColumns", |_| Ok(Box::new(DropColumns)));
}

/// Numeric view of a column where nulls stay `None`.
fn numeric(column: &Column) -> anyhow::Result<Vec<Option<f64>>> {
    column
        .values
        .iter()
        .enumerate()
        .map(|(row, cell)| match cell {
            Cell::Null => Ok(None),
            other => other
                .as_f64()
                .map(Some)
                .ok_or_else(|| anyhow!("column {:?} is not numeric at row {}", column.name, row)),
        })
        .collect()
}

/// Apply a per-column affine map `(v - offset) * scale`, keeping nulls.
fn affine(x: &Frame, params: &[(f64, f64)], shift: f64) -> anyhow::Result<Frame> {
    if params.len() != x.n_cols() {
        bail!(
            "converter was fitted on {} columns, got {}",
            params.len(),
            x.n_cols()
        );
    }
    let columns = x
        .columns()
        .iter()
        .zip(params)
        .map(|(column, &(offset, scale))| {
            let values = numeric(column)?
                .into_iter()
                .map(|v| match v {
                    Some(v) => Cell::Float((v - offset) * scale + shift),
                    None => Cell::Null,
                })
                .collect();
            Ok(Column::new(column.name.clone(), values))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Frame::new(columns)?)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scalers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StandardScalerParams {
    pub with_mean: bool,
    pub with_std: bool,
}

impl Default for StandardScalerParams {
    fn default() -> Self {
        Self {
            with_mean: true,
            with_std: true,
        }
    }
}

/// Standardize to zero mean and unit variance (population variance).
#[derive(Debug, Clone, Default)]
pub struct StandardScaler {
    params: StandardScalerParams,
    fitted: Vec<(f64, f64)>,
}

impl StandardScaler {
    pub fn new(params: StandardScalerParams) -> Self {
        Self {
            params,
            fitted: Vec::new(),
        }
    }
}

impl Converter for StandardScaler {
    fn fit(&mut self, x: &Frame, _y: &Column) -> anyhow::Result<()> {
        self.fitted = x
            .columns()
            .iter()
            .map(|column| {
                let values: Vec<f64> = numeric(column)?.into_iter().flatten().collect();
                let n = values.len().max(1) as f64;
                let mean = values.iter().sum::<f64>() / n;
                let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                let std = var.sqrt();
                let offset = if self.params.with_mean { mean } else { 0.0 };
                let scale = if self.params.with_std && std > 0.0 { 1.0 / std } else { 1.0 };
                Ok((offset, scale))
            })
            .collect::<anyhow::Result<_>>()?;
        Ok(())
    }

    fn transform(&self, x: &Frame, _y: &Column) -> anyhow::Result<Frame> {
        affine(x, &self.fitted, 0.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MinMaxScalerParams {
    pub feature_range: (f64, f64),
}

impl Default for MinMaxScalerParams {
    fn default() -> Self {
        Self {
            feature_range: (0.0, 1.0),
        }
    }
}

/// Rescale each column into `feature_range`.
#[derive(Debug, Clone)]
pub struct MinMaxScaler {
    low: f64,
    high: f64,
    fitted: Vec<(f64, f64)>,
}

impl MinMaxScaler {
    pub fn new(params: MinMaxScalerParams) -> anyhow::Result<Self> {
        let (low, high) = params.feature_range;
        if low >= high {
            bail!("feature_range minimum must be smaller than maximum, got ({low}, {high})");
        }
        Ok(Self {
            low,
            high,
            fitted: Vec::new(),
        })
    }
}

impl Converter for MinMaxScaler {
    fn fit(&mut self, x: &Frame, _y: &Column) -> anyhow::Result<()> {
        let width = self.high - self.low;
        self.fitted = x
            .columns()
            .iter()
            .map(|column| {
                let values: Vec<f64> = numeric(column)?.into_iter().flatten().collect();
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                if values.is_empty() {
                    return Ok((0.0, 1.0));
                }
                let range = if max > min { max - min } else { 1.0 };
                Ok((min, width / range))
            })
            .collect::<anyhow::Result<_>>()?;
        Ok(())
    }

    fn transform(&self, x: &Frame, _y: &Column) -> anyhow::Result<Frame> {
        affine(x, &self.fitted, self.low)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Column reshaping
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LabelBinarizerParams {
    pub neg_label: i64,
    pub pos_label: i64,
}

impl Default for LabelBinarizerParams {
    fn default() -> Self {
        Self {
            neg_label: 0,
            pos_label: 1,
        }
    }
}

/// One-vs-all encoding: every input column becomes one indicator column per
/// class seen during fit, named `<column>_<class>`.
#[derive(Debug, Clone, Default)]
pub struct LabelBinarizer {
    params: LabelBinarizerParams,
    classes: Vec<(String, Vec<String>)>,
}

impl LabelBinarizer {
    pub fn new(params: LabelBinarizerParams) -> Self {
        Self {
            params,
            classes: Vec::new(),
        }
    }
}

impl Converter for LabelBinarizer {
    fn fit(&mut self, x: &Frame, _y: &Column) -> anyhow::Result<()> {
        self.classes = x
            .columns()
            .iter()
            .map(|column| {
                let classes: BTreeSet<String> = column
                    .values
                    .iter()
                    .filter(|c| !c.is_null())
                    .map(Cell::label)
                    .collect();
                (column.name.clone(), classes.into_iter().collect())
            })
            .collect();
        Ok(())
    }

    fn transform(&self, x: &Frame, _y: &Column) -> anyhow::Result<Frame> {
        let mut out = Vec::new();
        for (name, classes) in &self.classes {
            let column = x
                .column(name)
                .with_context(|| format!("column {name:?} was not present at fit time"))?;
            let labels: Vec<String> = column.values.iter().map(Cell::label).collect();
            for class in classes {
                let values = labels
                    .iter()
                    .map(|label| {
                        Cell::Int(if label == class {
                            self.params.pos_label
                        } else {
                            self.params.neg_label
                        })
                    })
                    .collect();
                out.push(Column::new(format!("{name}_{class}"), values));
            }
        }
        Ok(Frame::new(out)?)
    }
}

/// Removes every scoped column.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropColumns;

impl Converter for DropColumns {
    fn fit(&mut self, _x: &Frame, _y: &Column) -> anyhow::Result<()> {
        Ok(())
    }

    fn transform(&self, _x: &Frame, _y: &Column) -> anyhow::Result<Frame> {
        Ok(Frame::default())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════════════════════════

/// Applies its stages in sequence under one scope. Each stage is fitted on the
/// output of the stages before it.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Converter>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Converter>>) -> Self {
        Self { stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Converter for Pipeline {
    fn fit(&mut self, x: &Frame, y: &Column) -> anyhow::Result<()> {
        let mut current = x.clone();
        let last = self.stages.len().saturating_sub(1);
        for (i, stage) in self.stages.iter_mut().enumerate() {
            stage
                .fit(&current, y)
                .with_context(|| format!("pipeline stage {i} failed to fit"))?;
            if i < last {
                current = stage
                    .transform(&current, y)
                    .with_context(|| format!("pipeline stage {i} failed to transform"))?;
            }
        }
        Ok(())
    }

    fn transform(&self, x: &Frame, y: &Column) -> anyhow::Result<Frame> {
        let mut current = x.clone();
        for (i, stage) in self.stages.iter().enumerate() {
            current = stage
                .transform(&current, y)
                .with_context(|| format!("pipeline stage {i} failed to transform"))?;
        }
        Ok(current)
    }
}
