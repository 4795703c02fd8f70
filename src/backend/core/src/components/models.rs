//! Built-in estimators. Fitted state is written as JSON.

use anyhow::{bail, Context};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use super::registry::ComponentRegistry;
use super::{parse_params, Model, Params};
use crate::dataset::{Cell, Column, Frame};

pub(super) fn register(registry: &mut ComponentRegistry) {
    registry.register_model(
        "DummyClassifier",
        |params| Ok(Box::new(DummyClassifier::new(parse_params(params)?))),
        |path| Ok(Box::new(load_json::<DummyClassifier>(path)?)),
    );
    registry.register_model(
        "KNeighborsClassifier",
        |params| Ok(Box::new(KNeighborsClassifier::new(parse_params(params)?)?)),
        |path| Ok(Box::new(load_json::<KNeighborsClassifier>(path)?)),
    );
    registry.register_model(
        "DummyRegressor",
        |params| Ok(Box::new(DummyRegressor::new(parse_params(params)?))),
        |path| Ok(Box::new(load_json::<DummyRegressor>(path)?)),
    );
}

fn save_json<T: Serialize>(model: &T, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec(model)?;
    fs::write(path, bytes).with_context(|| format!("writing model to {}", path.display()))
}

fn load_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let bytes = fs::read(path).with_context(|| format!("reading model from {}", path.display()))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Row-major numeric features.
fn feature_rows(x: &Frame) -> anyhow::Result<Vec<Vec<f64>>> {
    let columns = x
        .columns()
        .iter()
        .map(Column::to_f64)
        .collect::<Result<Vec<_>, _>>()?;
    Ok((0..x.n_rows())
        .map(|row| columns.iter().map(|c| c[row]).collect())
        .collect())
}

fn check_lengths(x: &Frame, y: &Column) -> anyhow::Result<()> {
    if x.n_rows() != y.len() {
        bail!("x has {} rows but y has {}", x.n_rows(), y.len());
    }
    if y.is_empty() {
        bail!("cannot fit on an empty training set");
    }
    Ok(())
}

/// Most frequent label; ties go to the label seen first.
fn majority<'a>(labels: impl IntoIterator<Item = &'a Cell>) -> Option<Cell> {
    let mut counts: HashMap<String, (usize, usize, &Cell)> = HashMap::new();
    for (seen, cell) in labels.into_iter().enumerate() {
        counts
            .entry(cell.label())
            .and_modify(|entry| entry.0 += 1)
            .or_insert((1, seen, cell));
    }
    counts
        .into_values()
        .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
        .map(|(_, _, cell)| cell.clone())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Classifiers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DummyClassifierParams {}

/// Always predicts the most frequent training label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DummyClassifier {
    most_frequent: Option<Cell>,
}

impl DummyClassifier {
    pub fn new(_params: DummyClassifierParams) -> Self {
        Self::default()
    }
}

impl Model for DummyClassifier {
    fn fit(&mut self, x: &Frame, y: &Column) -> anyhow::Result<()> {
        check_lengths(x, y)?;
        self.most_frequent = majority(&y.values);
        Ok(())
    }

    fn predict(&self, x: &Frame) -> anyhow::Result<Vec<Cell>> {
        let label = self.most_frequent.clone().context("model is not fitted")?;
        Ok(vec![label; x.n_rows()])
    }

    fn save(&self, path: &Path) -> anyhow::Result<()> {
        save_json(self, path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KNeighborsParams {
    pub n_neighbors: usize,
}

impl Default for KNeighborsParams {
    fn default() -> Self {
        Self { n_neighbors: 5 }
    }
}

/// Majority vote among the `n_neighbors` closest training rows (euclidean).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KNeighborsClassifier {
    n_neighbors: usize,
    points: Vec<Vec<f64>>,
    labels: Vec<Cell>,
}

impl KNeighborsClassifier {
    pub fn new(params: KNeighborsParams) -> anyhow::Result<Self> {
        if params.n_neighbors == 0 {
            bail!("n_neighbors must be at least 1");
        }
        Ok(Self {
            n_neighbors: params.n_neighbors,
            points: Vec::new(),
            labels: Vec::new(),
        })
    }
}

impl Model for KNeighborsClassifier {
    fn fit(&mut self, x: &Frame, y: &Column) -> anyhow::Result<()> {
        check_lengths(x, y)?;
        self.points = feature_rows(x)?;
        self.labels = y.values.clone();
        Ok(())
    }

    fn predict(&self, x: &Frame) -> anyhow::Result<Vec<Cell>> {
        if self.points.is_empty() {
            bail!("model is not fitted");
        }
        let k = self.n_neighbors.min(self.points.len());
        feature_rows(x)?
            .into_iter()
            .map(|row| {
                if row.len() != self.points[0].len() {
                    bail!(
                        "expected {} features, got {}",
                        self.points[0].len(),
                        row.len()
                    );
                }
                let mut distances: Vec<(f64, usize)> = self
                    .points
                    .iter()
                    .enumerate()
                    .map(|(i, p)| {
                        let d: f64 = p.iter().zip(&row).map(|(a, b)| (a - b).powi(2)).sum();
                        (d, i)
                    })
                    .collect();
                distances.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
                majority(distances[..k].iter().map(|&(_, i)| &self.labels[i]))
                    .context("no neighbours found")
            })
            .collect()
    }

    fn save(&self, path: &Path) -> anyhow::Result<()> {
        save_json(self, path)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Regressors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegressorStrategy {
    #[default]
    Mean,
    Median,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DummyRegressorParams {
    pub strategy: RegressorStrategy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DummyRegressor {
    strategy: RegressorStrategy,
    constant: Option<f64>,
}

impl DummyRegressor {
    pub fn new(params: DummyRegressorParams) -> Self {
        Self {
            strategy: params.strategy,
            constant: None,
        }
    }
}

impl Model for DummyRegressor {
    fn fit(&mut self, x: &Frame, y: &Column) -> anyhow::Result<()> {
        check_lengths(x, y)?;
        let mut values = y.to_f64()?;
        let constant = match self.strategy {
            RegressorStrategy::Mean => values.iter().sum::<f64>() / values.len() as f64,
            RegressorStrategy::Median => {
                values.sort_by(f64::total_cmp);
                let mid = values.len() / 2;
                if values.len() % 2 == 0 {
                    (values[mid - 1] + values[mid]) / 2.0
                } else {
                    values[mid]
                }
            }
        };
        self.constant = Some(constant);
        Ok(())
    }

    fn predict(&self, x: &Frame) -> anyhow::Result<Vec<Cell>> {
        let constant = self.constant.context("model is not fitted")?;
        Ok(vec![Cell::Float(constant); x.n_rows()])
    }

    fn save(&self, path: &Path) -> anyhow::Result<()> {
        save_json(self, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xy() -> (Frame, Column) {
        let x = Frame::new(vec![
            Column::new("f1", vec![0.0.into(), 0.1.into(), 5.0.into(), 5.1.into(), 5.2.into()]),
            Column::new("f2", vec![0.0.into(), 0.0.into(), 5.0.into(), 5.0.into(), 5.0.into()]),
        ])
        .unwrap();
        let y = Column::new("class", vec!["a".into(), "a".into(), "b".into(), "b".into(), "b".into()]);
        (x, y)
    }

    #[test]
    fn test_dummy_classifier_predicts_majority() {
        let (x, y) = xy();
        let mut model = DummyClassifier::default();
        model.fit(&x, &y).unwrap();
        assert_eq!(model.predict(&x).unwrap(), vec![Cell::from("b"); 5]);
    }

    #[test]
    fn test_knn_separates_clusters() {
        let (x, y) = xy();
        let mut model = KNeighborsClassifier::new(KNeighborsParams { n_neighbors: 1 }).unwrap();
        model.fit(&x, &y).unwrap();
        let preds = model.predict(&x).unwrap();
        assert_eq!(preds, y.values);
    }

    #[test]
    fn test_knn_rejects_zero_neighbours_and_unfitted_predict() {
        assert!(KNeighborsClassifier::new(KNeighborsParams { n_neighbors: 0 }).is_err());
        let model = KNeighborsClassifier::new(KNeighborsParams::default()).unwrap();
        assert!(model.predict(&xy().0).is_err());
    }

    #[test]
    fn test_save_and_load_through_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_1").join("model.json");
        let (x, y) = xy();

        let mut model = KNeighborsClassifier::new(KNeighborsParams { n_neighbors: 3 }).unwrap();
        model.fit(&x, &y).unwrap();
        model.save(&path).unwrap();

        let registry = ComponentRegistry::with_defaults();
        let loaded = registry.load_model("KNeighborsClassifier", &path).unwrap();
        assert_eq!(loaded.predict(&x).unwrap(), model.predict(&x).unwrap());
    }

    #[test]
    fn test_dummy_regressor_median() {
        let x = Frame::new(vec![Column::new("f", vec![Cell::Int(0); 4])]).unwrap();
        let y = Column::new("t", vec![1.0.into(), 2.0.into(), 10.0.into(), 4.0.into()]);
        let mut model = DummyRegressor::new(DummyRegressorParams {
            strategy: RegressorStrategy::Median,
        });
        model.fit(&x, &y).unwrap();
        assert_eq!(model.predict(&x).unwrap(), vec![Cell::Float(3.0); 4]);
    }
}
