//! Dataset explorations.

use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use super::registry::ComponentRegistry;
use super::{parse_params, Explorer};
use crate::dataset::{Cell, Column, DatasetSplits, Frame};

pub(super) fn register(registry: &mut ComponentRegistry) {
    registry.register_explorer("DescribeExplorer", |params| {
        Ok(Box::new(DescribeExplorer::new(parse_params(params)?)))
    });
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DescribeParams {
    /// Also count distinct values of numeric columns.
    pub count_unique: bool,
}

/// Summary statistics per column over all splits.
#[derive(Debug, Clone, Default)]
pub struct DescribeExplorer {
    params: DescribeParams,
}

impl DescribeExplorer {
    pub fn new(params: DescribeParams) -> Self {
        Self { params }
    }

    fn describe(&self, column: &Column) -> Value {
        let present: Vec<&Cell> = column.values.iter().filter(|c| !c.is_null()).collect();
        let nulls = column.len() - present.len();
        let numbers: Option<Vec<f64>> = present.iter().map(|c| c.as_f64()).collect();

        let mut stats = Map::new();
        stats.insert("count".into(), json!(present.len()));
        stats.insert("nulls".into(), json!(nulls));
        match numbers {
            Some(values) if !values.is_empty() => {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                stats.insert("mean".into(), json!(mean));
                stats.insert("min".into(), json!(min));
                stats.insert("max".into(), json!(max));
                if self.params.count_unique {
                    stats.insert("unique".into(), json!(unique(&present)));
                }
            }
            _ => {
                stats.insert("unique".into(), json!(unique(&present)));
            }
        }
        Value::Object(stats)
    }
}

fn unique(cells: &[&Cell]) -> usize {
    cells.iter().map(|c| c.label()).collect::<HashSet<_>>().len()
}

impl Explorer for DescribeExplorer {
    fn prepare_dataset(&self, splits: &DatasetSplits, columns: &[String]) -> anyhow::Result<Frame> {
        let (table, _) = splits.concat()?;
        if columns.is_empty() {
            return Ok(table);
        }
        Ok(table.select(columns)?)
    }

    fn launch_exploration(&self, data: &Frame) -> anyhow::Result<Value> {
        let columns: Map<String, Value> = data
            .columns()
            .iter()
            .map(|c| (c.name.clone(), self.describe(c)))
            .collect();
        Ok(json!({ "rows": data.n_rows(), "columns": columns }))
    }

    fn save_exploration(
        &self,
        result: &Value,
        dir: &Path,
        explorer_id: i64,
    ) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{explorer_id}.json"));
        fs::write(&path, serde_json::to_vec_pretty(result)?)
            .with_context(|| format!("writing exploration to {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Splits;

    fn splits() -> DatasetSplits {
        let frame = |a: Vec<Cell>, b: Vec<Cell>| {
            Frame::new(vec![Column::new("a", a), Column::new("b", b)]).unwrap()
        };
        Splits {
            train: frame(vec![Cell::Int(1), Cell::Int(3)], vec!["x".into(), "y".into()]),
            test: frame(vec![Cell::Null], vec!["x".into()]),
            validation: frame(vec![Cell::Int(5)], vec!["z".into()]),
        }
    }

    #[test]
    fn test_describe_numeric_and_text() {
        let explorer = DescribeExplorer::default();
        let data = explorer.prepare_dataset(&splits(), &[]).unwrap();
        let result = explorer.launch_exploration(&data).unwrap();

        assert_eq!(result["rows"], 4);
        assert_eq!(result["columns"]["a"]["nulls"], 1);
        assert_eq!(result["columns"]["a"]["mean"], 3.0);
        assert_eq!(result["columns"]["a"]["max"], 5.0);
        assert_eq!(result["columns"]["b"]["unique"], 3);
    }

    #[test]
    fn test_prepare_restricts_columns() {
        let explorer = DescribeExplorer::default();
        let data = explorer
            .prepare_dataset(&splits(), &["b".to_string()])
            .unwrap();
        assert_eq!(data.column_names(), vec!["b"]);
        assert!(explorer
            .prepare_dataset(&splits(), &["missing".to_string()])
            .is_err());
    }

    #[test]
    fn test_save_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let explorer = DescribeExplorer::default();
        let path = explorer
            .save_exploration(&json!({"rows": 0}), &dir.path().join("1_iris"), 7)
            .unwrap();
        assert!(path.ends_with("1_iris/7.json"));
        let saved: Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        assert_eq!(saved["rows"], 0);
    }
}
