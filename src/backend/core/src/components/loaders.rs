//! Data loaders turning an uploaded source into a single frame.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;

use super::registry::ComponentRegistry;
use super::{parse_params, DataLoader, Params};
use crate::dataset::{Cell, Frame};

pub(super) fn register(registry: &mut ComponentRegistry) {
    registry.register_loader("CSVDataLoader", || Box::new(CsvDataLoader));
    registry.register_loader("JSONDataLoader", || Box::new(JsonDataLoader));
}

/// Where the raw data lives: a file on the server or the content itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataSource {
    Path { path: PathBuf },
    Inline { inline: String },
}

impl DataSource {
    pub fn read_to_string(&self) -> anyhow::Result<String> {
        match self {
            Self::Path { path } => fs::read_to_string(path)
                .with_context(|| format!("reading data source {}", path.display())),
            Self::Inline { inline } => Ok(inline.clone()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CSV
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CsvParams {
    pub separator: char,
    pub has_header: bool,
}

impl Default for CsvParams {
    fn default() -> Self {
        Self {
            separator: ',',
            has_header: true,
        }
    }
}

/// Delimited text. Cells are typed with [`Cell::infer`]; headerless files get
/// `column_<n>` names.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvDataLoader;

impl DataLoader for CsvDataLoader {
    fn load_data(&self, source: &DataSource, params: &Params) -> anyhow::Result<Frame> {
        let params: CsvParams = parse_params(params)?;
        if !params.separator.is_ascii() {
            bail!("separator must be a single ASCII character");
        }
        let raw = source.read_to_string()?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(params.separator as u8)
            .has_headers(params.has_header)
            .from_reader(raw.as_bytes());

        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("malformed CSV record {}", line + 1))?;
            rows.push(record.iter().map(Cell::infer).collect::<Vec<_>>());
        }

        let names: Vec<String> = if params.has_header {
            reader.headers()?.iter().map(|h| h.trim().to_string()).collect()
        } else {
            let width = rows.first().map(Vec::len).unwrap_or(0);
            (1..=width).map(|i| format!("column_{i}")).collect()
        };
        Ok(Frame::from_rows(&names, rows)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// JSON
// ═══════════════════════════════════════════════════════════════════════════════

/// Either one array of row objects or one row object per line. Columns follow
/// the key order of the first row; missing keys become nulls.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDataLoader;

impl DataLoader for JsonDataLoader {
    fn load_data(&self, source: &DataSource, _params: &Params) -> anyhow::Result<Frame> {
        let raw = source.read_to_string()?;
        let trimmed = raw.trim_start();
        let objects: Vec<Value> = if trimmed.starts_with('[') {
            serde_json::from_str(trimmed).context("invalid JSON array")?
        } else {
            trimmed
                .lines()
                .filter(|l| !l.trim().is_empty())
                .enumerate()
                .map(|(i, l)| {
                    serde_json::from_str(l).with_context(|| format!("invalid JSON on line {}", i + 1))
                })
                .collect::<anyhow::Result<_>>()?
        };

        let mut names: Vec<String> = Vec::new();
        for object in &objects {
            let Value::Object(map) = object else {
                bail!("every JSON row must be an object");
            };
            for key in map.keys() {
                if !names.contains(key) {
                    names.push(key.clone());
                }
            }
        }

        let rows = objects
            .into_iter()
            .map(|object| {
                let Value::Object(mut map) = object else {
                    unreachable!("rows checked above")
                };
                names
                    .iter()
                    .map(|name| map.remove(name).map(Cell::from).unwrap_or(Cell::Null))
                    .collect()
            })
            .collect();
        Ok(Frame::from_rows(&names, rows)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inline(text: &str) -> DataSource {
        DataSource::Inline {
            inline: text.to_string(),
        }
    }

    #[test]
    fn test_csv_with_header_and_types() {
        let frame = CsvDataLoader
            .load_data(&inline("a,b\n1,x\n2.5,\n"), &Params::new())
            .unwrap();
        assert_eq!(frame.column_names(), vec!["a", "b"]);
        assert_eq!(
            frame.column("a").unwrap().values,
            vec![Cell::Int(1), Cell::Float(2.5)]
        );
        assert_eq!(frame.column("b").unwrap().values[1], Cell::Null);
    }

    #[test]
    fn test_csv_custom_separator_without_header() {
        let params = json!({"separator": ";", "has_header": false});
        let frame = CsvDataLoader
            .load_data(&inline("1;2\n3;4\n"), params.as_object().unwrap())
            .unwrap();
        assert_eq!(frame.column_names(), vec!["column_1", "column_2"]);
        assert_eq!(frame.n_rows(), 2);
    }

    #[test]
    fn test_csv_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        fs::write(&path, "x\n1\n2\n3\n").unwrap();
        let frame = CsvDataLoader
            .load_data(&DataSource::Path { path }, &Params::new())
            .unwrap();
        assert_eq!(frame.n_rows(), 3);
    }

    #[test]
    fn test_json_array_and_lines() {
        let array = JsonDataLoader
            .load_data(&inline(r#"[{"b":1,"a":"x"},{"a":"y"}]"#), &Params::new())
            .unwrap();
        assert_eq!(array.column_names(), vec!["b", "a"]);
        assert_eq!(array.column("b").unwrap().values, vec![Cell::Int(1), Cell::Null]);

        let lines = JsonDataLoader
            .load_data(&inline("{\"v\": 1.5}\n\n{\"v\": 2}\n"), &Params::new())
            .unwrap();
        assert_eq!(lines.n_rows(), 2);
    }

    #[test]
    fn test_json_rejects_non_objects() {
        assert!(JsonDataLoader
            .load_data(&inline("[1, 2]"), &Params::new())
            .is_err());
    }

    #[test]
    fn test_source_shapes() {
        let path: DataSource = serde_json::from_value(json!({"path": "/tmp/a.csv"})).unwrap();
        assert!(matches!(path, DataSource::Path { .. }));
        let inline: DataSource = serde_json::from_value(json!({"inline": "a\n1"})).unwrap();
        assert!(matches!(inline, DataSource::Inline { .. }));
    }
}
