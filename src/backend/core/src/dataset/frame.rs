//! Columnar in-memory table used by loaders, converters and models.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// One value in a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Cell {
    /// Numeric view of the cell; text is parsed, booleans are 0/1.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) if f.is_nan() => None,
            Self::Float(f) => Some(*f),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Parse a raw text field, as read from CSV, into the narrowest cell.
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::Null;
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Self::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return Self::Float(f);
        }
        match trimmed {
            "true" | "True" | "TRUE" => Self::Bool(true),
            "false" | "False" | "FALSE" => Self::Bool(false),
            _ => Self::Text(raw.to_string()),
        }
    }

    /// Stable string key, used for class labels.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<serde_json::Value> for Cell {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            Value::String(s) => Self::Text(s),
            other => Self::Text(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<Cell>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Cell>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// All values as floats, failing on the first non-numeric cell.
    pub fn to_f64(&self) -> Result<Vec<f64>, FrameError> {
        self.values
            .iter()
            .enumerate()
            .map(|(row, cell)| {
                cell.as_f64().ok_or_else(|| FrameError::NotNumeric {
                    column: self.name.clone(),
                    row,
                })
            })
            .collect()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("column {column:?} has {found} rows, expected {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },

    #[error("duplicate column name {0:?}")]
    DuplicateColumn(String),

    #[error("unknown column {0:?}")]
    UnknownColumn(String),

    #[error("row index {index} out of range for {len} rows")]
    RowOutOfRange { index: usize, len: usize },

    #[error("column index {index} out of range for {len} columns")]
    ColumnOutOfRange { index: usize, len: usize },

    #[error("cannot stack frames with different columns: {expected:?} vs {found:?}")]
    SchemaMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("column {column:?} is not numeric at row {row}")]
    NotNumeric { column: String, row: usize },
}

/// Ordered set of equally long, uniquely named columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Frame {
    columns: Vec<Column>,
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            columns: Vec<Column>,
        }
        let raw = Raw::deserialize(deserializer)?;
        Frame::new(raw.columns).map_err(serde::de::Error::custom)
    }
}

impl Frame {
    pub fn new(columns: Vec<Column>) -> Result<Self, FrameError> {
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(FrameError::DuplicateColumn(column.name.clone()));
            }
        }
        if let Some(first) = columns.first() {
            let expected = first.len();
            for column in &columns[1..] {
                if column.len() != expected {
                    return Err(FrameError::LengthMismatch {
                        column: column.name.clone(),
                        expected,
                        found: column.len(),
                    });
                }
            }
        }
        Ok(Self { columns })
    }

    /// Build from row-major data.
    pub fn from_rows(names: &[String], rows: Vec<Vec<Cell>>) -> Result<Self, FrameError> {
        let mut columns: Vec<Column> = names
            .iter()
            .map(|name| Column::new(name.clone(), Vec::with_capacity(rows.len())))
            .collect();
        for (row_index, row) in rows.into_iter().enumerate() {
            if row.len() != names.len() {
                return Err(FrameError::LengthMismatch {
                    column: format!("row {}", row_index),
                    expected: names.len(),
                    found: row.len(),
                });
            }
            for (column, cell) in columns.iter_mut().zip(row) {
                column.values.push(cell);
            }
        }
        Self::new(columns)
    }

    /// Same columns, zero rows.
    pub fn empty_like(&self) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .map(|c| Column::new(c.name.clone(), Vec::new()))
                .collect(),
        }
    }

    pub fn n_rows(&self) -> usize {
        self.columns.first().map(Column::len).unwrap_or(0)
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn into_columns(self) -> Vec<Column> {
        self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_at(&self, index: usize) -> Result<&Column, FrameError> {
        self.columns.get(index).ok_or(FrameError::ColumnOutOfRange {
            index,
            len: self.columns.len(),
        })
    }

    /// Row `index` as borrowed cells, in column order.
    pub fn row(&self, index: usize) -> Vec<&Cell> {
        self.columns.iter().map(|c| &c.values[index]).collect()
    }

    /// Columns by name, in the requested order.
    pub fn select(&self, names: &[String]) -> Result<Frame, FrameError> {
        let columns = names
            .iter()
            .map(|name| {
                self.column(name)
                    .cloned()
                    .ok_or_else(|| FrameError::UnknownColumn(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Frame::new(columns)
    }

    /// Rows by position, in the requested order.
    pub fn take_rows(&self, indices: &[usize]) -> Result<Frame, FrameError> {
        let len = self.n_rows();
        if let Some(&index) = indices.iter().find(|&&i| i >= len) {
            return Err(FrameError::RowOutOfRange { index, len });
        }
        Ok(Self {
            columns: self
                .columns
                .iter()
                .map(|c| {
                    Column::new(
                        c.name.clone(),
                        indices.iter().map(|&i| c.values[i].clone()).collect(),
                    )
                })
                .collect(),
        })
    }

    /// Contiguous row range `[start, end)`.
    pub fn slice_rows(&self, start: usize, end: usize) -> Result<Frame, FrameError> {
        let len = self.n_rows();
        if start > end || end > len {
            return Err(FrameError::RowOutOfRange { index: end, len });
        }
        Ok(Self {
            columns: self
                .columns
                .iter()
                .map(|c| Column::new(c.name.clone(), c.values[start..end].to_vec()))
                .collect(),
        })
    }

    /// Concatenate frames with identical column names vertically.
    pub fn vstack(frames: &[Frame]) -> Result<Frame, FrameError> {
        let Some(first) = frames.first() else {
            return Ok(Frame::default());
        };
        let names = first.column_names();
        let mut columns: Vec<Column> = names
            .iter()
            .map(|n| Column::new(n.clone(), Vec::new()))
            .collect();
        for frame in frames {
            let found = frame.column_names();
            if found != names {
                return Err(FrameError::SchemaMismatch {
                    expected: names,
                    found,
                });
            }
            for (target, source) in columns.iter_mut().zip(&frame.columns) {
                target.values.extend(source.values.iter().cloned());
            }
        }
        Ok(Self { columns })
    }

    /// Remove the named columns, keeping the order of the rest.
    pub fn drop_columns(&mut self, names: &[String]) -> Vec<Column> {
        let (dropped, kept): (Vec<Column>, Vec<Column>) = std::mem::take(&mut self.columns)
            .into_iter()
            .partition(|c| names.contains(&c.name));
        self.columns = kept;
        dropped
    }

    /// Splice `other`'s columns in at position `at`.
    pub fn insert_columns(&mut self, at: usize, other: Frame) -> Result<(), FrameError> {
        if at > self.columns.len() {
            return Err(FrameError::ColumnOutOfRange {
                index: at,
                len: self.columns.len(),
            });
        }
        if !self.columns.is_empty() && other.n_cols() > 0 && other.n_rows() != self.n_rows() {
            return Err(FrameError::LengthMismatch {
                column: other.columns[0].name.clone(),
                expected: self.n_rows(),
                found: other.n_rows(),
            });
        }
        for column in &other.columns {
            if self.column(&column.name).is_some() {
                return Err(FrameError::DuplicateColumn(column.name.clone()));
            }
        }
        let tail = self.columns.split_off(at);
        self.columns.extend(other.columns);
        self.columns.extend(tail);
        Ok(())
    }

    /// Append one column at the end.
    pub fn push_column(&mut self, column: Column) -> Result<(), FrameError> {
        let at = self.columns.len();
        self.insert_columns(at, Frame::new(vec![column])?)
    }
}
