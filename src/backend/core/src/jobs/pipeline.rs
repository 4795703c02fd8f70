//! Converter-list specs and the scoped apply/splice algorithm.
//!
//! A spec is persisted as `{ name: { order, params, scope, children, component } }`.
//! Entries run in ascending `order`. A `Pipeline` entry groups its `children`
//! under one scope; the flat form `Pipeline` + `params.steps = N`, where the
//! next `N` entries by order are the stages, resolves to the same tree.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, warn};

use super::{JobError, JobStage, ResolveExt, StageExt};
use crate::components::converters::Pipeline;
use crate::components::{ComponentRegistry, Converter, Params};
use crate::dataset::{Column, Frame};

/// Reserved name of the composite converter.
pub const PIPELINE: &str = "Pipeline";

// ═══════════════════════════════════════════════════════════════════════════════
// Persisted Spec
// ═══════════════════════════════════════════════════════════════════════════════

/// 1-based column and row positions in the original dataset; empty means all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterScope {
    pub columns: Vec<i64>,
    pub rows: Vec<i64>,
}

/// A converter nested under a `Pipeline` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConverterNode {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default)]
    pub params: Params,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ConverterNode>,
}

/// One top-level entry of a converter list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConverterEntry {
    pub order: i64,
    /// Registry name when it differs from the entry key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub scope: ConverterScope,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ConverterNode>,
}

fn component_name<'a>(name: &'a str, component: &'a Option<String>) -> &'a str {
    component.as_deref().unwrap_or(name)
}

/// Parse and order the entries of a persisted spec.
pub fn parse_spec(spec: &Value) -> Result<Vec<(String, ConverterEntry)>, JobError> {
    let object = spec.as_object().ok_or_else(|| {
        JobError::new(JobStage::ResolveComponent, "Converter list must be a JSON object")
    })?;
    let mut entries = object
        .iter()
        .map(|(name, raw)| {
            serde_json::from_value::<ConverterEntry>(raw.clone())
                .map(|entry| (name.clone(), entry))
                .stage_with(JobStage::ResolveComponent, || {
                    format!("Invalid converter entry {}", name)
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    // Stable sort keeps the persisted key order among equal `order`s.
    entries.sort_by_key(|(_, entry)| entry.order);
    Ok(entries)
}

/// Rewrite flat `Pipeline` + `steps` runs into explicit children.
pub fn nest_pipelines(
    entries: Vec<(String, ConverterEntry)>,
) -> Result<Vec<(String, ConverterEntry)>, JobError> {
    let mut nested = Vec::with_capacity(entries.len());
    let mut iter = entries.into_iter();
    while let Some((name, mut entry)) = iter.next() {
        let is_pipeline = component_name(&name, &entry.component) == PIPELINE;
        if is_pipeline && entry.children.is_empty() {
            let steps = entry
                .params
                .get("steps")
                .and_then(Value::as_u64)
                .ok_or_else(|| {
                    JobError::new(
                        JobStage::ResolveComponent,
                        format!("Pipeline {} needs children or an integer params.steps", name),
                    )
                })? as usize;
            for _ in 0..steps {
                let (child_name, child) = iter.next().ok_or_else(|| {
                    JobError::new(
                        JobStage::ResolveComponent,
                        format!("Pipeline {} declares {} steps but fewer entries follow", name, steps),
                    )
                })?;
                entry.children.push(ConverterNode {
                    name: child_name,
                    component: child.component,
                    params: child.params,
                    children: child.children,
                });
            }
        }
        nested.push((name, entry));
    }
    Ok(nested)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Planning
// ═══════════════════════════════════════════════════════════════════════════════

/// 0-based, sorted, de-duplicated positions; empty means all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedScope {
    pub columns: Vec<usize>,
    pub rows: Vec<usize>,
}

/// Convert 1-based positions, rejecting anything outside `[1, len]`.
pub fn resolve_indices(raw: &[i64], len: usize, what: &str) -> Result<Vec<usize>, JobError> {
    let mut out = BTreeSet::new();
    for &index in raw {
        if index < 1 || index as u64 > len as u64 {
            return Err(JobError::new(
                JobStage::ResolveScope,
                format!("Scope {} index {} is out of bounds [1, {}]", what, index, len),
            ));
        }
        out.insert(index as usize - 1);
    }
    Ok(out.into_iter().collect())
}

pub fn resolve_scope(
    scope: &ConverterScope,
    n_columns: usize,
    n_rows: usize,
) -> Result<ResolvedScope, JobError> {
    Ok(ResolvedScope {
        columns: resolve_indices(&scope.columns, n_columns, "column")?,
        rows: resolve_indices(&scope.rows, n_rows, "row")?,
    })
}

/// A converter instance ready to run under its scope.
pub struct PlannedConverter {
    pub name: String,
    pub converter: Box<dyn Converter>,
    pub scope: ResolvedScope,
}

impl std::fmt::Debug for PlannedConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannedConverter")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

fn instantiate(
    registry: &ComponentRegistry,
    name: &str,
    component: &Option<String>,
    params: &Params,
    children: &[ConverterNode],
) -> Result<Box<dyn Converter>, JobError> {
    let component = component_name(name, component);
    if component == PIPELINE {
        let stages = children
            .iter()
            .map(|child| {
                instantiate(
                    registry,
                    &child.name,
                    &child.component,
                    &child.params,
                    &child.children,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Box::new(Pipeline::new(stages)));
    }
    registry
        .converter(component, params)
        .resolve_with(|| {
            format!("Converter {} could not be instantiated", name)
        })
}

/// Instantiate every entry of a spec against a dataset of the given shape.
pub fn build_plan(
    registry: &ComponentRegistry,
    spec: &Value,
    n_columns: usize,
    n_rows: usize,
) -> Result<Vec<PlannedConverter>, JobError> {
    let entries = nest_pipelines(parse_spec(spec)?)?;
    entries
        .into_iter()
        .map(|(name, entry)| {
            let scope = resolve_scope(&entry.scope, n_columns, n_rows)?;
            let converter =
                instantiate(registry, &name, &entry.component, &entry.params, &entry.children)?;
            Ok(PlannedConverter {
                name,
                converter,
                scope,
            })
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Application
// ═══════════════════════════════════════════════════════════════════════════════

/// Apply one planned converter to the working table in place.
///
/// Scope columns are named through `original_columns` and then looked up by
/// name in the current table. The converter is fitted on the scoped rows,
/// transforms every row, and its output replaces the scope columns at the
/// position of the first of them.
pub fn apply_converter(
    table: &mut Frame,
    original_columns: &[String],
    target: &str,
    planned: &mut PlannedConverter,
) -> Result<(), JobError> {
    let name = planned.name.clone();
    let scope_names: Vec<String> = if planned.scope.columns.is_empty() {
        table.column_names()
    } else {
        planned
            .scope
            .columns
            .iter()
            .map(|&index| {
                let column = original_columns.get(index).cloned().ok_or_else(|| {
                    JobError::new(
                        JobStage::ResolveScope,
                        format!("Scope column {} of converter {} is out of bounds", index + 1, name),
                    )
                })?;
                match table.column_at(index) {
                    Ok(current) if current.name != column => warn!(
                        converter = %name,
                        index = index + 1,
                        original = %column,
                        current = %current.name,
                        "Scope column moved since the dataset was loaded"
                    ),
                    _ => {}
                }
                Ok(column)
            })
            .collect::<Result<_, JobError>>()?
    };

    let n_rows = table.n_rows();
    let rows: Vec<usize> = if planned.scope.rows.is_empty() {
        (0..n_rows).collect()
    } else {
        planned.scope.rows.clone()
    };

    let target_column = table.column(target).cloned().ok_or_else(|| {
        JobError::new(
            JobStage::ResolveScope,
            format!("Target column {} is no longer present before converter {}", target, name),
        )
    })?;
    let x_all = table.select(&scope_names).stage_with(JobStage::ResolveScope, || {
        format!("Scope of converter {} names a column that no longer exists", name)
    })?;

    let x_fit = x_all.take_rows(&rows).stage(JobStage::ResolveScope, "Scope rows out of range")?;
    let y_fit = Column::new(
        target_column.name.clone(),
        rows.iter().map(|&r| target_column.values[r].clone()).collect(),
    );
    planned
        .converter
        .fit(&x_fit, &y_fit)
        .stage_with(JobStage::Fit, || format!("Converter {} failed to fit", name))?;

    let transformed = planned
        .converter
        .transform(&x_all, &target_column)
        .stage_with(JobStage::Transform, || format!("Converter {} failed to transform", name))?;
    if transformed.n_cols() > 0 && transformed.n_rows() != n_rows {
        return Err(JobError::new(
            JobStage::Transform,
            format!(
                "Converter {} returned {} rows, expected {}",
                name,
                transformed.n_rows(),
                n_rows
            ),
        ));
    }

    let position = scope_names
        .iter()
        .filter_map(|n| table.column_index(n))
        .min()
        .unwrap_or(table.n_cols());
    table.drop_columns(&scope_names);
    let position = position.min(table.n_cols());
    let added = transformed.n_cols();
    table.insert_columns(position, transformed).stage_with(JobStage::Transform, || {
        format!("Output of converter {} could not be spliced into the dataset", name)
    })?;

    debug!(
        converter = %name,
        dropped = scope_names.len(),
        added,
        columns = table.n_cols(),
        "Converter applied"
    );
    Ok(())
}

/// Apply every planned converter in order.
pub fn apply_plan(
    table: &mut Frame,
    original_columns: &[String],
    target: &str,
    plan: &mut [PlannedConverter],
) -> Result<(), JobError> {
    for planned in plan.iter_mut() {
        apply_converter(table, original_columns, target, planned)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Cell;
    use crate::error::ErrorCode;
    use serde_json::json;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn table() -> Frame {
        Frame::new(vec![
            Column::new("a", vec![1.0.into(), 2.0.into(), 3.0.into(), 4.0.into()]),
            Column::new("b", vec!["x".into(), "y".into(), "x".into(), "y".into()]),
            Column::new("c", vec![Cell::Int(7); 4]),
            Column::new("target", vec![Cell::Int(0), Cell::Int(1), Cell::Int(0), Cell::Int(1)]),
        ])
        .unwrap()
    }

    #[test]
    fn test_parse_sorts_by_order() {
        let spec = json!({
            "MinMaxScaler": {"order": 2},
            "StandardScaler": {"order": 1, "scope": {"columns": [1]}},
        });
        let entries = parse_spec(&spec).unwrap();
        assert_eq!(entries[0].0, "StandardScaler");
        assert_eq!(entries[0].1.scope.columns, vec![1]);
        assert_eq!(entries[1].0, "MinMaxScaler");
    }

    #[test]
    fn test_flat_pipeline_becomes_children() {
        let spec = json!({
            "Pipeline": {"order": 1, "params": {"steps": 2}, "scope": {"columns": [2]}},
            "LabelBinarizer": {"order": 2},
            "StandardScaler": {"order": 3},
            "MinMaxScaler": {"order": 4},
        });
        let nested = nest_pipelines(parse_spec(&spec).unwrap()).unwrap();
        assert_eq!(nested.len(), 2);
        let children: Vec<&str> = nested[0].1.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(children, vec!["LabelBinarizer", "StandardScaler"]);
        assert_eq!(nested[1].0, "MinMaxScaler");

        let short = json!({"Pipeline": {"order": 1, "params": {"steps": 3}}});
        assert!(nest_pipelines(parse_spec(&short).unwrap()).is_err());
    }

    #[test]
    fn test_scope_is_zero_based_sorted_unique() {
        let scope = ConverterScope {
            columns: vec![3, 1, 3],
            rows: vec![],
        };
        let resolved = resolve_scope(&scope, 4, 10).unwrap();
        assert_eq!(resolved.columns, vec![0, 2]);
        assert!(resolved.rows.is_empty());

        let out = ConverterScope {
            columns: vec![5],
            rows: vec![],
        };
        let err = resolve_scope(&out, 4, 10).unwrap_err();
        assert_eq!(err.stage(), JobStage::ResolveScope);
        assert!(resolve_indices(&[0], 4, "row").is_err());
    }

    #[test]
    fn test_widening_converter_splices_at_first_scope_column() {
        let registry = ComponentRegistry::with_defaults();
        let original = table().column_names();
        let spec = json!({"LabelBinarizer": {"order": 1, "scope": {"columns": [2]}}});
        let mut plan = build_plan(&registry, &spec, 4, 4).unwrap();

        let mut working = table();
        apply_plan(&mut working, &original, "target", &mut plan).unwrap();
        assert_eq!(working.column_names(), names(&["a", "b_x", "b_y", "c", "target"]));
        assert_eq!(working.n_rows(), 4);
        assert_eq!(working.column("c"), table().column("c"));
    }

    #[test]
    fn test_fit_uses_scoped_rows_only() {
        let registry = ComponentRegistry::with_defaults();
        let original = table().column_names();
        // Fitted on rows 1-2 (a = 1, 2), applied to all rows.
        let spec = json!({"MinMaxScaler": {"order": 1, "scope": {"columns": [1], "rows": [2, 1]}}});
        let mut plan = build_plan(&registry, &spec, 4, 4).unwrap();

        let mut working = table();
        apply_plan(&mut working, &original, "target", &mut plan).unwrap();
        let a: Vec<f64> = working.column("a").unwrap().to_f64().unwrap();
        assert_eq!(a, vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_dropping_converter_narrows_table() {
        let registry = ComponentRegistry::with_defaults();
        let original = table().column_names();
        let spec = json!({"DropColumns": {"order": 1, "scope": {"columns": [2, 3]}}});
        let mut plan = build_plan(&registry, &spec, 4, 4).unwrap();

        let mut working = table();
        apply_plan(&mut working, &original, "target", &mut plan).unwrap();
        assert_eq!(working.column_names(), names(&["a", "target"]));
    }

    #[test]
    fn test_nested_pipeline_applies_in_sequence() {
        let registry = ComponentRegistry::with_defaults();
        let original = table().column_names();
        let spec = json!({
            "encode": {
                "order": 1,
                "component": "Pipeline",
                "scope": {"columns": [2]},
                "children": [
                    {"name": "LabelBinarizer"},
                    {"name": "MinMaxScaler", "params": {"feature_range": [0.0, 10.0]}}
                ]
            }
        });
        let mut plan = build_plan(&registry, &spec, 4, 4).unwrap();
        let mut working = table();
        apply_plan(&mut working, &original, "target", &mut plan).unwrap();
        assert_eq!(
            working.column("b_x").unwrap().to_f64().unwrap(),
            vec![10.0, 0.0, 10.0, 0.0]
        );
    }

    #[test]
    fn test_unknown_converter_and_dropped_target() {
        let registry = ComponentRegistry::with_defaults();
        let unknown = json!({"Sharpen": {"order": 1}});
        let err = build_plan(&registry, &unknown, 4, 4).unwrap_err();
        assert_eq!(err.stage(), JobStage::ResolveComponent);
        assert_eq!(err.code(), ErrorCode::ComponentNotFound);
        let inverted = json!({"MinMaxScaler": {"order": 1, "params": {"feature_range": [2.0, 1.0]}}});
        let err = build_plan(&registry, &inverted, 4, 4).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidComponentParameters);

        let original = table().column_names();
        let spec = json!({
            "DropColumns": {"order": 1, "scope": {"columns": [4]}},
            "StandardScaler": {"order": 2, "scope": {"columns": [1]}},
        });
        let mut plan = build_plan(&registry, &spec, 4, 4).unwrap();
        let mut working = table();
        let err = apply_plan(&mut working, &original, "target", &mut plan).unwrap_err();
        assert_eq!(err.stage(), JobStage::ResolveScope);
    }
}
