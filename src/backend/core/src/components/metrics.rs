//! Built-in scoring metrics.

use anyhow::{anyhow, bail};

use super::registry::ComponentRegistry;
use super::tasks::{CLASSIFICATION_TASK, REGRESSION_TASK};
use super::Metric;
use crate::dataset::Cell;

pub(super) fn register(registry: &mut ComponentRegistry) {
    registry.register_metric("Accuracy", &[CLASSIFICATION_TASK], || Box::new(Accuracy));
    registry.register_metric("MeanAbsoluteError", &[REGRESSION_TASK], || {
        Box::new(MeanAbsoluteError)
    });
}

fn check(y_true: &[Cell], y_pred: &[Cell]) -> anyhow::Result<()> {
    if y_true.len() != y_pred.len() {
        bail!(
            "y_true has {} values but y_pred has {}",
            y_true.len(),
            y_pred.len()
        );
    }
    if y_true.is_empty() {
        bail!("cannot score an empty split");
    }
    Ok(())
}

/// Share of exact label matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct Accuracy;

impl Metric for Accuracy {
    fn score(&self, y_true: &[Cell], y_pred: &[Cell]) -> anyhow::Result<f64> {
        check(y_true, y_pred)?;
        let hits = y_true
            .iter()
            .zip(y_pred)
            .filter(|(t, p)| t.label() == p.label())
            .count();
        Ok(hits as f64 / y_true.len() as f64)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MeanAbsoluteError;

impl Metric for MeanAbsoluteError {
    fn score(&self, y_true: &[Cell], y_pred: &[Cell]) -> anyhow::Result<f64> {
        check(y_true, y_pred)?;
        let mut total = 0.0;
        for (row, (t, p)) in y_true.iter().zip(y_pred).enumerate() {
            let t = t.as_f64().ok_or_else(|| anyhow!("y_true is not numeric at row {row}"))?;
            let p = p.as_f64().ok_or_else(|| anyhow!("y_pred is not numeric at row {row}"))?;
            total += (t - p).abs();
        }
        Ok(total / y_true.len() as f64)
    }

    fn greater_is_better(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accuracy() {
        let y_true = vec![Cell::Int(1), Cell::Int(0), Cell::Int(1), Cell::Int(1)];
        let y_pred = vec![Cell::Int(1), Cell::Int(1), Cell::Int(1), Cell::Int(0)];
        assert_eq!(Accuracy.score(&y_true, &y_pred).unwrap(), 0.5);
        assert!(Accuracy.greater_is_better());
    }

    #[test]
    fn test_mae_lower_is_better() {
        let y_true = vec![Cell::Float(1.0), Cell::Float(3.0)];
        let y_pred = vec![Cell::Float(2.0), Cell::Int(1)];
        assert_eq!(MeanAbsoluteError.score(&y_true, &y_pred).unwrap(), 1.5);
        assert!(!MeanAbsoluteError.greater_is_better());
    }

    #[test]
    fn test_length_mismatch_and_empty() {
        assert!(Accuracy.score(&[Cell::Int(1)], &[]).is_err());
        assert!(Accuracy.score(&[], &[]).is_err());
    }
}
