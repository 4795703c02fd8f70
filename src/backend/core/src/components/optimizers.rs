//! Hyperparameter search.

use anyhow::{bail, Context};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use super::registry::ComponentRegistry;
use super::{parse_params, Model, OptimizationProblem, Optimizer, Params};

pub(super) fn register(registry: &mut ComponentRegistry) {
    registry.register_optimizer("RandomSearchOptimizer", |params| {
        Ok(Box::new(RandomSearchOptimizer::new(parse_params(params)?)?))
    });
}

/// Inclusive bounds of one optimizable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamRange {
    pub lower: f64,
    pub upper: f64,
    /// Sample whole numbers only.
    pub integer: bool,
}

impl ParamRange {
    fn sample(&self, rng: &mut StdRng) -> Value {
        if self.integer {
            let lower = self.lower.ceil() as i64;
            let upper = (self.upper.floor() as i64).max(lower);
            Value::from(rng.gen_range(lower..=upper))
        } else if self.upper > self.lower {
            Value::from(rng.gen_range(self.lower..=self.upper))
        } else {
            Value::from(self.lower)
        }
    }
}

pub type SearchSpace = BTreeMap<String, ParamRange>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub number: usize,
    pub params: Params,
    pub score: f64,
}

/// Best refitted model plus the full trial history.
pub struct OptimizationResult {
    pub model: Box<dyn Model>,
    pub trials: Vec<Trial>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RandomSearchParams {
    pub n_trials: usize,
    pub seed: Option<u64>,
}

impl Default for RandomSearchParams {
    fn default() -> Self {
        Self {
            n_trials: 10,
            seed: None,
        }
    }
}

/// Uniform random sampling of the search space. Candidates are fitted on
/// train and scored on validation (train when validation is empty).
#[derive(Debug)]
pub struct RandomSearchOptimizer {
    n_trials: usize,
    rng: StdRng,
}

impl RandomSearchOptimizer {
    pub fn new(params: RandomSearchParams) -> anyhow::Result<Self> {
        if params.n_trials == 0 {
            bail!("n_trials must be at least 1");
        }
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            n_trials: params.n_trials,
            rng,
        })
    }
}

impl Optimizer for RandomSearchOptimizer {
    fn optimize(&mut self, problem: OptimizationProblem<'_>) -> anyhow::Result<OptimizationResult> {
        let (x_eval, y_eval) = if problem.y.validation.is_empty() {
            (&problem.x.train, &problem.y.train)
        } else {
            (&problem.x.validation, &problem.y.validation)
        };

        let mut trials = Vec::with_capacity(self.n_trials);
        let mut best: Option<(f64, Box<dyn Model>)> = None;
        for number in 0..self.n_trials {
            let sampled: Params = problem
                .search_space
                .iter()
                .map(|(name, range)| (name.clone(), range.sample(&mut self.rng)))
                .collect();
            let mut params = problem.fixed.clone();
            params.extend(sampled.clone());

            let mut model = (problem.build)(&params)
                .with_context(|| format!("trial {number}: invalid parameters"))?;
            model
                .fit(&problem.x.train, &problem.y.train)
                .with_context(|| format!("trial {number}: fit failed"))?;
            let predictions = model.predict(x_eval)?;
            let score = problem.goal.score(&y_eval.values, &predictions)?;
            debug!(trial = number, score, "Optimization trial finished");

            let better = match &best {
                None => true,
                Some((best_score, _)) if problem.goal.greater_is_better() => score > *best_score,
                Some((best_score, _)) => score < *best_score,
            };
            if better {
                best = Some((score, model));
            }
            trials.push(Trial {
                number,
                params: sampled,
                score,
            });
        }

        let (_, model) = best.context("optimizer ran no trials")?;
        Ok(OptimizationResult { model, trials })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::metrics::Accuracy;
    use crate::dataset::{Cell, Column, Frame, Splits};
    use serde_json::json;

    fn data() -> (Splits<Frame>, Splits<Column>) {
        let x = Frame::new(vec![Column::new(
            "f",
            (0..20).map(|i| Cell::Float(i as f64)).collect(),
        )])
        .unwrap();
        let y = Column::new("y", (0..20).map(|i| Cell::Int((i >= 10) as i64)).collect());
        (
            Splits {
                train: x.clone(),
                test: x.clone(),
                validation: x,
            },
            Splits {
                train: y.clone(),
                test: y.clone(),
                validation: y,
            },
        )
    }

    #[test]
    fn test_random_search_records_every_trial() {
        let registry = ComponentRegistry::with_defaults();
        let build = registry.model_factory("KNeighborsClassifier").unwrap();
        let build = |params: &Params| build(params);
        let (x, y) = data();
        let mut space = SearchSpace::new();
        space.insert(
            "n_neighbors".to_string(),
            ParamRange {
                lower: 1.0,
                upper: 3.0,
                integer: true,
            },
        );

        let mut optimizer = RandomSearchOptimizer::new(RandomSearchParams {
            n_trials: 4,
            seed: Some(11),
        })
        .unwrap();
        let result = optimizer
            .optimize(OptimizationProblem {
                build: &build,
                fixed: &Params::new(),
                search_space: &space,
                x: &x,
                y: &y,
                goal: &Accuracy,
            })
            .unwrap();

        assert_eq!(result.trials.len(), 4);
        for trial in &result.trials {
            let k = trial.params["n_neighbors"].as_i64().unwrap();
            assert!((1..=3).contains(&k));
        }
        let preds = result.model.predict(&x.train).unwrap();
        assert_eq!(preds.len(), 20);
    }

    #[test]
    fn test_params_validation() {
        assert!(RandomSearchOptimizer::new(RandomSearchParams {
            n_trials: 0,
            seed: None
        })
        .is_err());
        let registry = ComponentRegistry::with_defaults();
        let params = json!({"n_trials": 3, "seed": 1});
        assert!(registry
            .optimizer("RandomSearchOptimizer", params.as_object().unwrap())
            .is_ok());
    }
}
