//! Name to factory lookup for every component family.
//!
//! The registry is populated once at startup ([`ComponentRegistry::with_defaults`])
//! and shared read-only between the HTTP layer and the job worker.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::error::ErrorCode;

use super::{
    converters, explorers, loaders, metrics, models, optimizers, tasks, Converter, DataLoader,
    Explorer, Metric, Model, Optimizer, Params, Task,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Factories
// ═══════════════════════════════════════════════════════════════════════════════

pub type ConverterFactory =
    Arc<dyn Fn(&Params) -> anyhow::Result<Box<dyn Converter>> + Send + Sync>;
pub type ModelFactory = Arc<dyn Fn(&Params) -> anyhow::Result<Box<dyn Model>> + Send + Sync>;
pub type ModelLoader = Arc<dyn Fn(&Path) -> anyhow::Result<Box<dyn Model>> + Send + Sync>;
pub type MetricFactory = Arc<dyn Fn() -> Box<dyn Metric> + Send + Sync>;
pub type OptimizerFactory =
    Arc<dyn Fn(&Params) -> anyhow::Result<Box<dyn Optimizer>> + Send + Sync>;
pub type TaskFactory = Arc<dyn Fn() -> Box<dyn Task> + Send + Sync>;
pub type ExplorerFactory =
    Arc<dyn Fn(&Params) -> anyhow::Result<Box<dyn Explorer>> + Send + Sync>;
pub type LoaderFactory = Arc<dyn Fn() -> Box<dyn DataLoader> + Send + Sync>;

/// Component family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Converter,
    Model,
    Metric,
    Optimizer,
    Task,
    Explorer,
    DataLoader,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Converter => "converter",
            Self::Model => "model",
            Self::Metric => "metric",
            Self::Optimizer => "optimizer",
            Self::Task => "task",
            Self::Explorer => "explorer",
            Self::DataLoader => "dataloader",
        };
        f.write_str(name)
    }
}

enum Entry {
    Converter(ConverterFactory),
    Model { create: ModelFactory, load: ModelLoader },
    Metric { create: MetricFactory, tasks: Vec<String> },
    Optimizer(OptimizerFactory),
    Task(TaskFactory),
    Explorer(ExplorerFactory),
    DataLoader(LoaderFactory),
}

impl Entry {
    fn kind(&self) -> ComponentKind {
        match self {
            Self::Converter(_) => ComponentKind::Converter,
            Self::Model { .. } => ComponentKind::Model,
            Self::Metric { .. } => ComponentKind::Metric,
            Self::Optimizer(_) => ComponentKind::Optimizer,
            Self::Task(_) => ComponentKind::Task,
            Self::Explorer(_) => ComponentKind::Explorer,
            Self::DataLoader(_) => ComponentKind::DataLoader,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Component {0} not found in the registry")]
    NotFound(String),

    #[error("Component {name} is a {found}, expected a {expected}")]
    KindMismatch {
        name: String,
        expected: ComponentKind,
        found: ComponentKind,
    },

    #[error("Invalid parameters for component {name}: {reason}")]
    InvalidParameters { name: String, reason: String },
}

impl RegistryError {
    /// Error code reported when a job fails on this lookup.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::ComponentNotFound,
            Self::KindMismatch { .. } => ErrorCode::ComponentKindMismatch,
            Self::InvalidParameters { .. } => ErrorCode::InvalidComponentParameters,
        }
    }

    fn mismatch(name: &str, expected: ComponentKind, found: &Entry) -> Self {
        Self::KindMismatch {
            name: name.to_string(),
            expected,
            found: found.kind(),
        }
    }

    fn invalid(name: &str, err: anyhow::Error) -> Self {
        Self::InvalidParameters {
            name: name.to_string(),
            reason: format!("{:#}", err),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Component Registry
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct ComponentRegistry {
    entries: HashMap<String, Entry>,
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("ComponentRegistry")
            .field("components", &names)
            .finish()
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in component.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        converters::register(&mut registry);
        models::register(&mut registry);
        metrics::register(&mut registry);
        optimizers::register(&mut registry);
        tasks::register(&mut registry);
        explorers::register(&mut registry);
        loaders::register(&mut registry);
        debug!(components = registry.entries.len(), "Component registry ready");
        registry
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────────

    fn insert(&mut self, name: &str, entry: Entry) {
        self.entries.insert(name.to_string(), entry);
    }

    pub fn register_converter<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Params) -> anyhow::Result<Box<dyn Converter>> + Send + Sync + 'static,
    {
        self.insert(name, Entry::Converter(Arc::new(factory)));
    }

    pub fn register_model<F, L>(&mut self, name: &str, create: F, load: L)
    where
        F: Fn(&Params) -> anyhow::Result<Box<dyn Model>> + Send + Sync + 'static,
        L: Fn(&Path) -> anyhow::Result<Box<dyn Model>> + Send + Sync + 'static,
    {
        self.insert(
            name,
            Entry::Model {
                create: Arc::new(create),
                load: Arc::new(load),
            },
        );
    }

    /// Register a metric usable by the listed task names.
    pub fn register_metric<F>(&mut self, name: &str, tasks: &[&str], create: F)
    where
        F: Fn() -> Box<dyn Metric> + Send + Sync + 'static,
    {
        self.insert(
            name,
            Entry::Metric {
                create: Arc::new(create),
                tasks: tasks.iter().map(|t| t.to_string()).collect(),
            },
        );
    }

    pub fn register_optimizer<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Params) -> anyhow::Result<Box<dyn Optimizer>> + Send + Sync + 'static,
    {
        self.insert(name, Entry::Optimizer(Arc::new(factory)));
    }

    pub fn register_task<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Task> + Send + Sync + 'static,
    {
        self.insert(name, Entry::Task(Arc::new(factory)));
    }

    pub fn register_explorer<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Params) -> anyhow::Result<Box<dyn Explorer>> + Send + Sync + 'static,
    {
        self.insert(name, Entry::Explorer(Arc::new(factory)));
    }

    pub fn register_loader<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn DataLoader> + Send + Sync + 'static,
    {
        self.insert(name, Entry::DataLoader(Arc::new(factory)));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lookup
    // ─────────────────────────────────────────────────────────────────────────

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn kind_of(&self, name: &str) -> Option<ComponentKind> {
        self.entries.get(name).map(Entry::kind)
    }

    /// Registered names of one family, sorted.
    pub fn names(&self, kind: ComponentKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.kind() == kind)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn lookup(&self, name: &str) -> Result<&Entry, RegistryError> {
        self.entries
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn converter(&self, name: &str, params: &Params) -> Result<Box<dyn Converter>, RegistryError> {
        match self.lookup(name)? {
            Entry::Converter(factory) => factory(params).map_err(|e| RegistryError::invalid(name, e)),
            other => Err(RegistryError::mismatch(name, ComponentKind::Converter, other)),
        }
    }

    /// Factory for repeated model construction, used by optimizers.
    pub fn model_factory(&self, name: &str) -> Result<ModelFactory, RegistryError> {
        match self.lookup(name)? {
            Entry::Model { create, .. } => Ok(Arc::clone(create)),
            other => Err(RegistryError::mismatch(name, ComponentKind::Model, other)),
        }
    }

    pub fn model(&self, name: &str, params: &Params) -> Result<Box<dyn Model>, RegistryError> {
        let create = self.model_factory(name)?;
        create(params).map_err(|e| RegistryError::invalid(name, e))
    }

    /// Reload a model previously written with [`Model::save`].
    pub fn load_model(&self, name: &str, path: &Path) -> anyhow::Result<Box<dyn Model>> {
        match self.lookup(name)? {
            Entry::Model { load, .. } => load(path),
            other => Err(RegistryError::mismatch(name, ComponentKind::Model, other).into()),
        }
    }

    pub fn metric(&self, name: &str) -> Result<Box<dyn Metric>, RegistryError> {
        match self.lookup(name)? {
            Entry::Metric { create, .. } => Ok(create()),
            other => Err(RegistryError::mismatch(name, ComponentKind::Metric, other)),
        }
    }

    /// Every metric compatible with `task`, sorted by name.
    pub fn metrics_for_task(&self, task: &str) -> Vec<(String, Box<dyn Metric>)> {
        let mut found: Vec<(String, Box<dyn Metric>)> = self
            .entries
            .iter()
            .filter_map(|(name, entry)| match entry {
                Entry::Metric { create, tasks } if tasks.iter().any(|t| t == task) => {
                    Some((name.clone(), create()))
                }
                _ => None,
            })
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    pub fn optimizer(&self, name: &str, params: &Params) -> Result<Box<dyn Optimizer>, RegistryError> {
        match self.lookup(name)? {
            Entry::Optimizer(factory) => factory(params).map_err(|e| RegistryError::invalid(name, e)),
            other => Err(RegistryError::mismatch(name, ComponentKind::Optimizer, other)),
        }
    }

    pub fn task(&self, name: &str) -> Result<Box<dyn Task>, RegistryError> {
        match self.lookup(name)? {
            Entry::Task(factory) => Ok(factory()),
            other => Err(RegistryError::mismatch(name, ComponentKind::Task, other)),
        }
    }

    pub fn explorer(&self, name: &str, params: &Params) -> Result<Box<dyn Explorer>, RegistryError> {
        match self.lookup(name)? {
            Entry::Explorer(factory) => factory(params).map_err(|e| RegistryError::invalid(name, e)),
            other => Err(RegistryError::mismatch(name, ComponentKind::Explorer, other)),
        }
    }

    pub fn loader(&self, name: &str) -> Result<Box<dyn DataLoader>, RegistryError> {
        match self.lookup(name)? {
            Entry::DataLoader(factory) => Ok(factory()),
            other => Err(RegistryError::mismatch(name, ComponentKind::DataLoader, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_cover_every_family() {
        let registry = ComponentRegistry::with_defaults();
        assert_eq!(registry.kind_of("StandardScaler"), Some(ComponentKind::Converter));
        assert_eq!(registry.kind_of("KNeighborsClassifier"), Some(ComponentKind::Model));
        assert_eq!(registry.kind_of("Accuracy"), Some(ComponentKind::Metric));
        assert_eq!(registry.kind_of("RandomSearchOptimizer"), Some(ComponentKind::Optimizer));
        assert_eq!(registry.kind_of("TabularClassificationTask"), Some(ComponentKind::Task));
        assert_eq!(registry.kind_of("DescribeExplorer"), Some(ComponentKind::Explorer));
        assert_eq!(registry.kind_of("CSVDataLoader"), Some(ComponentKind::DataLoader));
    }

    #[test]
    fn test_lookup_errors() {
        let registry = ComponentRegistry::with_defaults();
        assert!(matches!(
            registry.converter("Nope", &Params::new()),
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            registry.converter("Accuracy", &Params::new()),
            Err(RegistryError::KindMismatch {
                expected: ComponentKind::Converter,
                found: ComponentKind::Metric,
                ..
            })
        ));

        let bad = json!({"n_neighbors": "five"});
        let err = registry
            .model("KNeighborsClassifier", bad.as_object().unwrap())
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::InvalidParameters { .. }));
    }

    #[test]
    fn test_error_codes_per_variant() {
        let registry = ComponentRegistry::with_defaults();
        let code = |r: Result<Box<dyn Task>, RegistryError>| r.err().map(|e| e.code());
        assert_eq!(code(registry.task("Nope")), Some(ErrorCode::ComponentNotFound));
        assert_eq!(code(registry.task("CSVDataLoader")), Some(ErrorCode::ComponentKindMismatch));
        let bad = json!({"n_trials": 0});
        let err = registry
            .optimizer("RandomSearchOptimizer", bad.as_object().unwrap())
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::InvalidComponentParameters);
    }

    #[test]
    fn test_metrics_for_task_are_filtered_and_sorted() {
        let registry = ComponentRegistry::with_defaults();
        let names: Vec<String> = registry
            .metrics_for_task("TabularClassificationTask")
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["Accuracy".to_string()]);
        assert!(registry.metrics_for_task("TranslationTask").is_empty());
    }

    #[test]
    fn test_names_by_kind() {
        let registry = ComponentRegistry::with_defaults();
        let models = registry.names(ComponentKind::Model);
        assert_eq!(
            models,
            vec!["DummyClassifier", "DummyRegressor", "KNeighborsClassifier"]
        );
    }
}
