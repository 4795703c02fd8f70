//! PostgreSQL record store using sqlx.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::path::PathBuf;
use std::time::Duration;

use super::{
    ConverterList, DatasetRecord, Experiment, Exploration, Explorer, NewDataset, RecordId,
    RecordKind, RecordRef, RecordStatus, RecordStore, Run, SplitFractions, StatusTrack,
};
use crate::config::DatabaseConfig;
use crate::error::{ErrorCode, LabError, Result};

/// Record store over a Postgres connection pool.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Create a new connection pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn status_table(kind: RecordKind) -> Option<&'static str> {
    match kind {
        RecordKind::Run => Some("runs"),
        RecordKind::ConverterList => Some("converter_lists"),
        RecordKind::Explorer => Some("explorers"),
        _ => None,
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn get_run(&self, id: RecordId) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, experiment_id, name, model_name, parameters, optimizer_name,
                   optimizer_parameters, goal_metric, train_metrics, validation_metrics,
                   test_metrics, run_path, trials_path, status, delivery_time, start_time,
                   end_time, created, last_modified
            FROM runs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Run::try_from).transpose()
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (id, experiment_id, name, model_name, parameters, optimizer_name,
                              optimizer_parameters, goal_metric, train_metrics,
                              validation_metrics, test_metrics, run_path, trials_path, status,
                              delivery_time, start_time, end_time, created, last_modified)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19)
            ON CONFLICT (id) DO UPDATE SET
                experiment_id = EXCLUDED.experiment_id,
                name = EXCLUDED.name,
                model_name = EXCLUDED.model_name,
                parameters = EXCLUDED.parameters,
                optimizer_name = EXCLUDED.optimizer_name,
                optimizer_parameters = EXCLUDED.optimizer_parameters,
                goal_metric = EXCLUDED.goal_metric,
                train_metrics = EXCLUDED.train_metrics,
                validation_metrics = EXCLUDED.validation_metrics,
                test_metrics = EXCLUDED.test_metrics,
                run_path = EXCLUDED.run_path,
                trials_path = EXCLUDED.trials_path,
                status = EXCLUDED.status,
                delivery_time = EXCLUDED.delivery_time,
                start_time = EXCLUDED.start_time,
                end_time = EXCLUDED.end_time,
                last_modified = EXCLUDED.last_modified
            "#,
        )
        .bind(run.id)
        .bind(run.experiment_id)
        .bind(&run.name)
        .bind(&run.model_name)
        .bind(Value::Object(run.parameters.clone()))
        .bind(&run.optimizer_name)
        .bind(Value::Object(run.optimizer_parameters.clone()))
        .bind(&run.goal_metric)
        .bind(&run.train_metrics)
        .bind(&run.validation_metrics)
        .bind(&run.test_metrics)
        .bind(path_string(&run.run_path))
        .bind(path_string(&run.trials_path))
        .bind(run.track.status.as_str())
        .bind(run.track.delivery_time)
        .bind(run.track.start_time)
        .bind(run.track.end_time)
        .bind(run.created)
        .bind(run.last_modified)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_experiment(&self, id: RecordId) -> Result<Option<Experiment>> {
        let row = sqlx::query_as::<_, ExperimentRow>(
            r#"
            SELECT id, dataset_id, task_name, input_columns, output_columns, splits, seed, created
            FROM experiments
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Experiment::try_from).transpose()
    }

    async fn save_experiment(&self, experiment: &Experiment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO experiments (id, dataset_id, task_name, input_columns, output_columns,
                                     splits, seed, created)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                dataset_id = EXCLUDED.dataset_id,
                task_name = EXCLUDED.task_name,
                input_columns = EXCLUDED.input_columns,
                output_columns = EXCLUDED.output_columns,
                splits = EXCLUDED.splits,
                seed = EXCLUDED.seed
            "#,
        )
        .bind(experiment.id)
        .bind(experiment.dataset_id)
        .bind(&experiment.task_name)
        .bind(serde_json::to_value(&experiment.input_columns)?)
        .bind(serde_json::to_value(&experiment.output_columns)?)
        .bind(serde_json::to_value(experiment.splits)?)
        .bind(experiment.seed.map(|s| s as i64))
        .bind(experiment.created)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_dataset(&self, id: RecordId) -> Result<Option<DatasetRecord>> {
        let row = sqlx::query_as::<_, DatasetRow>(
            "SELECT id, name, file_path, created, last_modified FROM datasets WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(DatasetRecord::from))
    }

    async fn save_dataset(&self, dataset: &DatasetRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO datasets (id, name, file_path, created, last_modified)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                file_path = EXCLUDED.file_path,
                last_modified = EXCLUDED.last_modified
            "#,
        )
        .bind(dataset.id)
        .bind(&dataset.name)
        .bind(dataset.file_path.to_string_lossy().into_owned())
        .bind(dataset.created)
        .bind(dataset.last_modified)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_dataset(&self, dataset: NewDataset) -> Result<DatasetRecord> {
        let row = sqlx::query_as::<_, DatasetRow>(
            r#"
            INSERT INTO datasets (name, file_path, created, last_modified)
            VALUES ($1, $2, NOW(), NOW())
            RETURNING id, name, file_path, created, last_modified
            "#,
        )
        .bind(&dataset.name)
        .bind(dataset.file_path.to_string_lossy().into_owned())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn find_dataset_by_name(&self, name: &str) -> Result<Option<DatasetRecord>> {
        let row = sqlx::query_as::<_, DatasetRow>(
            "SELECT id, name, file_path, created, last_modified FROM datasets WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(DatasetRecord::from))
    }

    async fn touch_dataset(&self, id: RecordId) -> Result<()> {
        let result = sqlx::query("UPDATE datasets SET last_modified = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(LabError::not_found("dataset", id.to_string()));
        }
        Ok(())
    }

    async fn get_converter_list(&self, id: RecordId) -> Result<Option<ConverterList>> {
        let row = sqlx::query_as::<_, ConverterListRow>(
            r#"
            SELECT id, dataset_id, converters, status, delivery_time, start_time, end_time,
                   created, last_modified
            FROM converter_lists
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ConverterList::try_from).transpose()
    }

    async fn save_converter_list(&self, list: &ConverterList) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO converter_lists (id, dataset_id, converters, status, delivery_time,
                                         start_time, end_time, created, last_modified)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                dataset_id = EXCLUDED.dataset_id,
                converters = EXCLUDED.converters,
                status = EXCLUDED.status,
                delivery_time = EXCLUDED.delivery_time,
                start_time = EXCLUDED.start_time,
                end_time = EXCLUDED.end_time,
                last_modified = EXCLUDED.last_modified
            "#,
        )
        .bind(list.id)
        .bind(list.dataset_id)
        .bind(&list.converters)
        .bind(list.track.status.as_str())
        .bind(list.track.delivery_time)
        .bind(list.track.start_time)
        .bind(list.track.end_time)
        .bind(list.created)
        .bind(list.last_modified)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_explorer(&self, id: RecordId) -> Result<Option<Explorer>> {
        let row = sqlx::query_as::<_, ExplorerRow>(
            r#"
            SELECT id, exploration_id, name, exploration_type, columns, parameters,
                   exploration_path, status, delivery_time, start_time, end_time,
                   created, last_modified
            FROM explorers
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Explorer::try_from).transpose()
    }

    async fn save_explorer(&self, explorer: &Explorer) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO explorers (id, exploration_id, name, exploration_type, columns,
                                   parameters, exploration_path, status, delivery_time,
                                   start_time, end_time, created, last_modified)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                exploration_id = EXCLUDED.exploration_id,
                name = EXCLUDED.name,
                exploration_type = EXCLUDED.exploration_type,
                columns = EXCLUDED.columns,
                parameters = EXCLUDED.parameters,
                exploration_path = EXCLUDED.exploration_path,
                status = EXCLUDED.status,
                delivery_time = EXCLUDED.delivery_time,
                start_time = EXCLUDED.start_time,
                end_time = EXCLUDED.end_time,
                last_modified = EXCLUDED.last_modified
            "#,
        )
        .bind(explorer.id)
        .bind(explorer.exploration_id)
        .bind(&explorer.name)
        .bind(&explorer.exploration_type)
        .bind(serde_json::to_value(&explorer.columns)?)
        .bind(Value::Object(explorer.parameters.clone()))
        .bind(path_string(&explorer.exploration_path))
        .bind(explorer.track.status.as_str())
        .bind(explorer.track.delivery_time)
        .bind(explorer.track.start_time)
        .bind(explorer.track.end_time)
        .bind(explorer.created)
        .bind(explorer.last_modified)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_exploration(&self, id: RecordId) -> Result<Option<Exploration>> {
        let row = sqlx::query_as::<_, ExplorationRow>(
            "SELECT id, dataset_id, name, created FROM explorations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Exploration {
            id: r.id,
            dataset_id: r.dataset_id,
            name: r.name,
            created: r.created,
        }))
    }

    async fn save_exploration(&self, exploration: &Exploration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO explorations (id, dataset_id, name, created)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                dataset_id = EXCLUDED.dataset_id,
                name = EXCLUDED.name
            "#,
        )
        .bind(exploration.id)
        .bind(exploration.dataset_id)
        .bind(&exploration.name)
        .bind(exploration.created)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn status_of(&self, record: RecordRef) -> Result<Option<RecordStatus>> {
        let table = status_table(record.kind).ok_or_else(|| no_status(record.kind))?;
        let status: Option<String> =
            sqlx::query_scalar(&format!("SELECT status FROM {} WHERE id = $1", table))
                .bind(record.id)
                .fetch_optional(&self.pool)
                .await?;

        status.map(|s| s.parse()).transpose()
    }

    /// Row-locked read, validated transition and update in one transaction.
    async fn set_status(&self, record: RecordRef, next: RecordStatus) -> Result<()> {
        let table = status_table(record.kind).ok_or_else(|| no_status(record.kind))?;
        let mut tx = self.pool.begin().await?;

        let current: Option<String> = sqlx::query_scalar(&format!(
            "SELECT status FROM {} WHERE id = $1 FOR UPDATE",
            table
        ))
        .bind(record.id)
        .fetch_optional(&mut *tx)
        .await?;
        let current: RecordStatus = current.ok_or_else(|| record.not_found())?.parse()?;

        let mut track = StatusTrack {
            status: current,
            ..StatusTrack::default()
        };
        track.transition(next)?;

        let stamp_column = match next {
            RecordStatus::Delivered => "delivery_time",
            RecordStatus::Started => "start_time",
            _ => "end_time",
        };
        sqlx::query(&format!(
            "UPDATE {} SET status = $2, {} = NOW(), last_modified = NOW() WHERE id = $1",
            table, stamp_column
        ))
        .bind(record.id)
        .bind(next.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn no_status(kind: RecordKind) -> LabError {
    LabError::new(
        ErrorCode::InvalidInput,
        format!("{} records do not carry a status", kind),
    )
}

fn path_string(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.to_string_lossy().into_owned())
}

fn object(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(LabError::with_internal(
            ErrorCode::DeserializationError,
            "Stored parameters are not a JSON object",
            other.to_string(),
        )),
    }
}

fn track(
    status: String,
    delivery_time: Option<DateTime<Utc>>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
) -> Result<StatusTrack> {
    Ok(StatusTrack {
        status: status.parse()?,
        delivery_time,
        start_time,
        end_time,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct DatasetRow {
    id: i64,
    name: String,
    file_path: String,
    created: DateTime<Utc>,
    last_modified: DateTime<Utc>,
}

impl From<DatasetRow> for DatasetRecord {
    fn from(row: DatasetRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            file_path: PathBuf::from(row.file_path),
            created: row.created,
            last_modified: row.last_modified,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ExperimentRow {
    id: i64,
    dataset_id: i64,
    task_name: String,
    input_columns: Value,
    output_columns: Value,
    splits: Option<Value>,
    seed: Option<i64>,
    created: DateTime<Utc>,
}

impl TryFrom<ExperimentRow> for Experiment {
    type Error = LabError;

    fn try_from(row: ExperimentRow) -> Result<Self> {
        let splits = match row.splits {
            Some(value) if !value.is_null() => serde_json::from_value(value)?,
            _ => SplitFractions::default(),
        };
        Ok(Self {
            id: row.id,
            dataset_id: row.dataset_id,
            task_name: row.task_name,
            input_columns: serde_json::from_value(row.input_columns)?,
            output_columns: serde_json::from_value(row.output_columns)?,
            splits,
            seed: row.seed.map(|s| s as u64),
            created: row.created,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    id: i64,
    experiment_id: i64,
    name: String,
    model_name: String,
    parameters: Value,
    optimizer_name: Option<String>,
    optimizer_parameters: Value,
    goal_metric: Option<String>,
    train_metrics: Option<Value>,
    validation_metrics: Option<Value>,
    test_metrics: Option<Value>,
    run_path: Option<String>,
    trials_path: Option<String>,
    status: String,
    delivery_time: Option<DateTime<Utc>>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    created: DateTime<Utc>,
    last_modified: DateTime<Utc>,
}

impl TryFrom<RunRow> for Run {
    type Error = LabError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            experiment_id: row.experiment_id,
            name: row.name,
            model_name: row.model_name,
            parameters: object(row.parameters)?,
            optimizer_name: row.optimizer_name,
            optimizer_parameters: object(row.optimizer_parameters)?,
            goal_metric: row.goal_metric,
            train_metrics: row.train_metrics,
            validation_metrics: row.validation_metrics,
            test_metrics: row.test_metrics,
            run_path: row.run_path.map(PathBuf::from),
            trials_path: row.trials_path.map(PathBuf::from),
            track: track(row.status, row.delivery_time, row.start_time, row.end_time)?,
            created: row.created,
            last_modified: row.last_modified,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ConverterListRow {
    id: i64,
    dataset_id: i64,
    converters: Value,
    status: String,
    delivery_time: Option<DateTime<Utc>>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    created: DateTime<Utc>,
    last_modified: DateTime<Utc>,
}

impl TryFrom<ConverterListRow> for ConverterList {
    type Error = LabError;

    fn try_from(row: ConverterListRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            dataset_id: row.dataset_id,
            converters: row.converters,
            track: track(row.status, row.delivery_time, row.start_time, row.end_time)?,
            created: row.created,
            last_modified: row.last_modified,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ExplorationRow {
    id: i64,
    dataset_id: i64,
    name: String,
    created: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct ExplorerRow {
    id: i64,
    exploration_id: i64,
    name: String,
    exploration_type: String,
    columns: Value,
    parameters: Value,
    exploration_path: Option<String>,
    status: String,
    delivery_time: Option<DateTime<Utc>>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    created: DateTime<Utc>,
    last_modified: DateTime<Utc>,
}

impl TryFrom<ExplorerRow> for Explorer {
    type Error = LabError;

    fn try_from(row: ExplorerRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            exploration_id: row.exploration_id,
            name: row.name,
            exploration_type: row.exploration_type,
            columns: serde_json::from_value(row.columns)?,
            parameters: object(row.parameters)?,
            exploration_path: row.exploration_path.map(PathBuf::from),
            track: track(row.status, row.delivery_time, row.start_time, row.end_time)?,
            created: row.created,
            last_modified: row.last_modified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_accepts_null_as_empty() {
        assert!(object(Value::Null).unwrap().is_empty());
        assert!(object(serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn test_only_status_kinds_have_tables() {
        assert_eq!(status_table(RecordKind::Run), Some("runs"));
        assert_eq!(status_table(RecordKind::Dataset), None);
        assert_eq!(status_table(RecordKind::Exploration), None);
    }

    #[test]
    fn test_run_row_conversion_rejects_unknown_status() {
        let now = Utc::now();
        let row = RunRow {
            id: 1,
            experiment_id: 1,
            name: "r".to_string(),
            model_name: "DummyClassifier".to_string(),
            parameters: Value::Null,
            optimizer_name: None,
            optimizer_parameters: Value::Null,
            goal_metric: None,
            train_metrics: None,
            validation_metrics: None,
            test_metrics: None,
            run_path: None,
            trials_path: None,
            status: "PAUSED".to_string(),
            delivery_time: None,
            start_time: None,
            end_time: None,
            created: now,
            last_modified: now,
        };
        assert!(Run::try_from(row).is_err());
    }
}
