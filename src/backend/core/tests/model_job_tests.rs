//! Model, predict, explorer and dataset jobs driven through the service.

mod common;

use chrono::Utc;
use serde_json::json;

use common::{classification_splits, payload, Harness};
use labkit_core::dataset;
use labkit_core::error::ErrorCode;
use labkit_core::jobs::{JobKind, PREDICTION_COLUMN};
use labkit_core::store::{Exploration, Explorer, RecordRef, RecordStatus, RecordStore, StatusTrack};

async fn seed_experiment(harness: &Harness) -> i64 {
    let dataset = harness.add_dataset("flowers", &classification_splits()).await;
    harness
        .add_experiment(1, dataset.id, "TabularClassificationTask", &["a", "b"], "species")
        .await;
    dataset.id
}

#[tokio::test]
async fn test_two_model_jobs_finish_in_order() {
    let harness = Harness::new();
    seed_experiment(&harness).await;
    let first = harness.add_run(1, 1, "DummyClassifier", json!({})).await;
    let second = harness
        .add_run(2, 1, "KNeighborsClassifier", json!({"n_neighbors": 3}))
        .await;

    for run_id in [1, 2] {
        harness
            .service
            .enqueue(JobKind::Model, payload(json!({"run_id": run_id})))
            .await
            .unwrap();
    }
    assert_eq!(harness.status(first).await, RecordStatus::Delivered);
    harness.drain().await;

    let one = harness.store.get_run(1).await.unwrap().unwrap();
    let two = harness.store.get_run(2).await.unwrap().unwrap();
    assert_eq!(one.track.status, RecordStatus::Finished);
    assert_eq!(harness.status(second).await, RecordStatus::Finished);
    assert!(one.track.end_time.unwrap() <= two.track.start_time.unwrap());
    for run in [&one, &two] {
        assert!(run.run_path.as_ref().unwrap().exists());
        assert!(run.train_metrics.as_ref().unwrap().get("Accuracy").is_some());
        assert!(run.test_metrics.as_ref().unwrap().get("Accuracy").is_some());
    }
}

#[tokio::test]
async fn test_optimized_run_persists_trials() {
    let harness = Harness::new();
    seed_experiment(&harness).await;
    harness
        .add_run(
            1,
            1,
            "KNeighborsClassifier",
            json!({"n_neighbors": {"optimize": true, "fixed_value": 3, "lower_bound": 1, "upper_bound": 5}}),
        )
        .await;
    let mut run = harness.store.get_run(1).await.unwrap().unwrap();
    run.optimizer_name = Some("RandomSearchOptimizer".into());
    run.optimizer_parameters = payload(json!({"n_trials": 4, "seed": 2}));
    run.goal_metric = Some("Accuracy".into());
    harness.store.save_run(&run).await.unwrap();

    harness
        .service
        .enqueue(JobKind::Model, payload(json!({"run_id": 1})))
        .await
        .unwrap();
    harness.drain().await;

    let run = harness.store.get_run(1).await.unwrap().unwrap();
    assert_eq!(run.track.status, RecordStatus::Finished);
    let trials: serde_json::Value =
        serde_json::from_slice(&std::fs::read(run.trials_path.unwrap()).unwrap()).unwrap();
    assert_eq!(trials.as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn test_model_job_with_unknown_model_errors() {
    let harness = Harness::new();
    seed_experiment(&harness).await;
    let run = harness.add_run(1, 1, "GradientBoostedUnicorn", json!({})).await;

    harness
        .service
        .enqueue(JobKind::Model, payload(json!({"run_id": 1})))
        .await
        .unwrap();
    harness.drain().await;

    assert_eq!(harness.status(run).await, RecordStatus::Error);
    let stored = harness.store.get_run(1).await.unwrap().unwrap();
    assert!(stored.run_path.is_none());
    assert!(stored.track.end_time.is_some());
}

#[tokio::test]
async fn test_predict_job_needs_finished_run_and_writes_once() {
    let harness = Harness::new();
    let dataset_id = seed_experiment(&harness).await;
    harness.add_run(1, 1, "DummyClassifier", json!({})).await;
    let predict = payload(json!({"run_id": 1, "dataset_id": dataset_id}));

    let err = harness
        .service
        .enqueue(JobKind::Predict, predict.clone())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::RecordNotReady);

    harness
        .service
        .enqueue(JobKind::Model, payload(json!({"run_id": 1})))
        .await
        .unwrap();
    harness.drain().await;

    for _ in 0..2 {
        harness
            .service
            .enqueue(JobKind::Predict, predict.clone())
            .await
            .unwrap();
    }
    harness.drain().await;

    assert_eq!(harness.store.dataset_count(), 2);
    let output = harness
        .store
        .find_dataset_by_name("flowers_pred")
        .await
        .unwrap()
        .unwrap();
    let splits = dataset::load_dataset(&output.file_path).unwrap();
    assert_eq!(splits.train.column_names(), vec!["a", "b", PREDICTION_COLUMN]);
    assert_eq!(splits.train.n_rows(), 18);
    assert_eq!(splits.validation.n_rows(), 0);
    assert_eq!(harness.status(RecordRef::run(1)).await, RecordStatus::Finished);
}

#[tokio::test]
async fn test_explorer_job_saves_result() {
    let harness = Harness::new();
    let dataset_id = seed_experiment(&harness).await;
    let now = Utc::now();
    harness
        .store
        .save_exploration(&Exploration {
            id: 3,
            dataset_id,
            name: "first look".into(),
            created: now,
        })
        .await
        .unwrap();
    harness
        .store
        .save_explorer(&Explorer {
            id: 9,
            exploration_id: 3,
            name: "describe".into(),
            exploration_type: "DescribeExplorer".into(),
            columns: vec!["a".into(), "species".into()],
            parameters: Default::default(),
            exploration_path: None,
            track: StatusTrack::default(),
            created: now,
            last_modified: now,
        })
        .await
        .unwrap();

    harness
        .service
        .enqueue(JobKind::Explorer, payload(json!({"explorer_id": 9})))
        .await
        .unwrap();
    harness.drain().await;

    let explorer = harness.store.get_explorer(9).await.unwrap().unwrap();
    assert_eq!(explorer.track.status, RecordStatus::Finished);
    let path = explorer.exploration_path.unwrap();
    assert!(path.starts_with(harness.storage.explorations_path.join("3_first_look")));
    let result: serde_json::Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
    assert_eq!(result["rows"], 30);
    assert_eq!(result["columns"]["species"]["unique"], 3);
}

#[tokio::test]
async fn test_dataset_job_creates_record_and_cleans_up_failures() {
    let harness = Harness::new();
    let csv = "x,y,label\n".to_string()
        + &(0..20).map(|i| format!("{},{},{}\n", i, i * 2, i % 2)).collect::<String>();

    harness
        .service
        .enqueue(
            JobKind::Dataset,
            payload(json!({
                "name": "uploaded",
                "dataloader": "CSVDataLoader",
                "source": {"inline": csv},
                "splits": {"train": 0.5, "test": 0.25, "validation": 0.25},
                "seed": 4
            })),
        )
        .await
        .unwrap();
    harness
        .service
        .enqueue(
            JobKind::Dataset,
            payload(json!({
                "name": "broken",
                "dataloader": "JSONDataLoader",
                "source": {"inline": "this is not json"}
            })),
        )
        .await
        .unwrap();
    harness.drain().await;

    let record = harness
        .store
        .find_dataset_by_name("uploaded")
        .await
        .unwrap()
        .unwrap();
    let splits = dataset::load_dataset(&record.file_path).unwrap();
    assert_eq!(splits.train.n_rows(), 10);
    assert_eq!(splits.test.n_rows(), 5);
    assert_eq!(splits.validation.n_rows(), 5);
    assert!(dataset::read_metadata(&record.file_path)
        .unwrap()
        .split_indices
        .is_some());

    assert!(harness.store.find_dataset_by_name("broken").await.unwrap().is_none());
    assert!(!harness.dataset_root("broken").exists());

    let err = harness
        .service
        .enqueue(
            JobKind::Dataset,
            payload(json!({
                "name": "uploaded",
                "dataloader": "CSVDataLoader",
                "source": {"inline": "a\n1\n"}
            })),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DatasetAlreadyExists);
}

#[tokio::test]
async fn test_failed_result_commit_leaves_run_in_error() {
    let harness = Harness::new();
    let dataset_id = seed_experiment(&harness).await;
    let run = harness.add_run(1, 1, "DummyClassifier", json!({})).await;
    let list = harness
        .add_converter_list(1, dataset_id, json!({"MinMaxScaler": {"order": 1, "scope": {"columns": [1]}}}))
        .await;

    harness
        .service
        .enqueue(JobKind::Model, payload(json!({"run_id": 1})))
        .await
        .unwrap();
    harness
        .service
        .enqueue(
            JobKind::ConverterList,
            payload(json!({"converter_list_id": 1, "target_column_index": 3})),
        )
        .await
        .unwrap();
    harness.faults.reject_finished_runs(true);
    harness.drain().await;

    assert_eq!(harness.status(run).await, RecordStatus::Error);
    let stored = harness.store.get_run(1).await.unwrap().unwrap();
    assert!(stored.train_metrics.is_none());
    assert!(stored.track.end_time.is_some());
    assert_eq!(harness.status(list).await, RecordStatus::Finished);
}
