//! End-to-end pipeline runs over the in-memory harness

mod common;

use common::{
    owner_bucket, query_workflow, scripted_activities, Harness, HarnessOptions, ScriptedActivity, OWNER_ID,
};
use etl_engine::durable::BreakerState;
use etl_engine::models::{ExecutionStatus, StepStatus, WorkflowDefinition};
use etl_engine::storage::ObjectStore;
use etl_engine::store::{ExecutionStore, WorkflowStore};
use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_query_only_workflow_writes_csv() {
    let harness = Harness::start();
    harness.add_workflow(query_workflow(1, "SELECT 1 AS x"));

    let (execution_id, status) = harness.run(1).await;
    assert_eq!(status, ExecutionStatus::Success);

    let execution = harness.store.get_execution(execution_id).await.unwrap().unwrap();
    assert_eq!(execution.rows_affected, Some(1));
    assert!(execution.completed_at.is_some());
    assert!(execution.run_ids().is_some(), "ran on the durable backend");

    let steps = harness.store.list_steps(execution_id).await.unwrap();
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|s| s.status == StepStatus::Success));
    assert_eq!(steps[0].output.as_ref().unwrap()["row_count"], 0);
    assert_eq!(steps[1].output.as_ref().unwrap()["row_count"], 1);

    let object = steps[2].output.as_ref().unwrap()["object"].as_str().unwrap().to_string();
    assert!(object.ends_with(".csv"), "{object}");
    assert_eq!(harness.objects.keys(&owner_bucket()), vec![object.clone()]);

    let body = harness.objects.get_object(&owner_bucket(), &object).await.unwrap();
    assert_eq!(body, b"x\n1\n");

    let workflow = harness.store.get_workflow(1).await.unwrap().unwrap();
    assert!(workflow.last_run.is_some());
}

#[tokio::test]
async fn test_template_query_used_when_literal_is_blank() {
    let harness = Harness::start();
    harness.store.insert_template(5, "SELECT 2 AS y").unwrap();
    harness.add_workflow(WorkflowDefinition {
        query: Some("   ".to_string()),
        template_id: Some(5),
        ..WorkflowDefinition::new(1, OWNER_ID, "0 3 * * *")
    });

    let (execution_id, status) = harness.run(1).await;
    assert_eq!(status, ExecutionStatus::Success);

    let key = format!("transformed/workflow_1_{execution_id}.csv");
    let body = harness.objects.get_object(&owner_bucket(), &key).await.unwrap();
    assert_eq!(body, b"y\n2\n");
}

#[tokio::test]
async fn test_missing_query_fails_execution() {
    let harness = Harness::start();
    harness.add_workflow(WorkflowDefinition::new(1, OWNER_ID, "0 3 * * *"));

    let (execution_id, status) = harness.run(1).await;
    assert_eq!(status, ExecutionStatus::Failed);

    let execution = harness.store.get_execution(execution_id).await.unwrap().unwrap();
    assert_eq!(execution.error_message.as_deref(), Some("No query or template defined"));
    assert!(harness.store.list_steps(execution_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_uploaded_csv_is_loaded_and_queried() {
    let harness = Harness::start();
    let bucket = owner_bucket();
    harness.objects.ensure_bucket(&bucket).await.unwrap();
    harness
        .objects
        .put_object(
            &bucket,
            "uploads/sales 2024.csv",
            b"region,amount\nnorth,10\nsouth,5\nnorth,7\n".to_vec(),
            Some("text/csv"),
        )
        .await
        .unwrap();

    harness.add_workflow(WorkflowDefinition {
        source_type: "file".to_string(),
        source_config: json!({ "files": [{ "path": "uploads/sales 2024.csv" }] }),
        ..query_workflow(
            1,
            "SELECT region, SUM(amount) AS total FROM sales_2024 GROUP BY region ORDER BY region",
        )
    });

    let (execution_id, status) = harness.run(1).await;
    assert_eq!(status, ExecutionStatus::Success);

    let steps = harness.store.list_steps(execution_id).await.unwrap();
    assert_eq!(steps[0].output.as_ref().unwrap()["row_count"], 1, "one file configured");

    let key = format!("transformed/workflow_1_{execution_id}.csv");
    let body = harness.objects.get_object(&bucket, &key).await.unwrap();
    assert_eq!(String::from_utf8(body).unwrap(), "region,total\nnorth,17\nsouth,5\n");
}

#[tokio::test]
async fn test_unsafe_table_name_is_rejected() {
    let harness = Harness::start();
    let bucket = owner_bucket();
    harness.objects.ensure_bucket(&bucket).await.unwrap();
    harness
        .objects
        .put_object(&bucket, "uploads/a.csv", b"x\n1\n".to_vec(), None)
        .await
        .unwrap();

    harness.add_workflow(WorkflowDefinition {
        source_type: "file".to_string(),
        source_config: json!({ "files": [{ "path": "uploads/a.csv", "table_name": "a; DROP TABLE b" }] }),
        ..query_workflow(1, "SELECT 1")
    });

    let (execution_id, status) = harness.run(1).await;
    assert_eq!(status, ExecutionStatus::Failed);

    let steps = harness.store.list_steps(execution_id).await.unwrap();
    assert_eq!(steps[1].status, StepStatus::Failed);
    assert_eq!(steps[1].attempts, 1, "not retried");
    let execution = harness.store.get_execution(execution_id).await.unwrap().unwrap();
    assert!(execution.error_message.unwrap().contains("unsafe identifier"));
}

#[tokio::test]
async fn test_api_source_rows_become_source_data() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "a": 1 }, { "a": 2 }])))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::start();
    harness.add_workflow(WorkflowDefinition {
        source_type: "api".to_string(),
        source_config: json!({ "url": format!("{}/rows", server.uri()) }),
        ..query_workflow(1, "SELECT COUNT(*) AS n, SUM(a) AS total FROM source_data")
    });

    let (execution_id, status) = harness.run(1).await;
    assert_eq!(status, ExecutionStatus::Success);

    let steps = harness.store.list_steps(execution_id).await.unwrap();
    assert_eq!(steps[0].output.as_ref().unwrap()["row_count"], 2);

    let key = format!("transformed/workflow_1_{execution_id}.csv");
    let body = harness.objects.get_object(&owner_bucket(), &key).await.unwrap();
    assert_eq!(String::from_utf8(body).unwrap(), "n,total\n2,3\n");
}

#[tokio::test]
async fn test_webhook_destination_posts_rows() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_json(json!([{ "x": 1 }])))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::start();
    harness.add_workflow(WorkflowDefinition {
        destination_type: "webhook".to_string(),
        destination_config: json!({ "url": format!("{}/hook", server.uri()) }),
        ..query_workflow(1, "SELECT 1 AS x")
    });

    let (execution_id, status) = harness.run(1).await;
    assert_eq!(status, ExecutionStatus::Success);

    let steps = harness.store.list_steps(execution_id).await.unwrap();
    let saved = steps[2].output.as_ref().unwrap();
    assert_eq!(saved["status_code"], 202);
    assert_eq!(saved["saved"], true);
    assert!(harness.objects.keys(&owner_bucket()).is_empty());
}

#[tokio::test]
async fn test_webhook_rejection_is_recorded_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::start();
    harness.add_workflow(WorkflowDefinition {
        destination_type: "webhook".to_string(),
        destination_config: json!({ "url": format!("{}/hook", server.uri()) }),
        ..query_workflow(1, "SELECT 1 AS x")
    });

    let (execution_id, status) = harness.run(1).await;
    assert_eq!(status, ExecutionStatus::Success);

    let steps = harness.store.list_steps(execution_id).await.unwrap();
    let saved = steps[2].output.as_ref().unwrap();
    assert_eq!(saved["status_code"], 500);
    assert_eq!(saved["saved"], false);
}

#[tokio::test]
async fn test_unavailable_backend_falls_back_without_step_rows() {
    let harness = Harness::start();
    harness.add_workflow(query_workflow(1, "SELECT 1 AS x"));
    harness.backend.shutdown();

    let (execution_id, status) = harness.run(1).await;
    assert_eq!(status, ExecutionStatus::Success);

    let execution = harness.store.get_execution(execution_id).await.unwrap().unwrap();
    assert_eq!(execution.rows_affected, Some(1));
    assert!(execution.run_ids().is_none());
    assert!(harness.store.list_steps(execution_id).await.unwrap().is_empty());
    assert_eq!(harness.objects.keys(&owner_bucket()).len(), 1);
}

#[tokio::test]
async fn test_fallback_failure_ends_execution_immediately() {
    let harness = Harness::start();
    harness.add_workflow(query_workflow(1, "SELECT * FROM missing_table"));
    harness.backend.shutdown();

    let (execution_id, status) = harness.run(1).await;
    assert_eq!(status, ExecutionStatus::Failed);

    let execution = harness.store.get_execution(execution_id).await.unwrap().unwrap();
    assert!(execution.error_message.unwrap().contains("no such table"));
    assert!(harness.store.list_steps(execution_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_disabled_durable_mode_always_falls_back() {
    let harness = Harness::start_with(HarnessOptions {
        durable_enabled: false,
        ..HarnessOptions::default()
    });
    harness.add_workflow(query_workflow(1, "SELECT 1 AS x"));

    let (execution_id, status) = harness.run(1).await;
    assert_eq!(status, ExecutionStatus::Success);
    assert!(harness.store.list_steps(execution_id).await.unwrap().is_empty());
    assert_eq!(harness.backend.active_runs(), 0);
}

#[tokio::test]
async fn test_breaker_opens_after_repeated_backend_failures() {
    let harness = Harness::start();
    harness.add_workflow(query_workflow(1, "SELECT 1 AS x"));
    harness.backend.shutdown();

    for _ in 0..3 {
        let (_, status) = harness.run(1).await;
        assert_eq!(status, ExecutionStatus::Success);
    }
    assert_eq!(harness.engine.breaker().state(), BreakerState::Open);

    let (_, status) = harness.run(1).await;
    assert_eq!(status, ExecutionStatus::Success, "still served by the fallback");
}

#[tokio::test]
async fn test_step_retried_until_it_succeeds() {
    let transform = ScriptedActivity::failing(2, json!({ "columns": ["x"], "data": [{ "x": 1 }], "row_count": 1 }));
    let harness = Harness::start_with(HarnessOptions {
        activities: Some(scripted_activities(
            ScriptedActivity::ok(json!({})),
            transform.clone(),
            ScriptedActivity::ok(json!({ "saved": true, "row_count": 1 })),
        )),
        ..HarnessOptions::default()
    });
    harness.add_workflow(query_workflow(1, "SELECT 1 AS x"));

    let (execution_id, status) = harness.run(1).await;
    assert_eq!(status, ExecutionStatus::Success);
    assert_eq!(transform.calls(), 3);

    let steps = harness.store.list_steps(execution_id).await.unwrap();
    let transform_rows: Vec<_> = steps.iter().filter(|s| s.step_number == 2).collect();
    assert_eq!(transform_rows.len(), 1);
    assert_eq!(transform_rows[0].status, StepStatus::Success);
    assert_eq!(transform_rows[0].attempts, 3);
}

#[tokio::test]
async fn test_exhausted_retries_fail_execution_with_last_error() {
    let save = ScriptedActivity::ok(json!({}));
    let harness = Harness::start_with(HarnessOptions {
        activities: Some(scripted_activities(
            ScriptedActivity::ok(json!({})),
            ScriptedActivity::failing(10, json!({})),
            save.clone(),
        )),
        ..HarnessOptions::default()
    });
    harness.add_workflow(query_workflow(1, "SELECT 1 AS x"));

    let (execution_id, status) = harness.run(1).await;
    assert_eq!(status, ExecutionStatus::Failed);
    assert_eq!(save.calls(), 0);

    let execution = harness.store.get_execution(execution_id).await.unwrap().unwrap();
    assert_eq!(execution.error_message.as_deref(), Some("attempt 3 failed"));

    let steps = harness.store.list_steps(execution_id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].status, StepStatus::Success);
    assert_eq!(steps[1].status, StepStatus::Failed);
    assert_eq!(steps[1].error_message.as_deref(), Some("attempt 3 failed"));
}
