use axum::http::{HeaderName, HeaderValue, StatusCode};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tripwire_engine::{
    definition::{TriggerDescriptor, WorkflowDefinition, WorkflowNode},
    metrics,
    procedure::{register_builtins, InMemoryRegistry},
    server::Server,
    store::{create_store, DatabaseConfig},
    trigger::{TriggerManager, WebhookDispatcher},
    workflow::WorkflowEngine,
};

fn hook_flow() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "hooks",
        "A",
        vec![
            WorkflowNode::procedure("A", "core.log", json!({"message": "received"})).with_next("B"),
            WorkflowNode::await_on("B", &["confirm"]).with_next("C"),
            WorkflowNode::sequential("C"),
        ],
    )
    .with_trigger(TriggerDescriptor {
        provider: "webhook".into(),
        trigger_procedure_name: "webhook.watch".into(),
        event_type: Some("push".into()),
        subscription_config: Map::new(),
    })
}

async fn test_server() -> (axum_test::TestServer, Arc<TriggerManager>) {
    let store = create_store(&DatabaseConfig::in_memory())
        .await
        .expect("Failed to create store");

    let mut registry = InMemoryRegistry::new();
    register_builtins(&mut registry);
    let engine = Arc::new(WorkflowEngine::new(Arc::new(registry)).with_store(store));
    let dispatcher = Arc::new(WebhookDispatcher::new());
    let manager = TriggerManager::builder(engine, dispatcher.clone()).build();
    manager
        .deploy(hook_flow(), "http://localhost:8080/webhooks/webhook", Map::new())
        .await
        .expect("Failed to deploy workflow");

    let app = Server::new(manager.clone(), dispatcher).build_router();
    (axum_test::TestServer::new(app).unwrap(), manager)
}

async fn wait_for_pending(manager: &TriggerManager, count: usize) {
    for _ in 0..50 {
        if manager.pending_count().await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {} pending executions", count);
}

#[tokio::test]
async fn test_health_and_metrics() {
    metrics::register_metrics().unwrap();
    let (client, _) = test_server().await;

    let response = client.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");

    let response = client.get("/metrics").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert!(response.text().contains("tripwire_"));
}

#[tokio::test]
async fn test_webhook_starts_and_resumes_runs() {
    let (client, manager) = test_server().await;

    let response = client
        .post("/webhooks/webhook")
        .add_header(HeaderName::from_static("x-event-id"), HeaderValue::from_static("evt-1"))
        .add_header(HeaderName::from_static("x-event-type"), HeaderValue::from_static("push"))
        .json(&json!({"ref": "main"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::ACCEPTED);
    let body: Value = response.json();
    assert_eq!(body["eventId"], "evt-1");
    assert_eq!(body["handlers"], 1);

    wait_for_pending(&manager, 1).await;
    let paused: Vec<Value> = client.get("/executions/paused").await.json();
    assert_eq!(paused.len(), 1);
    assert_eq!(paused[0]["variables"]["event"]["payload"]["ref"], "main");
    let execution_id = paused[0]["executionId"].as_str().unwrap().to_string();

    let record: Value = client.get(&format!("/executions/{}", execution_id)).await.json();
    assert_eq!(record["status"], "paused");

    let response = client
        .post("/webhooks/webhook")
        .add_header(HeaderName::from_static("x-trigger-id"), HeaderValue::from_static("confirm"))
        .json(&json!({"ok": true}))
        .await;
    assert_eq!(response.status_code(), StatusCode::ACCEPTED);

    wait_for_pending(&manager, 0).await;
    let record: Value = client.get(&format!("/executions/{}", execution_id)).await.json();
    assert_eq!(record["status"], "completed");
    assert_eq!(record["nodesExecuted"], json!(["A", "B", "C"]));
}

#[tokio::test]
async fn test_unknown_execution_is_404() {
    let (client, _) = test_server().await;

    let response = client.get("/executions/does-not-exist").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let body: Value = response.json();
    assert_eq!(body["error"], "Execution not found");

    let response = client.delete("/executions/does-not-exist").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_pending_execution() {
    let (client, manager) = test_server().await;
    let definition = manager.definition("hooks").await.unwrap();
    let paused = manager.run(definition, json!({})).await.unwrap();

    let response = client.delete(&format!("/executions/{}", paused.execution_id)).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["currentNodeId"], "B");

    let record: Value = client
        .get(&format!("/executions/{}", paused.execution_id))
        .await
        .json();
    assert_eq!(record["status"], "cancelled");
}

#[tokio::test]
async fn test_webhook_rejects_non_json_body() {
    let (client, _) = test_server().await;

    let response = client.post("/webhooks/webhook").text("not json").await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}
