// Admin API over the in-memory provider.

mod common;

use axum_test::TestServer;
use common::{harness, Harness, GROUP};
use privcloud_common::LifecycleState;
use privcloud_orchestrator::api::{create_router, AppState};
use privcloud_providers::mock::MockProvider;
use serde_json::json;
use std::sync::Arc;

fn server(h: Harness) -> (TestServer, Arc<MockProvider>) {
    let provider = h.provider.clone();
    let app = create_router(AppState::new(Arc::new(h.driver)));
    (TestServer::new(app).unwrap(), provider)
}

#[tokio::test]
async fn test_root_describes_the_service() {
    let (server, _) = server(harness(MockProvider::new()));

    let response = server.get("/").await;

    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["management_group"], GROUP);
    assert_eq!(body["closed"], false);
}

#[tokio::test]
async fn test_fleet_lifecycle() {
    let (server, provider) = server(harness(MockProvider::new()));

    let response = server.post("/fleet").json(&json!({ "timeout_secs": 10 })).await;
    assert_eq!(response.status_code(), 201);
    let machines: Vec<serde_json::Value> = response.json();
    assert_eq!(machines.len(), 3);

    let response = server.post("/fleet").json(&json!({ "timeout_secs": 10 })).await;
    assert_eq!(response.status_code(), 409);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "ALREADY_PROVISIONED");

    let listed: Vec<serde_json::Value> = server.get("/fleet").await.json();
    assert_eq!(listed.len(), 3);

    let response = server.delete("/fleet").await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["terminated"].as_array().unwrap().len(), 3);
    assert_eq!(provider.calls().terminate_instances.len(), 1);
}

#[tokio::test]
async fn test_zero_timeout_is_a_bad_request() {
    let (server, _) = server(harness(MockProvider::new()));

    let response = server.post("/machines").json(&json!({ "timeout_secs": 0 })).await;

    assert_eq!(response.status_code(), 400);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "INVALID_DURATION");
}

#[tokio::test]
async fn test_partial_fleet_failure_reports_counts() {
    let (server, _) = server(harness(MockProvider::new().with_failing_launch(0)));

    let response = server.post("/fleet").json(&json!({ "timeout_secs": 10 })).await;

    assert_eq!(response.status_code(), 500);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "PARTIAL_FLEET_FAILURE");
    assert_eq!(body["failure_count"], 1);
    assert_eq!(body["total_count"], 3);
}

#[tokio::test]
async fn test_provision_and_terminate_machine() {
    let (server, provider) = server(harness(MockProvider::new()));

    let response = server
        .post("/machines")
        .json(&json!({ "location_id": "us-east-1a", "timeout_secs": 10 }))
        .await;
    assert_eq!(response.status_code(), 201);
    let machine: serde_json::Value = response.json();
    let address = machine["private_address"].as_str().unwrap().to_string();
    let id = machine["instance_id"].as_str().unwrap().to_string();

    let response = server
        .post("/machines/terminate")
        .json(&json!({ "address": address, "timeout_secs": 10 }))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["terminated"], true);
    assert_eq!(provider.state_of(&id), Some(LifecycleState::Terminated));

    let response = server
        .post("/machines/terminate")
        .json(&json!({ "address": "10.255.0.1", "timeout_secs": 10 }))
        .await;
    let body: serde_json::Value = response.json();
    assert_eq!(body["terminated"], false);
}

#[tokio::test]
async fn test_upstream_failure_is_bad_gateway() {
    let (server, _) = server(harness(MockProvider::new().with_failing_listing("Throttling")));

    let response = server.get("/fleet").await;

    assert_eq!(response.status_code(), 502);
}
