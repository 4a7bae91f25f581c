//! HTTP Smoke Tests
//!
//! **Property 1: Relay Dedup Over HTTP**
//! Pushing the same envelope twice SHALL return 201 then 409, and the relay
//! SHALL hold exactly one copy.
//!
//! **Property 2: Local Writes Are Readable**
//! A message accepted by POST /messages SHALL be readable by content hash.
//!
//! **Property 3: Error Mapping**
//! Unknown nodes SHALL map to 404 and out-of-range limits to 400.
//!
//! **Property 4: Only the Local Engine Is Managed**
//! Lifecycle requests for another node SHALL answer 409 and leave it alone.
//!
//! **Property 5: Agent and Task Control**
//! Agents start, stop and restart only on READY nodes; tasks dispatch only
//! after their dependencies complete.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use commander_api::{create_router, ApiConfig, AppState};
use commander_core::{MessageEnvelope, MessageType, NodeRole, NodeStatus};
use commander_test_utils::fixtures::{command_envelope, ready_node};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    _dir: TempDir,
    state: AppState,
}

impl TestApp {
    fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let config = ApiConfig {
            data_dir: dir.path().join("data"),
            config_dir: dir.path().join("config"),
            map_size_mb: 16,
            ..ApiConfig::default()
        };
        let state = AppState::open(config).expect("open state");
        Self { _dir: dir, state }
    }

    fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, body)
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    json_request("POST", uri, body)
}

fn put_json(uri: &str, body: &Value) -> Request<Body> {
    json_request("PUT", uri, body)
}

fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

#[tokio::test]
async fn test_ping_and_health() {
    let app = TestApp::new();

    let (status, body) = app.send(get("/health/ping")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("pong".to_string()));

    let (status, body) = app.send(get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("status").is_some());
}

#[tokio::test]
async fn test_relay_immediate_rejects_duplicate() {
    let app = TestApp::new();
    let envelope = MessageEnvelope::builder("htpc", "main", MessageType::Event)
        .json_payload(&json!({ "seq": 1 }))
        .build();
    let body = serde_json::to_value(&envelope).expect("serialize");

    let (status, stored) = app.send(post_json("/relay/immediate", &body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(stored["content_hash"], Value::String(envelope.content_hash.clone()));

    let (status, _) = app.send(post_json("/relay/immediate", &body)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let relay = app.state.relay.as_ref().expect("relay hosted");
    assert_eq!(relay.count().expect("count"), 1);

    let uri = format!("/relay/envelopes/{}", envelope.content_hash);
    let (status, fetched) = app.send(get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["sender_id"], Value::String("htpc".to_string()));
}

#[tokio::test]
async fn test_relay_rejects_tampered_hash() {
    let app = TestApp::new();
    let envelope = MessageEnvelope::builder("htpc", "main", MessageType::Event).build();
    let mut body = serde_json::to_value(&envelope).expect("serialize");
    body["recipient_id"] = Value::String("laptop".to_string());

    let (status, _) = app.send(post_json("/relay/immediate", &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_send_message_then_read_back() {
    let app = TestApp::new();
    let request = json!({
        "recipient_id": "htpc",
        "message_type": "command",
        "task_id": "task-1",
        "payload": { "command": "summarize" }
    });

    let (status, created) = app.send(post_json("/messages", &request)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["stored"], Value::Bool(true));
    let hash = created["content_hash"].as_str().expect("hash").to_string();

    let (status, fetched) = app.send(get(&format!("/messages/{hash}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["sender_id"], Value::String("main".to_string()));
    assert_eq!(fetched["task_id"], Value::String("task-1".to_string()));

    let (status, _) = app.send(get("/messages/not-a-hash")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_node_is_not_found() {
    let app = TestApp::new();
    let (status, body) = app.send(get("/nodes/nowhere")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.get("code").is_some());
}

#[tokio::test]
async fn test_relay_query_limit_bounds() {
    let app = TestApp::new();

    let (status, _) = app.send(get("/relay/query?limit=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, page) = app.send(get("/relay/query?limit=5")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(page.is_object());
}

#[tokio::test]
async fn test_system_status_reports_local_node() {
    let app = TestApp::new();
    let (status, body) = app.send(get("/system/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["local_node_id"], Value::String("main".to_string()));
    assert_eq!(body["relay_mode"], Value::String("both".to_string()));
}

#[tokio::test]
async fn test_remote_node_start_is_conflict() {
    let app = TestApp::new();
    ready_node(&app.state.registry, "htpc", 130, NodeRole::Worker);
    app.state.registry.mark_offline("htpc", "test").expect("offline");

    let (status, body) = app.send(post_empty("/nodes/htpc/start")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["details"]["local_node_id"], Value::String("main".to_string()));

    let (status, _) = app.send(post_empty("/nodes/htpc/stop")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let node = app.state.registry.get_node("htpc").expect("node");
    assert_eq!(node.status, NodeStatus::Offline);
}

#[tokio::test]
async fn test_agent_stop_start_and_config() {
    let app = TestApp::new();
    ready_node(&app.state.registry, "htpc", 130, NodeRole::Worker);
    let agent = json!({ "id": "coder-1", "node_id": "htpc", "role": "worker" });
    let (status, _) = app.send(post_json("/agents", &agent)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = app.send(post_empty("/agents/coder-1/stop")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], Value::String("stopped".to_string()));

    let (status, body) = app.send(post_empty("/agents/coder-1/start")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], Value::String("idle".to_string()));

    let params = json!({ "context_size": 4096 });
    let (status, body) = app.send(put_json("/agents/coder-1/config", &params)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["restarts"], json!(1));
    let (status, body) = app.send(get("/agents/coder-1/config")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, params);

    let (status, _) = app.send(post_empty("/agents/ghost/start")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_agent_on_failed_node_cannot_restart() {
    let app = TestApp::new();
    ready_node(&app.state.registry, "htpc", 130, NodeRole::Worker);
    app.state
        .registry
        .register_agent("coder-1", "htpc", "worker")
        .expect("agent");
    app.state.registry.mark_error("htpc", "engine crashed").expect("error");

    let (status, body) = app.send(post_empty("/agents/coder-1/restart")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body.get("code").is_some());
}

#[tokio::test]
async fn test_recent_context_is_bounded() {
    let app = TestApp::new();
    let relay = app.state.relay.as_ref().expect("relay hosted");
    relay
        .insert(&command_envelope("main", "htpc", "task-ctx"))
        .expect("insert");
    let reply = MessageEnvelope::builder("htpc", "main", MessageType::Response)
        .task_id("task-ctx")
        .json_payload(&json!("summary ready"))
        .build();
    relay.insert(&reply).expect("insert");

    let (status, body) = app.send(get("/relay/context/task-ctx")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task_id"], Value::String("task-ctx".to_string()));
    assert_eq!(body["included"], json!(2));
    let text = body["text"].as_str().expect("text");
    assert!(text.contains("main -> htpc (command)"));
    assert!(text.contains("htpc -> main (response): summary ready"));

    let (status, body) = app.send(get("/relay/context/task-ctx?max_tokens=1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["included"], json!(0));

    let (status, _) = app.send(get("/relay/context/task-ctx?max_tokens=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_task_dispatch_waits_for_dependencies() {
    let app = TestApp::new();
    ready_node(&app.state.registry, "htpc", 130, NodeRole::Worker);

    let plan = json!({ "id": "plan", "role_assignments": { "worker": "htpc" } });
    let (status, _) = app.send(post_json("/tasks", &plan)).await;
    assert_eq!(status, StatusCode::CREATED);
    let build = json!({ "id": "build", "dependencies": ["plan"] });
    let (status, _) = app.send(post_json("/tasks", &build)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = app.send(post_empty("/tasks/build/dispatch")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["details"]["pending"], json!(["plan"]));

    let (status, body) = app.send(post_empty("/tasks/plan/dispatch")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["commands"].as_array().expect("commands").len(), 1);
    let (status, _) = app.send(post_empty("/tasks/plan/complete")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.send(post_empty("/tasks/build/dispatch")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task"]["status"], Value::String("dispatched".to_string()));

    let (status, _) = app.send(get("/tasks/nowhere")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
