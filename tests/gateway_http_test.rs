//! Exercises the Gateway's HTTP surface end-to-end: a real axum server bound
//! to an ephemeral port, a real file-backed store, and plain `reqwest`
//! calls — no mocks. Grounded on the daemon's `tests/integration_test.rs`
//! pattern of spinning up real infrastructure on a free port and driving it
//! through its public protocol.

use serde_json::{json, Value};
use std::sync::Arc;
use taskloom::{gateway, Config, GatewayState, Repository, Store};

async fn spawn_test_gateway() -> String {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.keep().join("queue.sqlite");
    let store = Store::open(&db_path).await.unwrap();
    let repo = Repository::new(store);

    let mut config = Config::from_env().unwrap_or_else(|_| panic!("default config must load"));
    config.db_path = db_path;

    let state = GatewayState::new(Arc::new(config), Arc::new(repo));
    let router = gateway::build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    format!("http://{addr}")
}

#[tokio::test]
async fn health_check_reports_ok() {
    let base = spawn_test_gateway().await;
    let client = reqwest::Client::new();

    let resp: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["status"], "ok");
}

#[tokio::test]
async fn queue_lease_heartbeat_complete_round_trip() {
    let base = spawn_test_gateway().await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{base}/tasks/queue"))
        .json(&json!({ "prompt": "say hi", "mode": "lean" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let task_id = created["task_id"].as_str().unwrap().to_string();

    let leased: Value = client
        .post(format!("{base}/tasks/lease"))
        .json(&json!({ "worker_id": "w1", "lease_ttl_ms": 60_000 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(leased["task"]["id"], task_id);
    assert_eq!(leased["attempt_no"], 1);

    let hb: Value = client
        .post(format!("{base}/tasks/{task_id}/heartbeat"))
        .json(&json!({ "worker_id": "w1" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(hb["ok"], true);

    let complete: Value = client
        .post(format!("{base}/tasks/{task_id}/complete"))
        .json(&json!({
            "worker_id": "w1",
            "succeeded": true,
            "blocked": false,
            "final_phase": "report",
            "output_json": { "phase_outputs": { "report": { "message_markdown": "done" } } },
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(complete["ok"], true);
    assert_eq!(complete["status"], "done");

    let task: Value = client
        .get(format!("{base}/tasks/{task_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(task["status"], "done");
    assert_eq!(task["attempt_count"], 1);
}

#[tokio::test]
async fn validation_rejects_empty_prompt() {
    let base = spawn_test_gateway().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/tasks/queue"))
        .json(&json!({ "prompt": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn lease_with_no_queued_tasks_returns_null_task() {
    let base = spawn_test_gateway().await;
    let client = reqwest::Client::new();

    let resp: Value = client
        .post(format!("{base}/tasks/lease"))
        .json(&json!({ "worker_id": "w1" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(resp["task"].is_null());
}

#[tokio::test]
async fn state_roundtrips_and_404s_when_missing() {
    let base = spawn_test_gateway().await;
    let client = reqwest::Client::new();

    let missing = client
        .get(format!("{base}/state/does-not-exist"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let set: Value = client
        .post(format!("{base}/state/my-key"))
        .json(&json!({ "value": { "hello": "world" } }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(set["value"]["hello"], "world");

    let get: Value = client
        .get(format!("{base}/state/my-key"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(get["value"]["hello"], "world");
}
