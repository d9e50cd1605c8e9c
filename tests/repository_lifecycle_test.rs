//! End-to-end exercises of the durable task lifecycle against a real
//! file-backed store, covering the concrete scenarios from the lifecycle
//! contract: basic success, retry-then-success, attempt exhaustion, lease
//! expiry reclaim, critical blocker, and idempotent short-circuit.

use serde_json::json;
use taskloom::model::{CompleteAttempt, NewTask};
use taskloom::repository::TaskFilter;
use taskloom::{Repository, Store};

async fn test_repository() -> Repository {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.keep().join("queue.sqlite");
    let store = Store::open(&db_path).await.expect("open store");
    Repository::new(store)
}

#[tokio::test]
async fn basic_lean_success() {
    let repo = test_repository().await;

    let task = repo
        .create_task(NewTask {
            r#type: None,
            title: None,
            prompt: "say hi".to_string(),
            success_criteria: None,
            priority: None,
            mode: Some("lean".to_string()),
            metadata: None,
            max_attempts: None,
        }, 3)
        .await
        .unwrap();
    assert_eq!(task.status, "queued");
    assert_eq!(task.title, "Untitled task");

    let claimed = repo.claim_next_task("w1", 60_000).await.unwrap().unwrap();
    assert_eq!(claimed.id, task.id);
    assert_eq!(claimed.status, "leased");

    let started = repo.start_attempt(&task.id, "w1").await.unwrap().unwrap();
    assert_eq!(started.attempt_no, 1);

    let status = repo
        .complete_attempt(
            &task.id,
            CompleteAttempt {
                worker_id: "w1".to_string(),
                succeeded: true,
                blocked: false,
                final_phase: "report".to_string(),
                output_json: json!({
                    "mode": {"configured": "lean", "effective": "lean"},
                    "phase_outputs": {
                        "execute": {"status": "succeeded"},
                        "verify": {"pass": true},
                        "report": {"message_markdown": "done"}
                    },
                    "run_dir": "/runs/r1"
                }),
                error_message: None,
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, "done");

    let task = repo.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, "done");
    assert_eq!(task.attempt_count, 1);

    let attempts = repo.list_attempts(&task.id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, "done");

    let content = taskloom::gateway::envelope::extract_user_output(&attempts[0].output());
    assert_eq!(content, json!("done"));
}

#[tokio::test]
async fn retry_on_failure_then_success() {
    let repo = test_repository().await;

    let task = repo
        .create_task(NewTask {
            r#type: None,
            title: None,
            prompt: "flaky task".to_string(),
            success_criteria: None,
            priority: None,
            mode: Some("lean".to_string()),
            metadata: None,
            max_attempts: Some(3),
        }, 3)
        .await
        .unwrap();

    repo.claim_next_task("w1", 60_000).await.unwrap().unwrap();
    repo.start_attempt(&task.id, "w1").await.unwrap().unwrap();
    repo.complete_attempt(
        &task.id,
        CompleteAttempt {
            worker_id: "w1".to_string(),
            succeeded: false,
            blocked: false,
            final_phase: "execute".to_string(),
            output_json: json!({}),
            error_message: Some("boom".to_string()),
        },
    )
    .await
    .unwrap();

    let task = repo.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, "queued");
    assert_eq!(task.attempt_count, 1);

    repo.claim_next_task("w2", 60_000).await.unwrap().unwrap();
    let started = repo.start_attempt(&task.id, "w2").await.unwrap().unwrap();
    assert_eq!(started.attempt_no, 2);

    repo.complete_attempt(
        &task.id,
        CompleteAttempt {
            worker_id: "w2".to_string(),
            succeeded: true,
            blocked: false,
            final_phase: "report".to_string(),
            output_json: json!({}),
            error_message: None,
        },
    )
    .await
    .unwrap();

    let task = repo.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, "done");
    assert_eq!(task.attempt_count, 2);

    let attempts = repo.list_attempts(&task.id).await.unwrap();
    assert_eq!(attempts.len(), 2);
}

#[tokio::test]
async fn exhausts_attempts_and_fails() {
    let repo = test_repository().await;

    let task = repo
        .create_task(NewTask {
            r#type: None,
            title: None,
            prompt: "always fails".to_string(),
            success_criteria: None,
            priority: None,
            mode: Some("lean".to_string()),
            metadata: None,
            max_attempts: Some(3),
        }, 3)
        .await
        .unwrap();

    for worker in ["w1", "w2", "w3"] {
        repo.claim_next_task(worker, 60_000).await.unwrap().unwrap();
        repo.start_attempt(&task.id, worker).await.unwrap().unwrap();
        repo.complete_attempt(
            &task.id,
            CompleteAttempt {
                worker_id: worker.to_string(),
                succeeded: false,
                blocked: false,
                final_phase: "execute".to_string(),
                output_json: json!({}),
                error_message: Some("boom".to_string()),
            },
        )
        .await
        .unwrap();
    }

    let task = repo.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, "failed");
    assert_eq!(task.attempt_count, 3);
    assert_eq!(task.last_error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn lease_expiry_is_reclaimed_by_another_worker() {
    let repo = test_repository().await;

    let task = repo
        .create_task(NewTask {
            r#type: None,
            title: None,
            prompt: "slow task".to_string(),
            success_criteria: None,
            priority: None,
            mode: None,
            metadata: None,
            max_attempts: Some(3),
        }, 3)
        .await
        .unwrap();

    repo.claim_next_task("w1", 50).await.unwrap().unwrap();
    repo.start_attempt(&task.id, "w1").await.unwrap().unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;

    let reclaimed = repo.claim_next_task("w2", 60_000).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, task.id);
    assert_eq!(reclaimed.lease_owner.as_deref(), Some("w2"));

    let started = repo.start_attempt(&task.id, "w2").await.unwrap().unwrap();
    assert_eq!(started.attempt_no, 2);

    let task_row = repo.get_task(&task.id).await.unwrap();
    assert_eq!(task_row.attempt_count, 1);

    // The first worker's own completion call now loses the race (stale
    // owner) and is a no-op — it must not clobber worker 2's attempt.
    let stale = repo
        .complete_attempt(
            &task.id,
            CompleteAttempt {
                worker_id: "w1".to_string(),
                succeeded: true,
                blocked: false,
                final_phase: "report".to_string(),
                output_json: json!({}),
                error_message: None,
            },
        )
        .await
        .unwrap();
    assert!(stale.is_none());
}

#[tokio::test]
async fn critical_blocker_moves_task_to_blocked() {
    let repo = test_repository().await;

    let task = repo
        .create_task(NewTask {
            r#type: None,
            title: None,
            prompt: "needs clarification".to_string(),
            success_criteria: None,
            priority: None,
            mode: Some("full".to_string()),
            metadata: None,
            max_attempts: Some(3),
        }, 3)
        .await
        .unwrap();

    repo.claim_next_task("w1", 60_000).await.unwrap().unwrap();
    repo.start_attempt(&task.id, "w1").await.unwrap().unwrap();

    repo.complete_attempt(
        &task.id,
        CompleteAttempt {
            worker_id: "w1".to_string(),
            succeeded: false,
            blocked: true,
            final_phase: "interpret".to_string(),
            output_json: json!({
                "report": {"clarifications_needed": ["need account id"]}
            }),
            error_message: Some("blocked_for_clarification".to_string()),
        },
    )
    .await
    .unwrap();

    let task = repo.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, "blocked");
    assert_eq!(task.attempt_count, 1);

    let attempts = repo.list_attempts(&task.id).await.unwrap();
    assert_eq!(attempts[0].status, "blocked");
}

#[tokio::test]
async fn idempotency_marker_round_trips_through_state() {
    let repo = test_repository().await;

    let key = "idempotency:abc123";
    assert!(repo.get_state(key).await.unwrap().is_none());

    let before = taskloom::model::now_rfc3339();
    let row = repo
        .set_state(key, &json!({ "completed_at": "now" }))
        .await
        .unwrap();
    assert!(row.updated_at >= before);

    let fetched = repo.get_state(key).await.unwrap().unwrap();
    assert_eq!(fetched.value(), json!({ "completed_at": "now" }));
}

#[tokio::test]
async fn list_tasks_orders_by_priority_then_created_at() {
    let repo = test_repository().await;

    for (prompt, priority) in [("low", 5), ("high", 1), ("mid", 3)] {
        repo.create_task(NewTask {
            r#type: None,
            title: None,
            prompt: prompt.to_string(),
            success_criteria: None,
            priority: Some(priority),
            mode: None,
            metadata: None,
            max_attempts: None,
        }, 3)
        .await
        .unwrap();
    }

    let tasks = repo.list_tasks(&TaskFilter::default()).await.unwrap();
    let prompts: Vec<_> = tasks.iter().map(|t| t.prompt.as_str()).collect();
    assert_eq!(prompts, vec!["high", "mid", "low"]);
}

#[tokio::test]
async fn events_are_append_only_and_ordered() {
    let repo = test_repository().await;

    let task = repo
        .create_task(NewTask {
            r#type: None,
            title: None,
            prompt: "log some events".to_string(),
            success_criteria: None,
            priority: None,
            mode: None,
            metadata: None,
            max_attempts: None,
        }, 3)
        .await
        .unwrap();

    repo.append_event(Some(&task.id), None, Some("execute"), "info", "step one", None)
        .await
        .unwrap();
    repo.append_event(Some(&task.id), None, Some("execute"), "warn", "step two", None)
        .await
        .unwrap();

    let events = repo.list_events(10, Some(&task.id)).await.unwrap();
    // Newest first; task_created, step one, step two => step two is newest.
    assert_eq!(events[0].message, "step two");
    assert_eq!(events.last().unwrap().message, "task_created");
}
