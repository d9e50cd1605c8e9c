//! Domain model: Task, TaskAttempt, Event, RunState.
//!
//! Row-struct shape follows the daemon's `AgentTaskRow`/`ActivityLogRow`
//! convention (`#[derive(sqlx::FromRow, Serialize, Deserialize)]`), adapted
//! to use RFC3339 string timestamps throughout so lexicographic and
//! chronological ordering coincide.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Leased,
    Running,
    Done,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Leased => "leased",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed | TaskStatus::Blocked)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => TaskStatus::Queued,
            "leased" => TaskStatus::Leased,
            "running" => TaskStatus::Running,
            "done" => TaskStatus::Done,
            "failed" => TaskStatus::Failed,
            "blocked" => TaskStatus::Blocked,
            other => anyhow::bail!("unknown task status {other:?}"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    Done,
    Failed,
    Blocked,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Running => "running",
            AttemptStatus::Done => "done",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskRow {
    pub id: String,
    #[sqlx(rename = "task_type")]
    pub r#type: String,
    pub title: String,
    pub prompt: String,
    pub success_criteria: Option<String>,
    pub task_request_json: String,
    pub mode: String,
    pub priority: i64,
    pub attempt_count: i64,
    pub max_attempts: i64,
    pub status: String,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskRow {
    pub fn task_request(&self) -> Value {
        serde_json::from_str(&self.task_request_json).unwrap_or(Value::Null)
    }

    pub fn status(&self) -> TaskStatus {
        self.status.parse().unwrap_or(TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AttemptRow {
    pub id: i64,
    pub task_id: String,
    pub attempt_no: i64,
    pub status: String,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<String>,
    pub phase: Option<String>,
    pub output_json: String,
    pub started_at: String,
    pub finished_at: Option<String>,
}

impl AttemptRow {
    pub fn output(&self) -> Value {
        serde_json::from_str(&self.output_json).unwrap_or_else(|_| serde_json::json!({}))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventRow {
    pub id: i64,
    pub task_id: Option<String>,
    pub attempt_id: Option<i64>,
    pub phase: Option<String>,
    pub level: String,
    pub message: String,
    pub data_json: Option<String>,
    pub created_at: String,
}

impl EventRow {
    pub fn data(&self) -> Option<Value> {
        self.data_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StateRow {
    pub key: String,
    pub value_json: String,
    pub updated_at: String,
}

impl StateRow {
    pub fn value(&self) -> Value {
        serde_json::from_str(&self.value_json).unwrap_or(Value::Null)
    }
}

/// Input for `Repository::create_task`. All fields but `prompt` are
/// optional in the request body — `#[serde(default)]` is required for that
/// (serde does not infer "absent key" -> `None` from the type alone).
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    #[serde(default, rename = "type")]
    pub r#type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub success_criteria: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub max_attempts: Option<i64>,
}

/// Input for `Repository::complete_attempt`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompleteAttempt {
    pub worker_id: String,
    pub succeeded: bool,
    pub blocked: bool,
    pub final_phase: String,
    pub output_json: Value,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Fixed-width millisecond-precision RFC3339 (`SecondsFormat::Millis`) so
/// that lexicographic string comparison of stored timestamps always agrees
/// with chronological order. `chrono`'s default `to_rfc3339()` trims
/// trailing fractional-second zeros (`SecondsFormat::AutoSi`), which yields
/// variable-width strings that sort incorrectly against each other.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Same fixed-width formatting as [`now_rfc3339`], for timestamps derived
/// from an existing `DateTime<Utc>` (e.g. `now + lease_ttl`).
pub fn format_rfc3339(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn clamp_priority(p: Option<i64>) -> i64 {
    p.unwrap_or(3).clamp(1, 5)
}
