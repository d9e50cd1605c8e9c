use super::Repository;
use crate::error::AppResult;
use crate::model::{now_rfc3339, EventRow};
use serde_json::Value;

impl Repository {
    /// Insert-only. `task_id`/`attempt_id` may be null for system-wide events.
    pub async fn append_event(
        &self,
        task_id: Option<&str>,
        attempt_id: Option<i64>,
        phase: Option<&str>,
        level: &str,
        message: &str,
        data: Option<&Value>,
    ) -> AppResult<i64> {
        let now = now_rfc3339();
        let data_json = data.map(|v| v.to_string());

        let id = sqlx::query(
            "INSERT INTO events (task_id, attempt_id, phase, level, message, data_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(attempt_id)
        .bind(phase)
        .bind(level)
        .bind(message)
        .bind(data_json)
        .bind(&now)
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    /// Newest-first, bounded by `limit` (clamped to `[1, 500]`). When
    /// `task_id` is given, restricts to that task's timeline; otherwise
    /// returns the global tail.
    pub async fn list_events(
        &self,
        limit: i64,
        task_id: Option<&str>,
    ) -> AppResult<Vec<EventRow>> {
        let limit = limit.clamp(1, 500);
        let rows = match task_id {
            Some(task_id) => {
                sqlx::query_as::<_, EventRow>(
                    "SELECT * FROM events WHERE task_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(task_id)
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, EventRow>(
                    "SELECT * FROM events ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
        };
        Ok(rows)
    }

    /// Ascending-by-id events for one task strictly after `after_id` — the
    /// shape the streaming endpoint polls with.
    pub async fn list_events_after(&self, task_id: &str, after_id: i64) -> AppResult<Vec<EventRow>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM events WHERE task_id = ? AND id > ? ORDER BY id ASC LIMIT 200",
        )
        .bind(task_id)
        .bind(after_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
