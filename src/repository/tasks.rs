use super::Repository;
use crate::error::{AppError, AppResult};
use crate::model::{clamp_priority, now_rfc3339, NewTask, TaskRow};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<String>,
}

impl Repository {
    /// Creates a task with status `queued` and appends a `task_created` event,
    /// all inside one transaction. `default_max_attempts` (from
    /// `QUEUE_MAX_ATTEMPTS`) applies unless the request overrides it.
    pub async fn create_task(&self, input: NewTask, default_max_attempts: i64) -> AppResult<TaskRow> {
        if input.prompt.trim().is_empty() {
            return Err(AppError::Validation("prompt must not be empty".into()));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let title = input
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "Untitled task".to_string());
        let task_type = input.r#type.unwrap_or_else(|| "generic".to_string());
        let mode = input.mode.unwrap_or_else(|| "auto".to_string());
        if !matches!(mode.as_str(), "auto" | "lean" | "full") {
            return Err(AppError::Validation(format!(
                "mode must be one of auto, lean, full — got {mode:?}"
            )));
        }
        let priority = clamp_priority(input.priority);
        let max_attempts = input.max_attempts.unwrap_or(default_max_attempts).max(1);

        let task_request = serde_json::json!({
            "mode": mode,
            "metadata": input.metadata.unwrap_or(serde_json::Value::Null),
        });
        let task_request_json = task_request.to_string();

        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "INSERT INTO tasks
                (id, task_type, title, prompt, success_criteria, task_request_json, mode,
                 priority, attempt_count, max_attempts, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, 'queued', ?, ?)",
        )
        .bind(&id)
        .bind(&task_type)
        .bind(&title)
        .bind(&input.prompt)
        .bind(&input.success_criteria)
        .bind(&task_request_json)
        .bind(&mode)
        .bind(priority)
        .bind(max_attempts)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO events (task_id, phase, level, message, data_json, created_at)
             VALUES (?, NULL, 'info', 'task_created', ?, ?)",
        )
        .bind(&id)
        .bind(serde_json::json!({ "title": title }).to_string())
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(task_id = %id, "task created");
        self.get_task(&id).await
    }

    pub async fn get_task(&self, id: &str) -> AppResult<TaskRow> {
        sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {id} not found")))
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> AppResult<Vec<TaskRow>> {
        let rows = match &filter.status {
            Some(status) => {
                sqlx::query_as::<_, TaskRow>(
                    "SELECT * FROM tasks WHERE status = ? ORDER BY priority ASC, created_at ASC",
                )
                .bind(status)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, TaskRow>(
                    "SELECT * FROM tasks ORDER BY priority ASC, created_at ASC",
                )
                .fetch_all(self.pool())
                .await?
            }
        };
        Ok(rows)
    }

    /// Moves every task whose lease has expired back to `queued` (or `failed`
    /// if it has exhausted `max_attempts`), clearing lease fields and
    /// appending a `lease_expired` event. Runs as one transaction.
    pub async fn recover_expired_leases(&self) -> AppResult<usize> {
        let now = now_rfc3339();

        let expired: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT id, attempt_count, max_attempts FROM tasks
             WHERE status IN ('leased', 'running') AND lease_expires_at IS NOT NULL
               AND lease_expires_at < ?",
        )
        .bind(&now)
        .fetch_all(self.pool())
        .await?;

        if expired.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool().begin().await?;
        for (task_id, attempt_count, max_attempts) in &expired {
            let new_attempt_count = attempt_count + 1;
            let next_status = if new_attempt_count >= *max_attempts {
                "failed"
            } else {
                "queued"
            };

            let rows = sqlx::query(
                "UPDATE tasks
                 SET status = ?, attempt_count = ?, lease_owner = NULL, lease_expires_at = NULL,
                     last_error = 'Lease expired before completion', updated_at = ?
                 WHERE id = ? AND status IN ('leased', 'running')",
            )
            .bind(next_status)
            .bind(new_attempt_count)
            .bind(&now)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

            if rows.rows_affected() == 0 {
                continue;
            }

            sqlx::query(
                "UPDATE attempts SET status = 'failed', finished_at = ?
                 WHERE task_id = ? AND status = 'running'",
            )
            .bind(&now)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO events (task_id, phase, level, message, data_json, created_at)
                 VALUES (?, NULL, 'warn', 'lease_expired', ?, ?)",
            )
            .bind(task_id)
            .bind(serde_json::json!({ "next_status": next_status }).to_string())
            .bind(&now)
            .execute(&mut *tx)
            .await?;

            warn!(task_id = %task_id, next_status, "lease expired — recovered");
        }
        tx.commit().await?;

        Ok(expired.len())
    }

    /// Claims the single queued task minimizing `(priority, created_at, id)`.
    /// Always sweeps expired leases first. Returns `None` if no task is
    /// available or the conditional claim update raced and lost.
    pub async fn claim_next_task(
        &self,
        worker_id: &str,
        lease_ttl_ms: u64,
    ) -> AppResult<Option<TaskRow>> {
        self.recover_expired_leases().await?;

        let now = chrono::Utc::now();
        let lease_expires_at = crate::model::format_rfc3339(
            now + chrono::Duration::milliseconds(lease_ttl_ms as i64),
        );
        let now = crate::model::format_rfc3339(now);

        let candidate: Option<String> = sqlx::query_scalar(
            "SELECT id FROM tasks WHERE status = 'queued'
             ORDER BY priority ASC, created_at ASC, id ASC LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;

        let Some(task_id) = candidate else {
            return Ok(None);
        };

        let rows = sqlx::query(
            "UPDATE tasks SET status = 'leased', lease_owner = ?, lease_expires_at = ?,
                 updated_at = ?
             WHERE id = ? AND status = 'queued'",
        )
        .bind(worker_id)
        .bind(&lease_expires_at)
        .bind(&now)
        .bind(&task_id)
        .execute(self.pool())
        .await?;

        if rows.rows_affected() == 0 {
            // Lost the race to another worker.
            return Ok(None);
        }

        info!(task_id = %task_id, worker_id, "task claimed");
        Ok(Some(self.get_task(&task_id).await?))
    }
}
