use super::Repository;
use crate::error::{AppError, AppResult};
use crate::model::{now_rfc3339, CompleteAttempt};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct StartedAttempt {
    pub attempt_id: i64,
    pub attempt_no: i64,
    pub lease_expires_at: String,
}

impl Repository {
    /// Succeeds only if the task is `leased` and owned by `worker_id`. Flips
    /// the task to `running`, inserts a new attempt row with
    /// `attempt_no = attempt_count + 1`, and appends an `attempt_started`
    /// event, all in one transaction.
    pub async fn start_attempt(
        &self,
        task_id: &str,
        worker_id: &str,
    ) -> AppResult<Option<StartedAttempt>> {
        let now = now_rfc3339();

        let mut tx = self.pool().begin().await?;

        let row: Option<(i64, i64, Option<String>)> = sqlx::query_as(
            "SELECT attempt_count, max_attempts, lease_expires_at FROM tasks
             WHERE id = ? AND status = 'leased' AND lease_owner = ?",
        )
        .bind(task_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((attempt_count, _max_attempts, lease_expires_at)) = row else {
            return Ok(None);
        };
        let lease_expires_at = lease_expires_at
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("leased task missing lease_expires_at")))?;

        let attempt_no = attempt_count + 1;

        sqlx::query("UPDATE tasks SET status = 'running', updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        let attempt_id = sqlx::query(
            "INSERT INTO attempts
                (task_id, attempt_no, status, lease_owner, lease_expires_at, started_at)
             VALUES (?, ?, 'running', ?, ?, ?)",
        )
        .bind(task_id)
        .bind(attempt_no)
        .bind(worker_id)
        .bind(&lease_expires_at)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        sqlx::query(
            "INSERT INTO events (task_id, attempt_id, phase, level, message, data_json, created_at)
             VALUES (?, ?, NULL, 'info', 'attempt_started', ?, ?)",
        )
        .bind(task_id)
        .bind(attempt_id)
        .bind(serde_json::json!({ "attempt_no": attempt_no }).to_string())
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(task_id, worker_id, attempt_no, "attempt started");
        Ok(Some(StartedAttempt {
            attempt_id,
            attempt_no,
            lease_expires_at,
        }))
    }

    /// Extends the lease on both the task and its latest running attempt, but
    /// only if status is `leased`/`running` and owner matches. Never errors
    /// on a stale heartbeat — the worker treats a no-op heartbeat as
    /// cooperative, not fatal.
    pub async fn heartbeat(
        &self,
        task_id: &str,
        worker_id: &str,
        lease_ttl_ms: u64,
    ) -> AppResult<bool> {
        let now = chrono::Utc::now();
        let lease_expires_at = crate::model::format_rfc3339(
            now + chrono::Duration::milliseconds(lease_ttl_ms as i64),
        );

        let rows = sqlx::query(
            "UPDATE tasks SET lease_expires_at = ?
             WHERE id = ? AND lease_owner = ? AND status IN ('leased', 'running')",
        )
        .bind(&lease_expires_at)
        .bind(task_id)
        .bind(worker_id)
        .execute(self.pool())
        .await?;

        if rows.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            "UPDATE attempts SET lease_expires_at = ?
             WHERE task_id = ? AND lease_owner = ? AND status = 'running'",
        )
        .bind(&lease_expires_at)
        .bind(task_id)
        .bind(worker_id)
        .execute(self.pool())
        .await?;

        Ok(true)
    }

    /// Succeeds only if lease owner matches and status is `leased`/`running`.
    /// Determines the terminal task/attempt status from `result`, advances
    /// `attempt_count`, clears the lease, and appends a `task_completed` or
    /// `task_failed` event. All in one transaction.
    pub async fn complete_attempt(
        &self,
        task_id: &str,
        result: CompleteAttempt,
    ) -> AppResult<Option<String>> {
        let now = now_rfc3339();

        let mut tx = self.pool().begin().await?;

        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT attempt_count, max_attempts FROM tasks
             WHERE id = ? AND lease_owner = ? AND status IN ('leased', 'running')",
        )
        .bind(task_id)
        .bind(&result.worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((attempt_count, max_attempts)) = row else {
            return Ok(None);
        };

        let attempt_no = attempt_count + 1;

        let (attempt_status, task_status, event_name) = if result.blocked {
            ("blocked", "blocked", "task_blocked")
        } else if result.succeeded {
            ("done", "done", "task_completed")
        } else if attempt_no < max_attempts {
            ("failed", "queued", "task_failed")
        } else {
            ("failed", "failed", "task_failed")
        };

        sqlx::query(
            "UPDATE attempts SET status = ?, phase = ?, output_json = ?, finished_at = ?
             WHERE task_id = ? AND attempt_no = ?",
        )
        .bind(attempt_status)
        .bind(&result.final_phase)
        .bind(result.output_json.to_string())
        .bind(&now)
        .bind(task_id)
        .bind(attempt_no)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE tasks
             SET status = ?, attempt_count = ?, lease_owner = NULL, lease_expires_at = NULL,
                 last_error = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(task_status)
        .bind(attempt_no)
        .bind(&result.error_message)
        .bind(&now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO events (task_id, phase, level, message, data_json, created_at)
             VALUES (?, ?, 'info', ?, ?, ?)",
        )
        .bind(task_id)
        .bind(&result.final_phase)
        .bind(event_name)
        .bind(serde_json::json!({ "status": task_status, "attempt_no": attempt_no }).to_string())
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(task_id, task_status, attempt_no, "attempt completed");
        Ok(Some(task_status.to_string()))
    }

    pub async fn list_attempts(&self, task_id: &str) -> AppResult<Vec<crate::model::AttemptRow>> {
        let rows = sqlx::query_as::<_, crate::model::AttemptRow>(
            "SELECT * FROM attempts WHERE task_id = ? ORDER BY attempt_no ASC",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
