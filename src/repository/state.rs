use super::Repository;
use crate::error::AppResult;
use crate::model::{now_rfc3339, StateRow};
use serde_json::Value;

impl Repository {
    pub async fn get_state(&self, key: &str) -> AppResult<Option<StateRow>> {
        let row = sqlx::query_as::<_, StateRow>("SELECT * FROM run_state WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Upsert semantics via `ON CONFLICT(key) DO UPDATE`, mirroring the
    /// daemon's settings-table idiom in `storage::mod::set_setting`.
    pub async fn set_state(&self, key: &str, value: &Value) -> AppResult<StateRow> {
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO run_state (key, value_json, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value.to_string())
        .bind(&now)
        .execute(self.pool())
        .await?;

        Ok(self.get_state(key).await?.expect("just upserted"))
    }
}
