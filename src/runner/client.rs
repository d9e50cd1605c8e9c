//! Thin HTTP client the Phase Runner uses to call back into the Gateway.

use crate::model::TaskRow;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
pub struct LeasedTask {
    pub task: TaskRow,
    pub attempt_no: i64,
    pub attempt_id: i64,
}

#[derive(Debug, Deserialize)]
struct LeaseResponse {
    #[serde(default)]
    task: Option<TaskRow>,
    #[serde(default)]
    attempt_no: Option<i64>,
    #[serde(default)]
    attempt_id: Option<i64>,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub async fn lease(&self, worker_id: &str, lease_ttl_ms: u64) -> Result<Option<LeasedTask>> {
        let resp: LeaseResponse = self
            .http
            .post(format!("{}/tasks/lease", self.base_url))
            .json(&json!({ "worker_id": worker_id, "lease_ttl_ms": lease_ttl_ms }))
            .send()
            .await
            .context("lease request")?
            .error_for_status()
            .context("lease request returned error status")?
            .json()
            .await
            .context("decoding lease response")?;

        Ok(match (resp.task, resp.attempt_no, resp.attempt_id) {
            (Some(task), Some(attempt_no), Some(attempt_id)) => Some(LeasedTask {
                task,
                attempt_no,
                attempt_id,
            }),
            _ => None,
        })
    }

    pub async fn heartbeat(&self, task_id: &str, worker_id: &str, lease_ttl_ms: u64) -> Result<()> {
        self.http
            .post(format!("{}/tasks/{}/heartbeat", self.base_url, task_id))
            .json(&json!({ "worker_id": worker_id, "lease_ttl_ms": lease_ttl_ms }))
            .send()
            .await
            .context("heartbeat request")?
            .error_for_status()
            .context("heartbeat request returned error status")?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn complete(
        &self,
        task_id: &str,
        worker_id: &str,
        succeeded: bool,
        blocked: bool,
        final_phase: &str,
        output_json: Value,
        error_message: Option<String>,
    ) -> Result<()> {
        self.http
            .post(format!("{}/tasks/{}/complete", self.base_url, task_id))
            .json(&json!({
                "worker_id": worker_id,
                "succeeded": succeeded,
                "blocked": blocked,
                "final_phase": final_phase,
                "output_json": output_json,
                "error_message": error_message,
            }))
            .send()
            .await
            .context("complete request")?
            .error_for_status()
            .context("complete request returned error status")?;
        Ok(())
    }

    /// Fetches a `RunState` value, used for the idempotency-marker lookup.
    /// Returns `None` when the key has never been set (404 from the Gateway).
    pub async fn get_state(&self, key: &str) -> Result<Option<Value>> {
        let resp = self
            .http
            .get(format!("{}/state/{}", self.base_url, key))
            .send()
            .await
            .context("get state request")?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body: Value = resp
            .error_for_status()
            .context("get state request returned error status")?
            .json()
            .await
            .context("decoding state response")?;

        Ok(body.get("value").cloned())
    }

    /// Upserts a `RunState` value, used to record an idempotency marker.
    pub async fn set_state(&self, key: &str, value: Value) -> Result<()> {
        self.http
            .post(format!("{}/state/{}", self.base_url, key))
            .json(&json!({ "value": value }))
            .send()
            .await
            .context("set state request")?
            .error_for_status()
            .context("set state request returned error status")?;
        Ok(())
    }

    /// Appends an event carrying a full streaming envelope under
    /// `data.envelope`, per the streaming-endpoint's replay contract.
    pub async fn append_envelope_event(
        &self,
        task_id: &str,
        worker_id: &str,
        attempt_id: i64,
        phase: &str,
        envelope: Value,
    ) -> Result<()> {
        self.http
            .post(format!("{}/tasks/{}/events", self.base_url, task_id))
            .json(&json!({
                "worker_id": worker_id,
                "attempt_id": attempt_id,
                "phase": phase,
                "level": "info",
                "message": "stream",
                "data": { "envelope": envelope },
            }))
            .send()
            .await
            .context("append event request")?
            .error_for_status()
            .context("append event request returned error status")?;
        Ok(())
    }
}
