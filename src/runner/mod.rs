//! The worker-side Phase Runner: outer loop, pipeline drivers, idempotency,
//! output parsing, and the provider subprocess contract.
//!
//! Grounded on the daemon's `session::claude::ClaudeCodeRunner` subprocess-
//! tracking primitives (`Arc<AtomicU32>` pid, `Arc<Mutex<Option<Child>>>`)
//! for the kill-on-timeout contract, `session::codex::CodexRunner`'s
//! `Command::new(...).spawn()` + `BufReader::lines()` capture pattern, and
//! `process_pool.rs`'s `tokio::time::interval` heartbeat-timer idiom.

pub mod client;
pub mod idempotency;
pub mod parse;
pub mod pipeline;
mod prompts;

use crate::provider::ProviderAdapter;
use crate::runner::client::GatewayClient;
use anyhow::Result;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct Worker {
    client: GatewayClient,
    provider_name: String,
    worker_id: String,
    poll_interval: Duration,
    lease_ttl_ms: u64,
    phase_timeout: Duration,
}

impl Worker {
    pub fn new(
        client: GatewayClient,
        provider_name: impl Into<String>,
        poll_interval: Duration,
        lease_ttl_ms: u64,
        phase_timeout: Duration,
    ) -> Self {
        Self {
            client,
            provider_name: provider_name.into(),
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval,
            lease_ttl_ms,
            phase_timeout,
        }
    }

    /// Builds a fresh adapter instance for a single phase invocation. Each
    /// phase gets its own adapter so one adapter's interior accumulation
    /// (a terminal result, a line buffer) never leaks into the next phase.
    pub(crate) fn new_adapter(&self) -> Result<Box<dyn ProviderAdapter>> {
        crate::provider::adapter_for(&self.provider_name)
    }

    /// The outer supervisory loop: lease, heartbeat-while-working, drive the
    /// pipeline, complete exactly once. Runs forever.
    pub async fn run_forever(&self) -> Result<()> {
        loop {
            match self.client.lease(&self.worker_id, self.lease_ttl_ms).await {
                Ok(Some(leased)) => {
                    if let Err(e) = self.run_one(leased).await {
                        error!(err = %e, "task run failed");
                    }
                }
                Ok(None) => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => {
                    warn!(err = %e, "lease request failed — backing off");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn run_one(&self, leased: client::LeasedTask) -> Result<()> {
        let task_id = leased.task.id.clone();
        info!(task_id = %task_id, attempt_no = leased.attempt_no, "starting attempt");

        let heartbeat_client = self.client.clone();
        let heartbeat_task_id = task_id.clone();
        let heartbeat_worker_id = self.worker_id.clone();
        let lease_ttl_ms = self.lease_ttl_ms;
        let heartbeat_period = Duration::from_millis(lease_ttl_ms / 3).max(Duration::from_secs(1));
        let heartbeat_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_period);
            loop {
                interval.tick().await;
                if let Err(e) = heartbeat_client
                    .heartbeat(&heartbeat_task_id, &heartbeat_worker_id, lease_ttl_ms)
                    .await
                {
                    warn!(err = %e, "heartbeat failed");
                }
            }
        });

        let result = pipeline::drive(self, &leased.task, leased.attempt_no, leased.attempt_id).await;
        heartbeat_handle.abort();

        let completion = match result {
            Ok(outcome) => outcome,
            Err(e) => pipeline::Outcome::runtime_error(e.to_string()),
        };

        self.client
            .complete(
                &task_id,
                &self.worker_id,
                completion.succeeded,
                completion.blocked,
                &completion.final_phase,
                completion.output_json,
                completion.error_message,
            )
            .await?;

        Ok(())
    }

    pub(crate) fn phase_timeout(&self) -> Duration {
        self.phase_timeout
    }

    pub(crate) fn client(&self) -> &GatewayClient {
        &self.client
    }

    pub(crate) fn worker_id(&self) -> &str {
        &self.worker_id
    }
}
