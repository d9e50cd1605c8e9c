//! `ProviderAdapter` — the seam between the Phase Runner and an external LLM
//! CLI tool. Grounded on the daemon's `session::runner::Runner` trait shape
//! (`#[async_trait] pub trait X: Send + Sync`).

pub mod claude;
pub mod codex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single command to spawn: program, args, and optional stdin payload.
#[derive(Debug, Clone)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelEventKind {
    AssistantMessage,
    AssistantToolResult,
    ResultSuccess,
    Result,
    System,
    User,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelEventType {
    Message,
    ToolUse,
    Result,
    Unknown,
}

/// Normalized shape every adapter maps its native stream onto, so downstream
/// consumers (event log, streaming endpoint) stay provider-agnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEvent {
    pub level: String,
    pub model_event_kind: ModelEventKind,
    #[serde(rename = "type")]
    pub kind: ModelEventType,
    pub message: Option<Value>,
    pub summary: Option<String>,
    pub result_message: Option<String>,
}

impl ModelEvent {
    pub fn unknown(raw: &str) -> Self {
        Self {
            level: "debug".to_string(),
            model_event_kind: ModelEventKind::Unknown,
            kind: ModelEventType::Unknown,
            message: Some(Value::String(raw.to_string())),
            summary: None,
            result_message: None,
        }
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Given a phase prompt and optional JSON schema, returns the command to
    /// spawn the provider process with.
    fn build_command(&self, prompt: &str, schema: Option<&Value>) -> Command;

    /// Invoked for each subprocess output line. Returns the normalized event,
    /// if the line yielded one (some adapters need several lines to form one
    /// event).
    fn handle_output_line(&self, line: &str) -> Option<ModelEvent>;

    /// True when the adapter only knows its final result once the stream
    /// closes (a distinguished terminal record), rather than incrementally.
    fn is_terminal_stream(&self) -> bool;

    /// The accumulated terminal result text, once the stream has closed.
    /// Only meaningful when `is_terminal_stream()` is true.
    fn terminal_result_text(&self) -> Option<String>;
}

pub fn adapter_for(name: &str) -> anyhow::Result<Box<dyn ProviderAdapter>> {
    match name {
        "claude" => Ok(Box::new(claude::ClaudeAdapter::default())),
        "codex" => Ok(Box::new(codex::CodexAdapter::default())),
        other => anyhow::bail!("unknown provider {other:?} — expected claude or codex"),
    }
}
