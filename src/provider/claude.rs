//! Structured stream-JSON adapter — modeled on the daemon's `ClaudeCodeRunner`
//! and its `ClaudeEvent` tagged enum. Spawns `claude` in stream-json mode;
//! each output line is itself a JSON record with a distinguished terminal
//! `result` record.

use super::{Command, ModelEvent, ModelEventKind, ModelEventType, ProviderAdapter};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Mutex;

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeEvent {
    Assistant { message: Value },
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },
    #[serde(rename = "tool_result")]
    ToolResult { content: Value },
    Result {
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: Option<bool>,
    },
    System {
        #[serde(default)]
        subtype: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Default)]
pub struct ClaudeAdapter {
    terminal_result: Mutex<Option<String>>,
}

impl ProviderAdapter for ClaudeAdapter {
    fn build_command(&self, prompt: &str, schema: Option<&Value>) -> Command {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
        ];
        if let Some(schema) = schema {
            args.push("--output-schema".to_string());
            args.push(schema.to_string());
        }
        Command {
            program: "claude".to_string(),
            args,
            stdin: Some(prompt.to_string()),
        }
    }

    fn handle_output_line(&self, line: &str) -> Option<ModelEvent> {
        let parsed: ClaudeEvent = serde_json::from_str(line).ok()?;
        match parsed {
            ClaudeEvent::Assistant { message } => Some(ModelEvent {
                level: "info".to_string(),
                model_event_kind: ModelEventKind::AssistantMessage,
                kind: ModelEventType::Message,
                message: Some(message),
                summary: None,
                result_message: None,
            }),
            ClaudeEvent::ToolUse { name, input } => Some(ModelEvent {
                level: "info".to_string(),
                model_event_kind: ModelEventKind::AssistantMessage,
                kind: ModelEventType::ToolUse,
                message: Some(serde_json::json!({ "name": name, "input": input })),
                summary: Some(format!("tool_use:{name}")),
                result_message: None,
            }),
            ClaudeEvent::ToolResult { content } => Some(ModelEvent {
                level: "info".to_string(),
                model_event_kind: ModelEventKind::AssistantToolResult,
                kind: ModelEventType::ToolUse,
                message: Some(content),
                summary: None,
                result_message: None,
            }),
            ClaudeEvent::Result {
                subtype,
                result,
                is_error,
            } => {
                let is_err = is_error.unwrap_or(false);
                *self.terminal_result.lock().unwrap() = result.clone();
                Some(ModelEvent {
                    level: if is_err { "error" } else { "info" }.to_string(),
                    model_event_kind: if is_err {
                        ModelEventKind::Result
                    } else {
                        ModelEventKind::ResultSuccess
                    },
                    kind: ModelEventType::Result,
                    message: None,
                    summary: Some(subtype),
                    result_message: result,
                })
            }
            ClaudeEvent::System { subtype } => Some(ModelEvent {
                level: "debug".to_string(),
                model_event_kind: ModelEventKind::System,
                kind: ModelEventType::Unknown,
                message: subtype.map(Value::String),
                summary: None,
                result_message: None,
            }),
            ClaudeEvent::Unknown => None,
        }
    }

    fn is_terminal_stream(&self) -> bool {
        true
    }

    fn terminal_result_text(&self) -> Option<String> {
        self.terminal_result.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_result_line_and_remembers_it() {
        let adapter = ClaudeAdapter::default();
        let line = r#"{"type":"result","subtype":"success","result":"{\"status\":\"succeeded\"}","is_error":false}"#;
        let event = adapter.handle_output_line(line).unwrap();
        assert_eq!(event.model_event_kind, ModelEventKind::ResultSuccess);
        assert_eq!(
            adapter.terminal_result_text(),
            Some(r#"{"status":"succeeded"}"#.to_string())
        );
    }

    #[test]
    fn unrecognized_tag_yields_no_event() {
        let adapter = ClaudeAdapter::default();
        assert!(adapter
            .handle_output_line(r#"{"type":"some_future_event"}"#)
            .is_none());
    }
}
