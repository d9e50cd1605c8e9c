//! Plain-line-accumulation adapter — modeled on the daemon's `CodexRunner`,
//! which has no structured stream-json and instead grows a single assistant
//! message line by line with no distinguished terminal record.

use super::{Command, ModelEvent, ModelEventKind, ModelEventType, ProviderAdapter};
use serde_json::Value;
use std::sync::Mutex;

#[derive(Default)]
pub struct CodexAdapter {
    accumulated: Mutex<String>,
}

impl ProviderAdapter for CodexAdapter {
    fn build_command(&self, prompt: &str, _schema: Option<&Value>) -> Command {
        Command {
            program: "codex".to_string(),
            args: vec![
                "--approval-mode".to_string(),
                "full-auto".to_string(),
                "-q".to_string(),
                prompt.to_string(),
            ],
            stdin: None,
        }
    }

    fn handle_output_line(&self, line: &str) -> Option<ModelEvent> {
        let mut acc = self.accumulated.lock().unwrap();
        acc.push_str(line);
        acc.push('\n');

        Some(ModelEvent {
            level: "debug".to_string(),
            model_event_kind: ModelEventKind::AssistantMessage,
            kind: ModelEventType::Message,
            message: Some(Value::String(line.to_string())),
            summary: None,
            result_message: None,
        })
    }

    fn is_terminal_stream(&self) -> bool {
        false
    }

    fn terminal_result_text(&self) -> Option<String> {
        None
    }
}

impl CodexAdapter {
    /// The full accumulated capture, used by the Runner's output-parsing
    /// contract when `is_terminal_stream()` is false.
    pub fn accumulated_text(&self) -> String {
        self.accumulated.lock().unwrap().trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_lines_in_order() {
        let adapter = CodexAdapter::default();
        adapter.handle_output_line("first");
        adapter.handle_output_line("second");
        assert_eq!(adapter.accumulated_text(), "first\nsecond");
    }
}
