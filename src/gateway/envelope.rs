//! The wire record streamed by `/tasks/run`. Required fields and
//! type-specific payload conventions per the streaming-envelope contract.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub run_id: String,
    pub sequence: u64,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub phase: String,
    pub producer: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(
        run_id: &str,
        sequence: u64,
        kind: &str,
        phase: &str,
        producer: &str,
        payload: Value,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            sequence,
            timestamp: crate::model::now_rfc3339(),
            kind: kind.to_string(),
            phase: phase.to_string(),
            producer: producer.to_string(),
            payload,
        }
    }

    pub fn intake(run_id: &str, task_id: &str) -> Self {
        Self::new(
            run_id,
            0,
            "event",
            "intake",
            "system",
            serde_json::json!({ "message": "task accepted", "task_id": task_id }),
        )
    }

    pub fn error(run_id: &str, sequence: u64, code: &str, message: &str) -> Self {
        Self::new(
            run_id,
            sequence,
            "error",
            "stream",
            "system",
            serde_json::json!({ "code": code, "message": message }),
        )
    }

    pub fn artifact(run_id: &str, sequence: u64, name: &str, content: Value) -> Self {
        Self::new(
            run_id,
            sequence,
            "artifact",
            "report",
            "system",
            serde_json::json!({ "name": name, "format": "json", "content": content }),
        )
    }

    /// Replays an upstream envelope (already-shaped by the worker) under a
    /// fresh locally-monotonic sequence, preserving the original sequence
    /// under `payload.source_sequence` for correlation.
    pub fn replay(mut upstream: Value, run_id: &str, sequence: u64) -> Self {
        let source_sequence = upstream.get("sequence").cloned();
        let kind = upstream
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("event")
            .to_string();
        let phase = upstream
            .get("phase")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let producer = upstream
            .get("producer")
            .and_then(|v| v.as_str())
            .unwrap_or("system")
            .to_string();
        let mut payload = upstream
            .get_mut("payload")
            .map(|p| p.take())
            .unwrap_or_else(|| serde_json::json!({}));
        if let (Some(src), Value::Object(map)) = (source_sequence, &mut payload) {
            map.insert("source_sequence".to_string(), src);
        }
        Self::new(run_id, sequence, &kind, &phase, &producer, payload)
    }

    /// Synthesizes an envelope from a raw stored event when its `data_json`
    /// did not already carry a full envelope.
    pub fn from_system_event(
        run_id: &str,
        sequence: u64,
        phase: &str,
        level: &str,
        message: &str,
        data: Option<Value>,
    ) -> Self {
        Self::new(
            run_id,
            sequence,
            "event",
            phase,
            "system",
            serde_json::json!({ "level": level, "message": message, "data": data }),
        )
    }

    pub fn to_line(&self) -> String {
        let mut s = serde_json::to_string(self).unwrap_or_default();
        s.push('\n');
        s
    }
}

/// Extracts the user-visible result from a terminal attempt's output, per
/// the fixed precedence order: report markdown, then execute summary, then
/// top-level output/error, then a full serialization fallback.
pub fn extract_user_output(output: &Value) -> Value {
    let report_md = output
        .pointer("/phase_outputs/report/message_markdown")
        .and_then(|v| v.as_str());
    if let Some(s) = report_md {
        return Value::String(s.to_string());
    }

    let execute_summary = output
        .pointer("/phase_outputs/execute/summary")
        .and_then(|v| v.as_str());
    if let Some(s) = execute_summary {
        return Value::String(s.to_string());
    }

    if let Some(s) = output.get("output").and_then(|v| v.as_str()) {
        return Value::String(s.to_string());
    }
    if let Some(s) = output.get("error").and_then(|v| v.as_str()) {
        return Value::String(s.to_string());
    }

    output.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_report_markdown() {
        let out = serde_json::json!({
            "phase_outputs": {
                "report": { "message_markdown": "done" },
                "execute": { "summary": "ran it" }
            }
        });
        assert_eq!(extract_user_output(&out), Value::String("done".into()));
    }

    #[test]
    fn falls_back_to_execute_summary() {
        let out = serde_json::json!({ "phase_outputs": { "execute": { "summary": "ran it" } } });
        assert_eq!(extract_user_output(&out), Value::String("ran it".into()));
    }

    #[test]
    fn falls_back_to_whole_object() {
        let out = serde_json::json!({ "foo": "bar" });
        assert_eq!(extract_user_output(&out), out);
    }
}
