//! Output-parsing contract: extract a single JSON object from a provider's
//! captured text, per the fenced-code/direct/unwrap extraction order.

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").unwrap());

const UNWRAP_KEYS: &[&str] = &["result", "output", "text", "message", "content"];

fn direct_extract(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let candidate = &text[start..=end];
    serde_json::from_str::<Value>(candidate)
        .ok()
        .filter(Value::is_object)
}

fn unwrap_and_retry(value: &Value) -> Option<Value> {
    let obj = value.as_object()?;
    for key in UNWRAP_KEYS {
        match obj.get(*key) {
            Some(Value::String(s)) => {
                if let Some(v) = direct_extract(s) {
                    return Some(v);
                }
            }
            Some(Value::Array(items)) => {
                let joined: String = items
                    .iter()
                    .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n");
                if let Some(v) = direct_extract(&joined) {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extracts a single JSON object from `captured`, per the fixed order:
/// fenced code block first, then direct `{...}` extraction, then falling
/// back to unwrapping a string/array-typed member under a conventional key.
pub fn extract_phase_output(captured: &str) -> Result<Value> {
    if let Some(caps) = FENCED_JSON.captures(captured) {
        if let Some(m) = caps.get(1) {
            if let Some(v) = direct_extract(m.as_str()) {
                return Ok(v);
            }
        }
    }

    if let Some(v) = direct_extract(captured) {
        return Ok(v);
    }

    if let Ok(whole) = serde_json::from_str::<Value>(captured.trim()) {
        if whole.is_object() {
            if let Some(v) = unwrap_and_retry(&whole) {
                return Ok(v);
            }
        }
    }

    Err(anyhow!("could not extract a JSON object from phase output"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json() {
        let text = "Here you go:\n```json\n{\"status\":\"succeeded\"}\n```\nthanks";
        let v = extract_phase_output(text).unwrap();
        assert_eq!(v["status"], "succeeded");
    }

    #[test]
    fn extracts_direct_braces_with_surrounding_prose() {
        let text = "preamble {\"status\":\"succeeded\",\"summary\":\"ok\"} trailing";
        let v = extract_phase_output(text).unwrap();
        assert_eq!(v["status"], "succeeded");
    }

    #[test]
    fn unwraps_result_string_member() {
        let text = r#"{"result": "{\"status\":\"succeeded\"}"}"#;
        let v = extract_phase_output(text).unwrap();
        assert_eq!(v["status"], "succeeded");
    }

    #[test]
    fn unwraps_content_array_of_text_blocks() {
        let text = r#"{"content": [{"text": "{\"status\":\"succeeded\"}"}]}"#;
        let v = extract_phase_output(text).unwrap();
        assert_eq!(v["status"], "succeeded");
    }

    #[test]
    fn fails_on_unparseable_output() {
        assert!(extract_phase_output("no json here at all").is_err());
    }

    #[test]
    fn extracts_fenced_json_with_nested_object() {
        let text = "```json\n{\"status\":\"succeeded\",\"evidence\":{\"files\":[\"a.txt\"]}}\n```";
        let v = extract_phase_output(text).unwrap();
        assert_eq!(v["status"], "succeeded");
        assert_eq!(v["evidence"]["files"][0], "a.txt");
    }
}
