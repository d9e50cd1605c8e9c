//! Loads phase base prompts from the external prompts directory as plain
//! text, verbatim. Prompt content itself is not this engine's concern — a
//! missing file falls back to a minimal built-in instruction so a checkout
//! without `./prompts` still runs end to end.

use std::path::PathBuf;

fn prompts_dir() -> PathBuf {
    PathBuf::from("./prompts")
}

pub async fn load(phase: &str) -> String {
    let path = prompts_dir().join(format!("{phase}.md"));
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(_) => default_for(phase).to_string(),
    }
}

fn default_for(phase: &str) -> &'static str {
    match phase {
        "mode_classifier" => {
            r#"Classify whether this task needs the full multi-phase pipeline or the lean one. Respond with a JSON object: {"mode": "lean" | "full"}."#
        }
        "interpret" => {
            r#"Interpret the task request. Respond with a JSON object describing "route", "critical_blocker", "objective", and, when blocked, "clarifications_needed"."#
        }
        "plan" => {
            r#"Produce an ordered list of bounded steps as a JSON object under "steps", with optional "execute_output_strict", "execute_output_format", and "execute_output_schema" fields."#
        }
        "policy" => {
            r#"Produce an idempotency descriptor as JSON: {"idempotency": {"key_fields": [...]}}."#
        }
        "execute" => {
            r#"Execute the task. Respond with a JSON object: {"status": "succeeded" | "failed", "summary": "..."}."#
        }
        "verify" => {
            r#"Verify the execution result against the success criteria. Respond with a JSON object: {"pass": true | false}."#
        }
        "report" => {
            r#"Summarize the outcome for the end user. Respond with a JSON object: {"message_markdown": "..."}."#
        }
        _ => r#"Respond with a JSON object describing the outcome of this phase."#,
    }
}
