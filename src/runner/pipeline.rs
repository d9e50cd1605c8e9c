//! Mode selection and the lean/full phase pipelines, including the
//! idempotency short-circuit and the provider subprocess contract.
//!
//! Subprocess lifecycle is grounded on `session::claude::ClaudeCodeRunner`'s
//! pid-tracking/kill-on-timeout shape and `session::codex::CodexRunner`'s
//! `Command::spawn()` + `BufReader::lines()` capture loop.

use super::{idempotency, parse, prompts, Worker};
use crate::gateway::envelope::Envelope;
use crate::model::TaskRow;
use crate::provider::{Command, ProviderAdapter};
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Map, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

/// What a driven pipeline reports back to `/tasks/:id/complete`.
pub struct Outcome {
    pub succeeded: bool,
    pub blocked: bool,
    pub final_phase: String,
    pub output_json: Value,
    pub error_message: Option<String>,
}

impl Outcome {
    pub fn runtime_error(message: String) -> Self {
        Self {
            succeeded: false,
            blocked: false,
            final_phase: "runtime".to_string(),
            output_json: json!({}),
            error_message: Some(message),
        }
    }
}

/// Drives one attempt's pipeline end to end and returns its outcome.
/// Never returns `Err` for pipeline-declared failures (those are reported
/// as a non-`succeeded` `Outcome`); `Err` is reserved for conditions the
/// caller cannot recover a meaningful `Outcome` from (subprocess spawn
/// failure, parse failure, I/O errors talking to the Gateway).
pub async fn drive(worker: &Worker, task: &TaskRow, attempt_no: i64, attempt_id: i64) -> Result<Outcome> {
    let run_id = uuid::Uuid::new_v4().to_string();
    let run_dir = std::path::PathBuf::from("./runs").join(&run_id);
    tokio::fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating run directory {}", run_dir.display()))?;

    let mut sequence: u64 = 0;
    let mut phase_outputs = Map::new();

    let declared_mode = task.mode.as_str();
    let effective_mode = if declared_mode == "lean" || declared_mode == "full" {
        declared_mode.to_string()
    } else {
        let classifier_context = json!({ "task": task_summary(task) });
        let classifier_output = run_phase(
            worker,
            &run_id,
            &task.id,
            attempt_id,
            "mode_classifier",
            &classifier_context,
            None,
            &mut sequence,
        )
        .await?;
        let mode = classifier_output
            .get("mode")
            .and_then(|v| v.as_str())
            .unwrap_or("lean");
        let effective = if mode == "full" { "full" } else { "lean" };
        phase_outputs.insert("mode_classifier".to_string(), classifier_output);
        effective.to_string()
    };

    info!(task_id = %task.id, attempt_no, mode = %effective_mode, "pipeline mode selected");

    let mode_record = json!({ "configured": declared_mode, "effective": effective_mode });

    if effective_mode == "full" {
        run_full(worker, task, attempt_id, &run_dir, &run_id, &mut sequence, phase_outputs, mode_record).await
    } else {
        run_lean(worker, task, attempt_id, &run_id, &mut sequence, phase_outputs, mode_record).await
    }
}

fn task_summary(task: &TaskRow) -> Value {
    json!({
        "id": task.id,
        "type": task.r#type,
        "title": task.title,
        "prompt": task.prompt,
        "success_criteria": task.success_criteria,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_lean(
    worker: &Worker,
    task: &TaskRow,
    attempt_id: i64,
    run_id: &str,
    sequence: &mut u64,
    mut phase_outputs: Map<String, Value>,
    mode_record: Value,
) -> Result<Outcome> {
    let execute_context = json!({ "task": task_summary(task), "phase_outputs": phase_outputs });
    let execute_output = run_phase(
        worker, run_id, &task.id, attempt_id, "execute", &execute_context, None, sequence,
    )
    .await?;
    phase_outputs.insert("execute".to_string(), execute_output.clone());

    let verify_output = run_verify(worker, task, attempt_id, run_id, sequence, &phase_outputs, &execute_output).await?;
    phase_outputs.insert("verify".to_string(), verify_output.clone());

    let report_output = run_report(worker, task, attempt_id, run_id, sequence, &phase_outputs).await?;
    phase_outputs.insert("report".to_string(), report_output);

    finish(task, "report", mode_record, phase_outputs, &execute_output, &verify_output, run_id)
}

#[allow(clippy::too_many_arguments)]
async fn run_full(
    worker: &Worker,
    task: &TaskRow,
    attempt_id: i64,
    run_dir: &std::path::Path,
    run_id: &str,
    sequence: &mut u64,
    mut phase_outputs: Map<String, Value>,
    mode_record: Value,
) -> Result<Outcome> {
    let interpret_context = json!({ "task": task_summary(task) });
    let interpret_output = run_phase(
        worker, run_id, &task.id, attempt_id, "interpret", &interpret_context, None, sequence,
    )
    .await?;

    let route = interpret_output.get("route").and_then(|v| v.as_str()).unwrap_or("");
    let critical_blocker = interpret_output
        .get("critical_blocker")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if route == "blocked_for_clarification" && critical_blocker {
        let clarifications = interpret_output
            .get("clarifications_needed")
            .cloned()
            .unwrap_or_else(|| json!([]));
        phase_outputs.insert("interpret".to_string(), interpret_output);
        let output_json = json!({
            "mode": mode_record,
            "phase_outputs": phase_outputs,
            "report": { "clarifications_needed": clarifications },
        });
        return Ok(Outcome {
            succeeded: false,
            blocked: true,
            final_phase: "interpret".to_string(),
            output_json,
            error_message: Some("blocked_for_clarification".to_string()),
        });
    } else if route == "blocked_for_clarification" {
        warn!(task_id = %task.id, "interpret requested clarification without critical_blocker — continuing");
    }
    phase_outputs.insert("interpret".to_string(), interpret_output.clone());

    let plan_context = json!({ "task": task_summary(task), "phase_outputs": phase_outputs });
    let plan_output = run_phase(
        worker, run_id, &task.id, attempt_id, "plan", &plan_context, None, sequence,
    )
    .await?;

    let execute_schema = extract_execute_schema(&plan_output, run_dir).await?;
    phase_outputs.insert("plan".to_string(), plan_output);

    let policy_context = json!({ "task": task_summary(task), "phase_outputs": phase_outputs });
    let policy_output = run_phase(
        worker, run_id, &task.id, attempt_id, "policy", &policy_context, None, sequence,
    )
    .await?;

    let key_fields: Vec<String> = policy_output
        .pointer("/idempotency/key_fields")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let canonical = idempotency::canonical_string(
        &key_fields,
        &task.id,
        &task.r#type,
        &task.title,
        &task.prompt,
        interpret_output.get("objective").and_then(|v| v.as_str()),
    );
    let hash = idempotency::hash(&canonical);
    let state_key = idempotency::state_key(&hash);

    phase_outputs.insert("policy".to_string(), policy_output);

    if let Some(marker) = worker.client().get_state(&state_key).await? {
        info!(task_id = %task.id, %hash, "idempotency hit — short-circuiting");
        let output_json = json!({
            "mode": mode_record,
            "phase_outputs": phase_outputs,
            "dedupe": { "reused": true, "hash": hash, "marker": marker },
        });
        return Ok(Outcome {
            succeeded: true,
            blocked: false,
            final_phase: "policy".to_string(),
            output_json,
            error_message: None,
        });
    }

    let execute_context = json!({ "task": task_summary(task), "phase_outputs": phase_outputs });
    let execute_output = run_phase(
        worker,
        run_id,
        &task.id,
        attempt_id,
        "execute",
        &execute_context,
        execute_schema.as_ref(),
        sequence,
    )
    .await?;
    phase_outputs.insert("execute".to_string(), execute_output.clone());

    let verify_output = run_verify(worker, task, attempt_id, run_id, sequence, &phase_outputs, &execute_output).await?;
    phase_outputs.insert("verify".to_string(), verify_output.clone());

    let report_output = run_report(worker, task, attempt_id, run_id, sequence, &phase_outputs).await?;
    phase_outputs.insert("report".to_string(), report_output);

    let succeeded = verify_output.get("pass").and_then(|v| v.as_bool()).unwrap_or(false);
    if succeeded {
        worker
            .client()
            .set_state(&state_key, json!({ "completed_at": crate::model::now_rfc3339(), "hash": hash }))
            .await?;
    }

    let mut outcome = finish(task, "report", mode_record, phase_outputs, &execute_output, &verify_output, run_id)?;
    if let Value::Object(ref mut map) = outcome.output_json {
        map.insert("dedupe".to_string(), json!({ "reused": false, "hash": hash }));
    }
    Ok(outcome)
}

async fn extract_execute_schema(plan_output: &Value, run_dir: &std::path::Path) -> Result<Option<Value>> {
    let strict = plan_output
        .get("execute_output_strict")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let format_is_json = plan_output
        .get("execute_output_format")
        .and_then(|v| v.as_str())
        .map(|f| f == "json")
        .unwrap_or(false);
    let schema = plan_output.get("execute_output_schema").cloned();

    match (strict, format_is_json, schema) {
        (true, true, Some(schema)) if !schema.is_null() => {
            let path = run_dir.join("execute_schema.json");
            tokio::fs::write(&path, serde_json::to_vec_pretty(&schema)?)
                .await
                .with_context(|| format!("writing execute schema to {}", path.display()))?;
            Ok(Some(schema))
        }
        _ => Ok(None),
    }
}

async fn run_verify(
    worker: &Worker,
    task: &TaskRow,
    attempt_id: i64,
    run_id: &str,
    sequence: &mut u64,
    phase_outputs: &Map<String, Value>,
    execute_output: &Value,
) -> Result<Value> {
    let has_criteria = task
        .success_criteria
        .as_deref()
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false);

    if has_criteria {
        let context = json!({
            "task": task_summary(task),
            "phase_outputs": phase_outputs,
            "success_criteria": task.success_criteria,
        });
        run_phase(worker, run_id, &task.id, attempt_id, "verify", &context, None, sequence).await
    } else {
        let pass = execute_output.get("status").and_then(|v| v.as_str()) == Some("succeeded");
        Ok(json!({ "pass": pass, "synthesized": true }))
    }
}

async fn run_report(
    worker: &Worker,
    task: &TaskRow,
    attempt_id: i64,
    run_id: &str,
    sequence: &mut u64,
    phase_outputs: &Map<String, Value>,
) -> Result<Value> {
    let context = json!({ "task": task_summary(task), "phase_outputs": phase_outputs });
    run_phase(worker, run_id, &task.id, attempt_id, "report", &context, None, sequence).await
}

fn finish(
    task: &TaskRow,
    final_phase: &str,
    mode_record: Value,
    phase_outputs: Map<String, Value>,
    execute_output: &Value,
    verify_output: &Value,
    run_id: &str,
) -> Result<Outcome> {
    let succeeded = verify_output.get("pass").and_then(|v| v.as_bool()).unwrap_or(false);
    let error_message = if succeeded {
        None
    } else {
        execute_output
            .get("error")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| Some(format!("verification failed for task {}", task.id)))
    };
    let output_json = json!({
        "mode": mode_record,
        "phase_outputs": phase_outputs,
        "run_dir": format!("/runs/{run_id}"),
    });
    Ok(Outcome {
        succeeded,
        blocked: false,
        final_phase: final_phase.to_string(),
        output_json,
        error_message,
    })
}

/// Runs one provider-backed phase: builds the command from the adapter,
/// spawns it, streams its output as `event` envelopes, enforces the
/// per-phase timeout, and parses its terminal JSON output.
#[allow(clippy::too_many_arguments)]
async fn run_phase(
    worker: &Worker,
    run_id: &str,
    task_id: &str,
    attempt_id: i64,
    phase: &str,
    context: &Value,
    schema: Option<&Value>,
    sequence: &mut u64,
) -> Result<Value> {
    let base_prompt = prompts::load(phase).await;
    let prompt = format!(
        "{base_prompt}\n\n---\nContext:\n{}\n",
        serde_json::to_string_pretty(context).unwrap_or_default()
    );

    let adapter = worker.new_adapter()?;
    let command = adapter.build_command(&prompt, schema);

    emit_system(worker, run_id, task_id, attempt_id, phase, sequence, "state_change", json!({ "from": "pending", "to": "running" })).await;

    let result = spawn_and_capture(worker, run_id, task_id, attempt_id, phase, adapter.as_ref(), command, sequence).await;

    match result {
        Ok(captured) => {
            let parse_source = if adapter.is_terminal_stream() {
                adapter
                    .terminal_result_text()
                    .ok_or_else(|| anyhow!("phase {phase}: terminal-stream adapter produced no result"))?
            } else {
                captured
            };
            match parse::extract_phase_output(&parse_source) {
                Ok(output) => {
                    emit_system(worker, run_id, task_id, attempt_id, phase, sequence, "state_change", json!({ "from": "running", "to": "succeeded" })).await;
                    Ok(output)
                }
                Err(e) => {
                    emit_system(worker, run_id, task_id, attempt_id, phase, sequence, "state_change", json!({ "from": "running", "to": "failed" })).await;
                    Err(e).with_context(|| format!("parsing output for phase {phase}"))
                }
            }
        }
        Err(e) => {
            emit_system(worker, run_id, task_id, attempt_id, phase, sequence, "state_change", json!({ "from": "running", "to": "failed" })).await;
            Err(e)
        }
    }
}

fn bump(sequence: &mut u64) -> u64 {
    let s = *sequence;
    *sequence += 1;
    s
}

async fn emit(
    worker: &Worker,
    run_id: &str,
    task_id: &str,
    attempt_id: i64,
    phase: &str,
    sequence: &mut u64,
    kind: &str,
    producer: &str,
    payload: Value,
) {
    let envelope = Envelope::new(run_id, bump(sequence), kind, phase, producer, payload);
    let envelope_json = serde_json::to_value(&envelope).unwrap_or(Value::Null);
    if let Err(e) = worker
        .client()
        .append_envelope_event(task_id, worker.worker_id(), attempt_id, phase, envelope_json)
        .await
    {
        warn!(err = %e, task_id, phase, "failed to forward envelope to gateway");
    }
}

async fn emit_system(
    worker: &Worker,
    run_id: &str,
    task_id: &str,
    attempt_id: i64,
    phase: &str,
    sequence: &mut u64,
    kind: &str,
    payload: Value,
) {
    emit(worker, run_id, task_id, attempt_id, phase, sequence, kind, "system", payload).await;
}

/// Maps one normalized `ModelEvent` onto the wire envelope it should become.
/// Tool invocations become `action` envelopes with a fresh `action_id`;
/// the matching tool result is correlated FIFO against `pending_actions`
/// (the adapters we ship don't echo an id back, so order of arrival is the
/// only correlation signal available). Everything else is a plain `event`.
/// All of these carry `producer: "model"` — they originate in the
/// subprocess's own output stream, not the Runner itself.
#[allow(clippy::too_many_arguments)]
async fn emit_model_event(
    worker: &Worker,
    run_id: &str,
    task_id: &str,
    attempt_id: i64,
    phase: &str,
    sequence: &mut u64,
    pending_actions: &mut std::collections::VecDeque<(String, String)>,
    event: crate::provider::ModelEvent,
) {
    use crate::provider::{ModelEventKind, ModelEventType};

    // `kind` alone doesn't distinguish a tool invocation from its result —
    // both adapters tag either side `ModelEventType::ToolUse`. `model_event_kind`
    // is the field that actually separates the request from the result.
    match (event.kind, event.model_event_kind) {
        (ModelEventType::ToolUse, ModelEventKind::AssistantMessage) => {
            let action_id = uuid::Uuid::new_v4().to_string();
            let step_id = format!("step-{}", pending_actions.len() + 1);
            let tool = event
                .message
                .as_ref()
                .and_then(|m| m.get("name"))
                .and_then(|n| n.as_str())
                .unwrap_or("unknown")
                .to_string();
            let arguments = event
                .message
                .as_ref()
                .and_then(|m| m.get("input"))
                .cloned()
                .unwrap_or(json!({}));
            let idempotency_key = format!("{step_id}:{tool}:{action_id}");
            pending_actions.push_back((action_id.clone(), tool.clone()));
            let payload = json!({
                "action_id": action_id,
                "step_id": step_id,
                "tool": tool,
                "arguments": arguments,
                "idempotency_key": idempotency_key,
            });
            emit(worker, run_id, task_id, attempt_id, phase, sequence, "action", "model", payload).await;
        }
        (_, ModelEventKind::AssistantToolResult) => {
            let Some((action_id, _tool)) = pending_actions.pop_front() else {
                let payload = serde_json::to_value(&event).unwrap_or(Value::Null);
                emit(worker, run_id, task_id, attempt_id, phase, sequence, "event", "model", payload).await;
                return;
            };
            let ok = event.level != "error";
            let payload = json!({ "action_id": action_id, "ok": ok, "result": event.message });
            emit(worker, run_id, task_id, attempt_id, phase, sequence, "tool_result", "model", payload).await;
        }
        _ => {
            let payload = serde_json::to_value(&event).unwrap_or(Value::Null);
            emit(worker, run_id, task_id, attempt_id, phase, sequence, "event", "model", payload).await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn spawn_and_capture(
    worker: &Worker,
    run_id: &str,
    task_id: &str,
    attempt_id: i64,
    phase: &str,
    adapter: &dyn ProviderAdapter,
    command: Command,
    sequence: &mut u64,
) -> Result<String> {
    let mut child = tokio::process::Command::new(&command.program)
        .args(&command.args)
        .stdin(if command.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning provider for phase {phase}"))?;

    if let Some(input) = &command.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .context("writing provider stdin")?;
        }
    }

    let stdout = child.stdout.take().expect("stdout is piped");
    let stderr = child.stderr.take().expect("stderr is piped");
    let mut lines = BufReader::new(stdout).lines();
    let mut captured = String::new();
    let stream_job_logs = std::env::var_os("TASKLOOM_STREAM_JOB_LOGS").is_some();
    let mut pending_actions: std::collections::VecDeque<(String, String)> = std::collections::VecDeque::new();

    // Drained on its own task so a chatty provider can't fill the stderr
    // pipe buffer and deadlock the stdout read loop above.
    let phase_owned = phase.to_string();
    let stderr_drain = tokio::spawn(async move {
        let mut stderr_lines = BufReader::new(stderr).lines();
        loop {
            match stderr_lines.next_line().await {
                Ok(Some(line)) => {
                    if stream_job_logs {
                        eprintln!("[{phase_owned}:stderr] {line}");
                    } else {
                        tracing::debug!(phase = %phase_owned, "{line}");
                    }
                }
                _ => return,
            }
        }
    });

    let read_loop = async {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    captured.push_str(&line);
                    captured.push('\n');
                    if stream_job_logs {
                        eprintln!("[{phase}] {line}");
                    }
                    if let Some(event) = adapter.handle_output_line(&line) {
                        emit_model_event(
                            worker,
                            run_id,
                            task_id,
                            attempt_id,
                            phase,
                            sequence,
                            &mut pending_actions,
                            event,
                        )
                        .await;
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => return Err::<(), anyhow::Error>(e.into()),
            }
        }
    };

    match tokio::time::timeout(worker.phase_timeout(), read_loop).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            stderr_drain.abort();
            return Err(e).with_context(|| format!("reading provider output for phase {phase}"));
        }
        Err(_elapsed) => {
            terminate(&mut child).await;
            stderr_drain.abort();
            anyhow::bail!("phase {phase} timed out after {:?}", worker.phase_timeout());
        }
    }

    let status = child.wait().await.context("waiting for provider process")?;
    stderr_drain.abort();
    if !status.success() && captured.trim().is_empty() {
        anyhow::bail!("provider exited with {status} and produced no output for phase {phase}");
    }

    Ok(captured)
}

/// SIGTERM, then a hard kill two seconds later if the child is still alive.
/// Non-Unix targets go straight to the hard kill (`Child::start_kill`).
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    tokio::select! {
        _ = child.wait() => {}
        _ = tokio::time::sleep(Duration::from_secs(2)) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}
