//! `POST /tasks/run` — create a task, then stream its event timeline as
//! newline-delimited JSON envelopes until it reaches a terminal status or a
//! wall-clock deadline elapses.
//!
//! Grounded on `rest/sse.rs`'s `stream::unfold`-over-async-state shape,
//! adapted from SSE/broadcast-subscribe framing to bare NDJSON lines built by
//! polling the Repository, per the durable-queue's polling contract.

use crate::gateway::envelope::{extract_user_output, Envelope};
use crate::model::NewTask;
use crate::GatewayState;
use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const RUN_DEADLINE: Duration = Duration::from_secs(30 * 60);

struct RunState {
    state: Arc<GatewayState>,
    task_id: String,
    run_id: String,
    sequence: u64,
    last_event_id: i64,
    pending: VecDeque<crate::model::EventRow>,
    deadline: Instant,
    done: bool,
}

pub async fn run_task(State(state): State<Arc<GatewayState>>, Json(input): Json<NewTask>) -> Response {
    let task = match state
        .repo
        .create_task(input, state.config.max_attempts as i64)
        .await
    {
        Ok(t) => t,
        Err(e) => return e.into_response(),
    };

    let run_id = Uuid::new_v4().to_string();
    let intake = Envelope::intake(&run_id, &task.id);

    let init = RunState {
        state,
        task_id: task.id.clone(),
        run_id,
        sequence: 1,
        last_event_id: 0,
        pending: VecDeque::new(),
        deadline: Instant::now() + RUN_DEADLINE,
        done: false,
    };

    let first_line = intake.to_line();
    let body_stream = stream::unfold((init, Some(first_line)), |(mut st, pending)| async move {
        if let Some(line) = pending {
            return Some((Ok::<_, std::io::Error>(line), (st, None)));
        }
        if st.done {
            return None;
        }
        next_chunk(&mut st).await.map(|line| (Ok(line), (st, None)))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(body_stream))
        .unwrap()
}

/// Produces the next NDJSON line: either one replayed/synthesized event, a
/// terminal artifact/error, or (after sleeping the poll interval) a retry.
///
/// Events fetched in one poll batch are queued in `st.pending` and drained
/// one per call — `last_event_id` only advances as each is actually
/// dispatched, so a batch larger than one is never silently dropped.
async fn next_chunk(st: &mut RunState) -> Option<String> {
    loop {
        if let Some(event) = st.pending.pop_front() {
            st.last_event_id = event.id;
            let upstream_envelope = event.data().and_then(|d| d.get("envelope").cloned());
            let env = match upstream_envelope {
                Some(upstream) => Envelope::replay(upstream, &st.run_id, st.sequence),
                None => Envelope::from_system_event(
                    &st.run_id,
                    st.sequence,
                    event.phase.as_deref().unwrap_or(""),
                    &event.level,
                    &event.message,
                    event.data(),
                ),
            };
            st.sequence += 1;
            return Some(env.to_line());
        }

        if Instant::now() >= st.deadline {
            st.done = true;
            let env = Envelope::error(&st.run_id, st.sequence, "RUN_WAIT_TIMEOUT", "run did not complete before deadline");
            st.sequence += 1;
            return Some(env.to_line());
        }

        let events = match st.state.repo.list_events_after(&st.task_id, st.last_event_id).await {
            Ok(events) => events,
            Err(_) => Vec::new(),
        };

        if !events.is_empty() {
            st.pending.extend(events);
            continue;
        }

        let task = match st.state.repo.get_task(&st.task_id).await {
            Ok(t) => t,
            Err(_) => {
                st.done = true;
                let env = Envelope::error(&st.run_id, st.sequence, "TASK_VANISHED", "task disappeared while streaming");
                st.sequence += 1;
                return Some(env.to_line());
            }
        };

        if task.status().is_terminal() {
            st.done = true;
            let attempts = st.state.repo.list_attempts(&st.task_id).await.unwrap_or_default();
            let output = attempts
                .last()
                .map(|a| a.output())
                .unwrap_or_else(|| serde_json::json!({}));
            let content = extract_user_output(&output);
            let env = Envelope::artifact(&st.run_id, st.sequence, "result", content);
            st.sequence += 1;
            return Some(env.to_line());
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
