//! Server-Sent Events stream of one task's event log.
//!
//! The stream replays stored events after the requested sequence number, then
//! polls for new ones. It closes with an `end` event once the task's terminal
//! event has been delivered.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde::Serialize;
use tracing::{debug, warn};

use patchloop::core::types::TaskState;

use crate::routes::{AfterQuery, ApiError, blocking};
use crate::state::AppState;

#[derive(Serialize)]
struct EndPayload {
    state: TaskState,
}

/// GET /api/tasks/{id}/stream?after=N
///
/// A `Last-Event-ID` header takes precedence over `after`, so reconnecting
/// clients continue where they left off.
pub async fn stream_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AfterQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let after = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(query.after);

    let task_id = id.clone();
    blocking(&state, move |s| s.get_task(&task_id)).await?;
    debug!(task_id = %id, after, "event stream opened");

    let poll = state.stream_poll;
    let stream = async_stream::stream! {
        let mut last_seq = after;
        let mut idle_terminal_polls = 0u32;
        loop {
            let task_id = id.clone();
            let events = match blocking(&state, move |s| s.events(&task_id, last_seq)).await {
                Ok(events) => events,
                Err(err) => {
                    warn!(task_id = %id, error = ?err, "event stream read failed");
                    break;
                }
            };

            let mut terminal = None;
            for event in events {
                last_seq = event.seq;
                if event.phase.is_terminal() {
                    terminal = Some(event.phase);
                }
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        yield Ok(Event::default()
                            .event("task_event")
                            .id(event.seq.to_string())
                            .data(json));
                    }
                    Err(err) => warn!(error = %err, "serialize task event"),
                }
                if terminal.is_some() {
                    break;
                }
            }

            if terminal.is_none() {
                // The terminal event may be behind `after`; stop once the task
                // is terminal and two polls in a row found nothing new.
                let task_id = id.clone();
                match blocking(&state, move |s| s.get_task(&task_id)).await {
                    Ok(task) if task.state.is_terminal() => {
                        idle_terminal_polls += 1;
                        if idle_terminal_polls > 1 {
                            terminal = Some(task.state);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(task_id = %id, error = ?err, "event stream read failed");
                        break;
                    }
                }
            }

            if let Some(final_state) = terminal {
                if let Ok(json) = serde_json::to_string(&EndPayload { state: final_state }) {
                    yield Ok(Event::default().event("end").data(json));
                }
                break;
            }
            tokio::time::sleep(poll).await;
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}
