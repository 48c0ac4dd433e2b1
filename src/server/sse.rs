// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! `GET /api/stream/progress`: a job's events as Server-Sent Events.
//!
//! Each bus event becomes one record (`id` = sequence number, `event` = kind,
//! `data` = payload JSON). A reconnecting browser sends `Last-Event-ID` and
//! resumes right after it. Dropping the connection drops the subscription.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::header::CACHE_CONTROL;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::{stream, StreamExt};
use serde::Deserialize;

use super::AppState;
use crate::bus::{ErrorPayload, EventBody, ProgressEvent, Subscription};
use crate::errors::{ApiError, ApiResult};
use crate::jobs::{Job, JobState};

const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Debug, Deserialize)]
pub struct ProgressQuery {
    #[serde(default)]
    pub job_id: Option<String>,
    /// First sequence number wanted
    #[serde(default)]
    pub from: Option<u64>,
}

/// Cursor for a connection: one past `Last-Event-ID` when the header is
/// present and numeric, else `from`, else 0.
pub(crate) fn resume_cursor(headers: &HeaderMap, from: Option<u64>) -> u64 {
    headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|id| id.saturating_add(1))
        .or(from)
        .unwrap_or(0)
}

/// Terminal event rebuilt from a finished job record, for when the bus
/// no longer holds the real one.
pub(crate) fn synthesized_terminal(job: &Job, seq: u64) -> Option<ProgressEvent> {
    let result = job.result.clone().unwrap_or_default();
    let body = match job.state {
        JobState::Succeeded => EventBody::done(result),
        JobState::Failed | JobState::Cancelled => {
            let field = |name: &str| result.get(name).and_then(|v| v.as_str()).map(str::to_string);
            let fallback = if job.state == JobState::Cancelled { "cancelled" } else { "internal" };
            let cause = field("cause").unwrap_or_else(|| fallback.to_string());
            EventBody::Error(ErrorPayload {
                message: field("error").unwrap_or_else(|| format!("Job {}", job.state)),
                cause,
            })
        }
        JobState::Queued | JobState::Running => return None,
    };
    Some(ProgressEvent {
        job_id: job.id.clone(),
        seq,
        body,
        at: job.updated_at,
    })
}

fn from_record(job: &Job, from: u64) -> Subscription {
    tracing::debug!(job_id = %job.id, "History expired; sending terminal event from the job record");
    Box::pin(stream::iter(synthesized_terminal(job, from)))
}

fn to_sse(event: &ProgressEvent) -> Event {
    Event::default()
        .id(event.seq.to_string())
        .event(event.kind().as_str())
        .data(event.body.payload_json().to_string())
}

/// SSE handler.
pub async fn progress_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ProgressQuery>,
) -> ApiResult<Response> {
    let job_id = query
        .job_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::invalid_request("job_id is required", Some("job_id")))?;
    let job = state
        .queue
        .get(&job_id)?
        .ok_or_else(|| ApiError::not_found(&format!("Job {}", job_id)))?;
    let from = resume_cursor(&headers, query.from);

    let bus = state.queue.bus();
    let expired = || job.is_terminal() && !bus.is_retained(&job_id);
    let events: Subscription = if expired() {
        from_record(&job, from)
    } else {
        let subscription = bus.subscribe(&job_id, from)?;
        // Pruned between the check and the subscribe; nothing would ever arrive.
        if expired() {
            drop(subscription);
            from_record(&job, from)
        } else {
            subscription
        }
    };
    tracing::debug!(job_id = %job_id, from, "Progress stream opened");

    let records = events.map(|event| Ok::<Event, Infallible>(to_sse(&event)));
    let sse = Sse::new(records).keep_alive(KeepAlive::new().interval(state.keep_alive));

    Ok((
        [(CACHE_CONTROL, "no-cache"), (axum::http::HeaderName::from_static("x-accel-buffering"), "no")],
        sse,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn test_last_event_id_wins_over_from() {
        let mut headers = HeaderMap::new();
        assert_eq!(resume_cursor(&headers, None), 0);
        assert_eq!(resume_cursor(&headers, Some(4)), 4);

        headers.insert(LAST_EVENT_ID, HeaderValue::from_static("7"));
        assert_eq!(resume_cursor(&headers, Some(2)), 8);

        headers.insert(LAST_EVENT_ID, HeaderValue::from_static("garbage"));
        assert_eq!(resume_cursor(&headers, Some(2)), 2);
    }

    #[test]
    fn test_synthesized_terminal_events() {
        let mut job = Job::new(crate::jobs::JobRequest::Pull {
            model: "llama3".into(),
        });
        assert!(synthesized_terminal(&job, 0).is_none());

        job.state = JobState::Failed;
        job.result = Some(json!({"error": "disk full", "cause": "upstream"}));
        let event = synthesized_terminal(&job, 5).unwrap();
        assert_eq!(event.seq, 5);
        assert_eq!(
            event.body,
            EventBody::Error(ErrorPayload {
                message: "disk full".into(),
                cause: "upstream".into()
            })
        );

        job.state = JobState::Succeeded;
        job.result = Some(json!({"status": "success"}));
        let event = synthesized_terminal(&job, 0).unwrap();
        assert_eq!(event.body, EventBody::done(json!({"status": "success"})));
    }
}
