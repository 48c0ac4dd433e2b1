// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Progress bus: per-job, ordered, replayable event streams.
//!
//! Workers publish [`EventBody`] values; the bus stamps each with the job's
//! next sequence number and fans it out to every subscriber. A subscriber
//! names the first sequence number it wants and gets retained history from
//! there, then live events, with no gap and no duplicate. The stream ends
//! after the job's terminal (`done` or `error`) event.
//!
//! # Implementations
//!
//! - [`MemoryBus`]: in-process, `tokio::sync::broadcast` fan-out.
//! - [`FileBus`]: JSON-lines logs in a directory, shared between processes.

mod file;
mod memory;

pub use file::FileBus;
pub use memory::{MemoryBus, DEFAULT_CHANNEL_CAPACITY};

use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{BusError, JobError};
use crate::jobs::JobState;

/// Default time a terminal job's events stay retained.
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(60);

/// Event kind; also the SSE `event:` name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Status,
    Progress,
    Error,
    Done,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Status => "status",
            EventKind::Progress => "progress",
            EventKind::Error => "error",
            EventKind::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<JobState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Byte-level progress. An unknown total is absent, never zero.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressPayload {
    pub phase: String,
    pub bytes_completed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_total: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub message: String,
    pub cause: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DonePayload {
    pub result: Value,
}

/// What a publisher hands to the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventBody {
    Status(StatusPayload),
    Progress(ProgressPayload),
    Error(ErrorPayload),
    Done(DonePayload),
}

impl EventBody {
    pub fn state(state: JobState) -> Self {
        EventBody::Status(StatusPayload {
            state: Some(state),
            ..Default::default()
        })
    }

    pub fn message(message: impl Into<String>) -> Self {
        EventBody::Status(StatusPayload {
            message: Some(message.into()),
            ..Default::default()
        })
    }

    pub fn warning(warning: impl Into<String>) -> Self {
        EventBody::Status(StatusPayload {
            warning: Some(warning.into()),
            ..Default::default()
        })
    }

    pub fn progress(phase: impl Into<String>, bytes_completed: u64, bytes_total: Option<u64>) -> Self {
        EventBody::Progress(ProgressPayload {
            phase: phase.into(),
            bytes_completed,
            bytes_total: bytes_total.filter(|total| *total > 0),
        })
    }

    pub fn done(result: Value) -> Self {
        EventBody::Done(DonePayload { result })
    }

    pub fn error(err: &JobError) -> Self {
        EventBody::Error(ErrorPayload {
            message: err.to_string(),
            cause: err.cause().to_string(),
        })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::Status(_) => EventKind::Status,
            EventBody::Progress(_) => EventKind::Progress,
            EventBody::Error(_) => EventKind::Error,
            EventBody::Done(_) => EventKind::Done,
        }
    }

    /// `done` and `error` end a job's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventBody::Error(_) | EventBody::Done(_))
    }

    /// The payload alone, as sent in the SSE `data:` field.
    pub fn payload_json(&self) -> Value {
        let payload = match self {
            EventBody::Status(p) => serde_json::to_value(p),
            EventBody::Progress(p) => serde_json::to_value(p),
            EventBody::Error(p) => serde_json::to_value(p),
            EventBody::Done(p) => serde_json::to_value(p),
        };
        payload.unwrap_or(Value::Null)
    }
}

/// One sequenced event in a job's stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub job_id: String,
    /// Starts at 0, strictly increasing, gapless per job
    pub seq: u64,
    #[serde(flatten)]
    pub body: EventBody,
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.body.is_terminal()
    }
}

/// Live event stream for one job. Ends after the terminal event.
///
/// Dropping the stream releases the subscription.
pub type Subscription = Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>;

/// Publish/subscribe distribution of job progress.
pub trait ProgressBus: Send + Sync {
    /// Append an event to the job's stream and fan it out.
    ///
    /// Fails with [`BusError::Closed`] once the job published `done` or `error`.
    fn publish(&self, job_id: &str, body: EventBody) -> Result<ProgressEvent, BusError>;

    /// Retained events with `seq >= from_seq`, in order.
    fn history(&self, job_id: &str, from_seq: u64) -> Result<Vec<ProgressEvent>, BusError>;

    /// Replay from `from_seq`, then follow live events.
    fn subscribe(&self, job_id: &str, from_seq: u64) -> Result<Subscription, BusError>;

    /// Whether the bus holds any events for the job.
    fn is_retained(&self, job_id: &str) -> bool;

    /// Drop history of jobs whose grace window elapsed. Returns how many.
    fn prune(&self) -> usize;
}
