// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types.
//!
//! - [`JobError`]: everything a job can fail with. The runner turns it into a
//!   terminal state and a final `error` event; it never escapes a worker.
//! - [`BusError`] / [`StoreError`]: failures of the progress bus and job store.
//! - [`ApiError`]: what the HTTP API returns. Carries a reference code so a
//!   log line can be matched to a client report.

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;

use crate::jobs::JobState;

// =============================================================================
// JOB ERRORS
// =============================================================================

/// Which phase of an HTTP exchange failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportPhase {
    /// Establishing the connection or sending the request
    Connect,
    /// Reading the response body mid-transfer
    Read,
}

impl fmt::Display for TransportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportPhase::Connect => f.write_str("connect"),
            TransportPhase::Read => f.write_str("read"),
        }
    }
}

/// Error taxonomy for job execution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// Rejected at submission; never enters the queue.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Transport error during {phase}: {message}")]
    Transport {
        phase: TransportPhase,
        message: String,
    },

    /// Error status or `error` line from upstream. The message is upstream's own.
    #[error("{message}")]
    Upstream { status: Option<u16>, message: String },

    /// A 2xx response that does not carry what the contract promises.
    #[error("Ambiguous upstream response: {0}")]
    AmbiguousUpstreamResponse(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Taxonomy name carried in the `cause` field of `error` events.
    pub fn cause(&self) -> &'static str {
        match self {
            JobError::InvalidParameters(_) => "invalid_parameters",
            JobError::Transport { .. } => "transport",
            JobError::Upstream { .. } | JobError::AmbiguousUpstreamResponse(_) => "upstream",
            JobError::Timeout(_) => "timeout",
            JobError::Cancelled => "cancelled",
            JobError::Io(_) | JobError::Internal(_) => "internal",
        }
    }

    /// Only connect-phase transport failures are worth retrying, and only for
    /// idempotent requests (the caller decides that part).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Transport {
                phase: TransportPhase::Connect,
                ..
            }
        )
    }

    /// Terminal state a job ends in when it fails with this error.
    pub fn terminal_state(&self) -> JobState {
        match self {
            JobError::Cancelled => JobState::Cancelled,
            _ => JobState::Failed,
        }
    }

    /// Classify a `reqwest` error. `phase` is where the caller was; a
    /// connection failure is always reported as connect-phase.
    pub fn transport(phase: TransportPhase, err: &reqwest::Error) -> Self {
        let phase = if err.is_connect() {
            TransportPhase::Connect
        } else {
            phase
        };
        JobError::Transport {
            phase,
            message: err.to_string(),
        }
    }

    /// Build an `Upstream` error from a non-success status and its body.
    pub fn upstream_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    format!("HTTP {}", status.as_u16())
                } else {
                    format!("HTTP {}: {}", status.as_u16(), trimmed)
                }
            });
        JobError::Upstream {
            status: Some(status.as_u16()),
            message,
        }
    }
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        JobError::Io(err.to_string())
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        JobError::Internal(err.to_string())
    }
}

impl From<BusError> for JobError {
    fn from(err: BusError) -> Self {
        JobError::Internal(err.to_string())
    }
}

// =============================================================================
// BUS AND STORE ERRORS
// =============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    /// The job already published its terminal event.
    #[error("Progress stream for job {job_id} is closed")]
    Closed { job_id: String },

    #[error("Progress bus storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobState,
        to: JobState,
    },

    #[error("Job store storage error: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Storage(format!("{:#}", err))
    }
}

impl From<anyhow::Error> for BusError {
    fn from(err: anyhow::Error) -> Self {
        BusError::Storage(format!("{:#}", err))
    }
}

// =============================================================================
// HTTP API ERRORS
// =============================================================================

/// Generate a unique error reference code.
/// Format: ERR-YYYYMMDD-XXXXXX (e.g., ERR-20240115-A3F8K2)
pub fn generate_reference_code() -> String {
    let date = Utc::now().format("%Y%m%d");
    let mut rng = rand::thread_rng();
    let chars: Vec<char> = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().collect();
    let random: String = (0..6)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect();
    format!("ERR-{}-{}", date, random)
}

/// Error returned by the HTTP API.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum ApiError {
    /// Invalid request from client (400)
    InvalidRequest {
        message: String,
        reference: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },

    /// Resource not found (404)
    NotFound { message: String, reference: String },

    /// Request conflicts with the job's current state (409)
    Conflict { message: String, reference: String },

    /// Internal server error (500)
    InternalError { message: String, reference: String },
}

/// Error response body: `{"error": {...}, "status": 400}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: ApiError,
    pub status: u16,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::InvalidRequest { message, .. }
            | ApiError::NotFound { message, .. }
            | ApiError::Conflict { message, .. }
            | ApiError::InternalError { message, .. } => message,
        }
    }

    pub fn reference(&self) -> &str {
        match self {
            ApiError::InvalidRequest { reference, .. }
            | ApiError::NotFound { reference, .. }
            | ApiError::Conflict { reference, .. }
            | ApiError::InternalError { reference, .. } => reference,
        }
    }

    pub fn invalid_request(message: impl Into<String>, field: Option<&str>) -> Self {
        let reference = generate_reference_code();
        let message = message.into();
        tracing::warn!(reference = %reference, field = ?field, "Invalid request: {}", message);
        Self::InvalidRequest {
            message,
            reference,
            field: field.map(str::to_string),
        }
    }

    pub fn not_found(resource: &str) -> Self {
        let reference = generate_reference_code();
        tracing::debug!(reference = %reference, resource = %resource, "Not found");
        Self::NotFound {
            message: format!("{} not found", resource),
            reference,
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        let reference = generate_reference_code();
        let message = message.into();
        tracing::warn!(reference = %reference, "Conflict: {}", message);
        Self::Conflict { message, reference }
    }

    /// Log the internal details; the client only gets a reference code.
    pub fn internal_error(internal_error: &str) -> Self {
        let reference = generate_reference_code();
        tracing::error!(reference = %reference, internal_error = %internal_error, "Internal error");
        Self::InternalError {
            message: format!("An internal error occurred. Reference: {}", reference),
            reference,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.reference())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let response = ErrorResponse {
            status: status.as_u16(),
            error: self,
        };

        let body = serde_json::to_string(&response).unwrap_or_else(|_| {
            r#"{"error":{"error_type":"internal_error","message":"An unexpected error occurred","reference":"ERR-FALLBACK"},"status":500}"#.to_string()
        });

        (status, [("content-type", "application/json")], body).into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::InvalidParameters(message) => ApiError::invalid_request(message, None),
            other => ApiError::internal_error(&other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ApiError::not_found(&format!("Job {}", id)),
            StoreError::InvalidTransition { .. } => ApiError::conflict(err.to_string()),
            StoreError::Storage(details) => ApiError::internal_error(&details),
        }
    }
}

impl From<BusError> for ApiError {
    fn from(err: BusError) -> Self {
        ApiError::internal_error(&err.to_string())
    }
}

/// Result type for HTTP handlers.
pub type ApiResult<T> = Result<T, ApiError>;

// =============================================================================
// TESTS
// =============================================================================
