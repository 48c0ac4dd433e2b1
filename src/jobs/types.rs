// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job model: kinds, lifecycle states, submission requests and job records.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::JobError;

/// Kind of background work a job performs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Pull a model through the model server.
    Pull,
    /// Download a GGUF file from the model hub and register it as a model.
    GgufDownload,
    /// Probe whether a newer version of a model exists.
    UpdateCheck,
    /// Force the model server to unload a model.
    EjectForce,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::Pull,
        JobKind::GgufDownload,
        JobKind::UpdateCheck,
        JobKind::EjectForce,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Pull => "pull",
            JobKind::GgufDownload => "gguf_download",
            JobKind::UpdateCheck => "update_check",
            JobKind::EjectForce => "eject_force",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a job.
///
/// `Queued -> Running -> {Succeeded | Failed | Cancelled}`. A queued job may
/// also go straight to `Cancelled` or `Failed`. Terminal states never change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    /// Returns true if the job has finished (success, failure or cancellation).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Returns true if a worker is executing the job.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Running)
    }

    /// Whether moving from `self` to `next` respects the lifecycle order.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Queued, JobState::Running)
            | (JobState::Queued, JobState::Cancelled)
            | (JobState::Queued, JobState::Failed) => true,
            (JobState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_create_model() -> bool {
    true
}

/// A job submission, tagged by `kind`.
///
/// # Example
///
/// ```
/// use pullbus::jobs::{JobKind, JobRequest};
///
/// let req: JobRequest = serde_json::from_str(r#"{"kind":"pull","model":"llama3"}"#).unwrap();
/// assert_eq!(req.kind(), JobKind::Pull);
/// assert!(req.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobRequest {
    Pull {
        model: String,
    },
    GgufDownload {
        repo_id: String,
        filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_dir: Option<String>,
        #[serde(default = "default_create_model")]
        create_model: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_name: Option<String>,
    },
    UpdateCheck {
        model: String,
    },
    EjectForce {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
}

impl JobRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Pull { .. } => JobKind::Pull,
            JobRequest::GgufDownload { .. } => JobKind::GgufDownload,
            JobRequest::UpdateCheck { .. } => JobKind::UpdateCheck,
            JobRequest::EjectForce { .. } => JobKind::EjectForce,
        }
    }

    /// Check kind-specific parameters before the job enters the queue.
    pub fn validate(&self) -> Result<(), JobError> {
        match self {
            JobRequest::Pull { model } | JobRequest::UpdateCheck { model } => {
                validate_model_name("model", model)
            }
            JobRequest::GgufDownload {
                repo_id,
                filename,
                model_name,
                ..
            } => {
                validate_repo_id(repo_id)?;
                validate_gguf_filename(filename)?;
                if let Some(name) = model_name {
                    validate_model_name("model_name", name)?;
                }
                Ok(())
            }
            JobRequest::EjectForce { model } => match model {
                Some(name) => validate_model_name("model", name),
                None => Ok(()),
            },
        }
    }
}

fn validate_model_name(field: &str, name: &str) -> Result<(), JobError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(JobError::InvalidParameters(format!("{} must not be empty", field)));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(JobError::InvalidParameters(format!(
            "{} must not contain whitespace: {:?}",
            field, name
        )));
    }
    Ok(())
}

fn validate_repo_id(repo_id: &str) -> Result<(), JobError> {
    let trimmed = repo_id.trim();
    if trimmed.is_empty() {
        return Err(JobError::InvalidParameters("repo_id must not be empty".to_string()));
    }
    let bad_segment = trimmed
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if bad_segment || trimmed.chars().any(char::is_whitespace) || trimmed.split('/').count() > 2 {
        return Err(JobError::InvalidParameters(format!(
            "repo_id must look like 'owner/name': {:?}",
            repo_id
        )));
    }
    Ok(())
}

/// A GGUF file name must be a plain file name (no directories) ending in `.gguf`.
fn validate_gguf_filename(filename: &str) -> Result<(), JobError> {
    if filename.trim().is_empty() {
        return Err(JobError::InvalidParameters("filename must not be empty".to_string()));
    }
    if filename.contains('/') || filename.contains('\\') || filename.starts_with('.') {
        return Err(JobError::InvalidParameters(format!(
            "filename must be a plain file name: {:?}",
            filename
        )));
    }
    let is_gguf = Path::new(filename)
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("gguf"))
        .unwrap_or(false);
    if !is_gguf {
        return Err(JobError::InvalidParameters(format!(
            "filename must end with .gguf: {:?}",
            filename
        )));
    }
    Ok(())
}

/// A tracked job record, as held by the job store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Opaque identifier (UUID v4, simple form)
    pub id: String,
    pub kind: JobKind,
    pub state: JobState,
    /// The submitted request
    pub params: JobRequest,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Kind-specific result on success, `{error, cause}` otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Recoverable warnings raised while running
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub cancel_requested: bool,
    /// Worker that claimed the job, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
}

impl Job {
    /// Create a queued job for a (validated) request.
    pub fn new(params: JobRequest) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            kind: params.kind(),
            state: JobState::Queued,
            params,
            created_at: now,
            updated_at: now,
            result: None,
            warnings: Vec::new(),
            cancel_requested: false,
            claimed_by: None,
        }
    }

    /// Update the state and timestamp.
    pub fn update_state(&mut self, state: JobState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
