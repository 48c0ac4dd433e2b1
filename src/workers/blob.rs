// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Blob upload followed by model creation.
//!
//! The model server answers a successful upload with a 2xx that sometimes
//! names where the blob landed and sometimes does not. "The bytes arrived"
//! and "we know where they are" are separate facts, so the flow is an
//! explicit state machine:
//!
//! ```text
//! Uploading ─┬─> UploadFailed                                    (fatal)
//!            ├─> UploadedPathKnown ───┬─> ModelCreated
//!            │                        └─> ModelCreationFailed     (fatal)
//!            └─> UploadedPathUnknown ─┬─> ExistenceConfirmed ─┬─> ModelCreated
//!                                     │                       └─> ModelCreationFailed
//!                                     └─> ExistenceUnconfirmed ──> ModelCreationSkipped
//! ```
//!
//! Every transition is recorded in [`BlobWorkflow::trail`].

use std::path::{Path, PathBuf};

use serde::Serialize;

use super::WorkerEnv;
use crate::errors::JobError;
use crate::jobs::{JobContext, ProgressThrottle};
use crate::upstream::BlobUpload;

/// Where the workflow is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobState {
    Uploading,
    UploadFailed,
    UploadedPathKnown,
    UploadedPathUnknown,
    ExistenceConfirmed,
    ExistenceUnconfirmed,
    ModelCreated,
    ModelCreationSkipped,
    ModelCreationFailed,
}

impl BlobState {
    pub fn can_transition_to(&self, next: BlobState) -> bool {
        use BlobState::*;
        matches!(
            (self, next),
            (Uploading, UploadFailed | UploadedPathKnown | UploadedPathUnknown)
                | (UploadedPathKnown, ModelCreated | ModelCreationFailed)
                | (UploadedPathUnknown, ExistenceConfirmed | ExistenceUnconfirmed)
                | (ExistenceConfirmed, ModelCreated | ModelCreationFailed)
                | (ExistenceUnconfirmed, ModelCreationSkipped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BlobState::UploadFailed
                | BlobState::ModelCreated
                | BlobState::ModelCreationSkipped
                | BlobState::ModelCreationFailed
        )
    }
}

/// What we know about the blob's presence on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobStatus {
    Unconfirmed,
    ConfirmedPresent,
    ConfirmedAbsent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobUploadAttempt {
    /// `sha256:<hex>`
    pub digest: String,
    pub status: BlobStatus,
    /// Paths to try for model creation, best first
    pub candidate_paths: Vec<String>,
}

/// One upload-then-create run and the states it went through.
#[derive(Debug, Clone, Serialize)]
pub struct BlobWorkflow {
    attempt: BlobUploadAttempt,
    state: BlobState,
    trail: Vec<BlobState>,
    /// Candidate that model creation succeeded with
    created_from: Option<String>,
}

impl BlobWorkflow {
    pub fn new(digest: impl Into<String>) -> Self {
        Self {
            attempt: BlobUploadAttempt {
                digest: digest.into(),
                status: BlobStatus::Unconfirmed,
                candidate_paths: Vec::new(),
            },
            state: BlobState::Uploading,
            trail: vec![BlobState::Uploading],
            created_from: None,
        }
    }

    pub fn state(&self) -> BlobState {
        self.state
    }

    pub fn trail(&self) -> &[BlobState] {
        &self.trail
    }

    pub fn attempt(&self) -> &BlobUploadAttempt {
        &self.attempt
    }

    pub fn created_from(&self) -> Option<&str> {
        self.created_from.as_deref()
    }

    /// Move to `next`, refusing transitions the diagram does not allow.
    pub fn advance(&mut self, next: BlobState) -> Result<(), JobError> {
        if !self.state.can_transition_to(next) {
            return Err(JobError::Internal(format!(
                "Invalid blob workflow transition {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        self.trail.push(next);
        Ok(())
    }

    /// Hex part of the digest.
    fn digest_hex(&self) -> &str {
        self.attempt
            .digest
            .strip_prefix("sha256:")
            .unwrap_or(&self.attempt.digest)
    }

    /// Candidates for an upload whose reply named no path: secondary hints,
    /// then the file name, then the server's digest naming.
    fn infer_candidates(&mut self, upload: &BlobUpload, filename: &str, blobs_dir: Option<&Path>) {
        let by_digest = match blobs_dir {
            Some(dir) => blob_file_path(dir, self.digest_hex())
                .to_string_lossy()
                .into_owned(),
            None => format!("sha256-{}", self.digest_hex()),
        };

        let mut candidates: Vec<String> = upload.secondary_paths.clone();
        for fallback in [filename.to_string(), by_digest] {
            if !candidates.contains(&fallback) {
                candidates.push(fallback);
            }
        }
        self.attempt.candidate_paths = candidates;
    }
}

/// Upload `file_path` as a blob and create `model_name` from it.
///
/// Fails the job on an upload error or when every creation attempt fails.
/// An upload that succeeds without saying where the blob went is resolved by
/// probing; an unconfirmed blob skips creation with a warning.
pub async fn upload_and_create(
    ctx: &JobContext,
    env: &WorkerEnv,
    workflow: &mut BlobWorkflow,
    file_path: &Path,
    filename: &str,
    model_name: &str,
) -> Result<(), JobError> {
    let digest = workflow.attempt.digest.clone();
    ctx.checkpoint()?;
    ctx.status(format!("Uploading {} to the model server", filename));

    let publisher = ctx.publisher();
    let mut throttle = ProgressThrottle::new(None);
    let upload = env
        .ollama
        .upload_blob(&digest, file_path, move |sent, total| {
            if throttle.should_emit(sent) || sent == total {
                publisher.progress("uploading", sent, Some(total));
            }
        })
        .await;

    let upload = match upload {
        Ok(upload) => upload,
        Err(e) => {
            workflow.advance(BlobState::UploadFailed)?;
            tracing::error!(job_id = %ctx.job_id(), digest = %digest, error = %e, "Blob upload failed");
            return Err(e);
        }
    };

    let from = match upload.path.clone() {
        Some(path) => {
            workflow.advance(BlobState::UploadedPathKnown)?;
            workflow.attempt.status = BlobStatus::ConfirmedPresent;
            workflow.attempt.candidate_paths = vec![path.clone()];
            vec![path]
        }
        None => {
            workflow.advance(BlobState::UploadedPathUnknown)?;
            let ambiguous = JobError::AmbiguousUpstreamResponse(format!(
                "Upload of {} returned HTTP {} without a blob path",
                digest, upload.status
            ));
            tracing::warn!(job_id = %ctx.job_id(), digest = %digest, "{}", ambiguous);

            ctx.checkpoint()?;
            let ollama = &env.ollama;
            let probe = env
                .retry
                .run("probe blob", ctx.cancel_token(), || ollama.blob_exists(&digest))
                .await;

            match probe {
                Ok(true) => {
                    workflow.advance(BlobState::ExistenceConfirmed)?;
                    workflow.attempt.status = BlobStatus::ConfirmedPresent;
                    workflow.infer_candidates(&upload, filename, env.blobs_dir.as_deref());
                    ctx.warn(format!("{}; blob is present, inferring its path", ambiguous));
                    workflow.attempt.candidate_paths.clone()
                }
                Ok(false) | Err(_) => {
                    if let Err(JobError::Cancelled) = probe {
                        return Err(JobError::Cancelled);
                    }
                    workflow.attempt.status = match probe {
                        Ok(false) => BlobStatus::ConfirmedAbsent,
                        _ => BlobStatus::Unconfirmed,
                    };
                    workflow.advance(BlobState::ExistenceUnconfirmed)?;
                    ctx.warn(format!(
                        "{}; could not confirm the blob, skipping model creation for {}",
                        ambiguous, model_name
                    ));
                    workflow.advance(BlobState::ModelCreationSkipped)?;
                    return Ok(());
                }
            }
        }
    };

    let mut last_error = None;
    for candidate in &from {
        ctx.checkpoint()?;
        ctx.status(format!("Creating model {}", model_name));
        let publisher = ctx.publisher();
        let created = env
            .ollama
            .create_model(model_name, candidate, filename, &digest, |status| {
                publisher.message(status.to_string());
            })
            .await;
        match created {
            Ok(()) => {
                workflow.advance(BlobState::ModelCreated)?;
                workflow.created_from = Some(candidate.clone());
                tracing::info!(job_id = %ctx.job_id(), model = model_name, from = %candidate, "Model created");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(job_id = %ctx.job_id(), from = %candidate, error = %e, "Model creation attempt failed");
                last_error = Some(e);
            }
        }
    }

    workflow.advance(BlobState::ModelCreationFailed)?;
    Err(last_error.unwrap_or_else(|| JobError::Internal("No blob path to create the model from".into())))
}

/// Local path of a blob under the server's blob directory (`sha256-<hex>`).
pub fn blob_file_path(blobs_dir: &Path, digest_hex: &str) -> PathBuf {
    blobs_dir.join(format!("sha256-{}", digest_hex))
}
