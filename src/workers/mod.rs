// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job workers, one per job kind.
//!
//! A worker turns an upstream feed into progress events and returns the
//! job's result. It never publishes the terminal event itself; the queue's
//! runner does that from the returned `Result`.

pub mod blob;
mod eject;
mod gguf;
mod pull;
mod update_check;

pub use blob::{BlobState, BlobStatus, BlobUploadAttempt, BlobWorkflow};
pub use update_check::{classify_line, UpdateDecision, DOWNLOADING_PHRASES, UP_TO_DATE_PHRASES};

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use crate::errors::JobError;
use crate::jobs::{JobContext, JobRequest};
use crate::upstream::{HubClient, OllamaClient, RetryPolicy};

/// Default interval between `ps` polls while forcing an eject.
pub const DEFAULT_EJECT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default bound on how long an eject waits for the model to go away.
pub const DEFAULT_EJECT_MAX_DURATION: Duration = Duration::from_secs(30);

/// Upstream clients and tunables shared by every worker.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub ollama: OllamaClient,
    pub hub: HubClient,
    pub retry: RetryPolicy,
    pub eject_poll_interval: Duration,
    pub eject_max_duration: Duration,
    /// Where GGUF downloads land when the job names no directory
    pub download_dir: PathBuf,
    /// The model server's blob directory, when known
    pub blobs_dir: Option<PathBuf>,
}

impl WorkerEnv {
    pub fn new(ollama: OllamaClient, hub: HubClient) -> Self {
        Self {
            ollama,
            hub,
            retry: RetryPolicy::default(),
            eject_poll_interval: DEFAULT_EJECT_POLL_INTERVAL,
            eject_max_duration: DEFAULT_EJECT_MAX_DURATION,
            download_dir: PathBuf::from("models"),
            blobs_dir: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_eject_bounds(mut self, poll_interval: Duration, max_duration: Duration) -> Self {
        self.eject_poll_interval = poll_interval;
        self.eject_max_duration = max_duration;
        self
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    pub fn with_blobs_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.blobs_dir = dir;
        self
    }
}

/// Run the worker for `request` to completion.
pub async fn run(ctx: &JobContext, env: &WorkerEnv, request: &JobRequest) -> Result<Value, JobError> {
    match request {
        JobRequest::Pull { model } => pull::run(ctx, env, model).await,
        JobRequest::UpdateCheck { model } => update_check::run(ctx, env, model).await,
        JobRequest::EjectForce { model } => eject::run(ctx, env, model.as_deref()).await,
        JobRequest::GgufDownload {
            repo_id,
            filename,
            output_dir,
            create_model,
            model_name,
        } => {
            let spec = gguf::GgufJob {
                repo_id,
                filename,
                output_dir: output_dir.as_deref(),
                create_model: *create_model,
                model_name: model_name.as_deref(),
            };
            gguf::run(ctx, env, spec).await
        }
    }
}
