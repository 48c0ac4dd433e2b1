// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Model pull: relay the server's streamed pull feed as progress events.

use serde_json::{json, Value};

use super::WorkerEnv;
use crate::errors::JobError;
use crate::jobs::JobContext;
use crate::upstream::PullLine;

/// Status line that ends a pull.
pub(crate) const SUCCESS_STATUS: &str = "success";

/// Running `(completed, total)` pair across pull lines.
///
/// Lines about the manifest or verification carry no byte counts; the last
/// known values are carried over so every progress event has a usable pair.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ByteTracker {
    pub completed: u64,
    pub total: Option<u64>,
    /// Largest completed count any line reported
    pub max_completed: u64,
}

impl ByteTracker {
    pub fn observe(&mut self, line: &PullLine) {
        if let Some(total) = line.total.filter(|t| *t > 0) {
            if self.total != Some(total) {
                // New layer.
                self.completed = 0;
            }
            self.total = Some(total);
        }
        if let Some(completed) = line.completed {
            self.completed = completed;
            self.max_completed = self.max_completed.max(completed);
        }
    }

    pub fn finish(&mut self) {
        if let Some(total) = self.total {
            self.completed = self.completed.max(total);
        }
    }
}

pub(crate) async fn run(ctx: &JobContext, env: &WorkerEnv, model: &str) -> Result<Value, JobError> {
    tracing::info!(job_id = %ctx.job_id(), model, "Pulling model");
    let ollama = &env.ollama;
    let mut lines = env
        .retry
        .run("open pull stream", ctx.cancel_token(), || ollama.pull(model))
        .await?;

    let mut bytes = ByteTracker::default();
    let mut last_status = String::new();

    while let Some(line) = ctx.or_cancel(lines.next_line()).await? {
        ctx.checkpoint()?;
        let line = line?;
        if let Some(message) = line.error {
            return Err(JobError::Upstream {
                status: None,
                message,
            });
        }

        bytes.observe(&line);
        let finished = line.status == SUCCESS_STATUS;
        if finished {
            bytes.finish();
        }
        if !line.status.is_empty() {
            last_status = line.status;
        }
        let phase = if last_status.is_empty() { "pulling" } else { last_status.as_str() };
        ctx.progress(phase, bytes.completed, bytes.total);

        if finished {
            break;
        }
    }

    tracing::info!(job_id = %ctx.job_id(), model, status = %last_status, "Pull finished");
    Ok(json!({
        "model": model,
        "status": if last_status.is_empty() { SUCCESS_STATUS } else { last_status.as_str() },
        "bytes_completed": bytes.completed,
        "bytes_total": bytes.total,
    }))
}
