// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! "Is there a newer version?" probe built on the pull feed.
//!
//! The server has no dedicated endpoint, so the worker starts a pull and
//! stops it at the first line that decides the question. Dropping the reader
//! closes the connection, which ends the transfer upstream.
//!
//! The status vocabulary is not a stable contract. Phrases are matched
//! against the allow-lists below; anything unrecognised means "still in
//! progress" and the worker keeps reading.

use serde::Serialize;
use serde_json::{json, Value};

use super::pull::{ByteTracker, SUCCESS_STATUS};
use super::WorkerEnv;
use crate::errors::JobError;
use crate::jobs::JobContext;
use crate::upstream::PullLine;

/// Status phrases meaning the local copy is current.
pub const UP_TO_DATE_PHRASES: &[&str] = &["up to date", "up-to-date"];

/// Status phrases meaning layers are being fetched.
pub const DOWNLOADING_PHRASES: &[&str] = &["downloading"];

/// What one line says about the update question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateDecision {
    UpToDate,
    UpdateAvailable,
    /// Undecided; keep reading
    Pending,
}

/// Classify one pull line.
///
/// # Example
///
/// ```
/// use pullbus::upstream::PullLine;
/// use pullbus::workers::{classify_line, UpdateDecision};
///
/// let line = PullLine { status: "Already up to date".into(), ..Default::default() };
/// assert_eq!(classify_line(&line), UpdateDecision::UpToDate);
/// ```
pub fn classify_line(line: &PullLine) -> UpdateDecision {
    let status = line.status.to_lowercase();
    if UP_TO_DATE_PHRASES.iter().any(|p| status.contains(p)) {
        return UpdateDecision::UpToDate;
    }
    if DOWNLOADING_PHRASES.iter().any(|p| status.contains(p)) {
        return UpdateDecision::UpdateAvailable;
    }
    match (line.completed, line.total) {
        (Some(completed), Some(total)) if total > 0 && completed < total => {
            UpdateDecision::UpdateAvailable
        }
        _ => UpdateDecision::Pending,
    }
}

pub(crate) async fn run(ctx: &JobContext, env: &WorkerEnv, model: &str) -> Result<Value, JobError> {
    let ollama = &env.ollama;
    let mut lines = env
        .retry
        .run("open pull stream", ctx.cancel_token(), || ollama.pull(model))
        .await?;

    let mut bytes = ByteTracker::default();
    let mut decision = None;

    while let Some(line) = ctx.or_cancel(lines.next_line()).await? {
        ctx.checkpoint()?;
        let line = line?;
        if let Some(message) = line.error {
            return Err(JobError::Upstream {
                status: None,
                message,
            });
        }

        match classify_line(&line) {
            UpdateDecision::Pending if line.status == SUCCESS_STATUS => {
                decision = Some(UpdateDecision::UpToDate);
            }
            UpdateDecision::Pending => {
                bytes.observe(&line);
                ctx.progress("checking", bytes.completed, bytes.total);
                continue;
            }
            decided => {
                // Bytes carried by the deciding line were still received.
                if decided == UpdateDecision::UpdateAvailable {
                    bytes.observe(&line);
                }
                decision = Some(decided);
            }
        }
        break;
    }
    drop(lines);

    let (status, available) = match decision {
        Some(UpdateDecision::UpToDate) => ("up_to_date", Some(false)),
        Some(UpdateDecision::UpdateAvailable) => ("update_available", Some(true)),
        _ => ("unknown", None),
    };
    tracing::info!(job_id = %ctx.job_id(), model, status, "Update check finished");
    ctx.status(match status {
        "up_to_date" => format!("{} is up to date", model),
        "update_available" => format!("An update is available for {}", model),
        _ => format!("Could not tell whether {} has an update", model),
    });

    Ok(json!({
        "model": model,
        "status": status,
        "update_available": available,
        "bytes_transferred": bytes.max_completed,
    }))
}
