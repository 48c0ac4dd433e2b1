// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Forced eviction of loaded models.

use std::time::Instant;

use serde_json::{json, Value};

use super::WorkerEnv;
use crate::errors::JobError;
use crate::jobs::JobContext;
use crate::upstream::RunningModel;

fn still_loaded<'a>(running: &[RunningModel], targets: &'a [String]) -> Vec<&'a str> {
    targets
        .iter()
        .filter(|t| running.iter().any(|m| m.matches(t)))
        .map(String::as_str)
        .collect()
}

pub(crate) async fn run(ctx: &JobContext, env: &WorkerEnv, model: Option<&str>) -> Result<Value, JobError> {
    let ollama = &env.ollama;
    let started = Instant::now();

    let targets: Vec<String> = match model {
        Some(model) => vec![model.to_string()],
        None => {
            let running = env.retry.run("list running models", ctx.cancel_token(), || ollama.ps()).await?;
            running.iter().map(|m| m.id().to_string()).collect()
        }
    };
    if targets.is_empty() {
        ctx.status("No models are loaded");
        return Ok(json!({ "ejected": [], "elapsed_ms": 0 }));
    }

    for target in &targets {
        ctx.checkpoint()?;
        ctx.status(format!("Unloading {}", target));
        if let Err(e) = ollama.unload(target).await {
            // The poll below is the source of truth; a refused unload may
            // still leave the model on its way out.
            ctx.warn(format!("Unload request for {} failed: {}", target, e));
        }
    }

    let deadline = started + env.eject_max_duration;
    loop {
        ctx.checkpoint()?;
        let running = env.retry.run("list running models", ctx.cancel_token(), || ollama.ps()).await?;
        let remaining = still_loaded(&running, &targets);
        if remaining.is_empty() {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            tracing::info!(job_id = %ctx.job_id(), ejected = ?targets, elapsed_ms, "Models ejected");
            return Ok(json!({ "ejected": targets, "elapsed_ms": elapsed_ms }));
        }

        if Instant::now() + env.eject_poll_interval > deadline {
            return Err(JobError::Timeout(format!(
                "{} still loaded after {}s",
                remaining.join(", "),
                env.eject_max_duration.as_secs_f32()
            )));
        }
        tracing::debug!(job_id = %ctx.job_id(), remaining = ?remaining, "Waiting for models to unload");
        ctx.or_cancel(tokio::time::sleep(env.eject_poll_interval)).await?;
    }
}
