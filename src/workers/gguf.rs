// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! GGUF download from the model hub, then blob upload and model creation.
//!
//! Bytes go to `<dir>/<file>.part` first and are renamed into place once
//! the body is complete, so a finished file is never half-written. A partial
//! file left by an earlier failure is resumed with a `Range` request when the
//! hub supports it.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::blob::{self, BlobWorkflow};
use super::WorkerEnv;
use crate::errors::{JobError, TransportPhase};
use crate::jobs::{JobContext, ProgressThrottle};
use crate::upstream::HubDownload;

const HASH_BLOCK_BYTES: usize = 1024 * 1024;

/// Parameters of one GGUF job, borrowed from the request.
pub(crate) struct GgufJob<'a> {
    pub repo_id: &'a str,
    pub filename: &'a str,
    pub output_dir: Option<&'a str>,
    pub create_model: bool,
    pub model_name: Option<&'a str>,
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

/// Model name for a file when the job names none: the file stem.
fn default_model_name(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| filename.to_lowercase())
}

pub(crate) async fn run(ctx: &JobContext, env: &WorkerEnv, job: GgufJob<'_>) -> Result<Value, JobError> {
    let hub = &env.hub;
    ctx.status(format!("Looking up {} in {}", job.filename, job.repo_id));
    let files = env
        .retry
        .run("list hub files", ctx.cancel_token(), || hub.list_files(job.repo_id))
        .await?;
    let entry = files.into_iter().find(|f| f.path == job.filename).ok_or_else(|| JobError::Upstream {
        status: Some(404),
        message: format!("{} not found in {}", job.filename, job.repo_id),
    })?;

    let dir = job
        .output_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| env.download_dir.clone());
    fs::create_dir_all(&dir).await?;
    let final_path = dir.join(job.filename);

    let existing = fs::metadata(&final_path).await.ok().map(|m| m.len());
    let bytes = match (existing, entry.size) {
        (Some(len), Some(size)) if len == size => {
            ctx.status(format!("{} is already downloaded", job.filename));
            len
        }
        _ => download(ctx, env, &job, &final_path, entry.size).await?,
    };

    if !job.create_model {
        return Ok(json!({
            "repo_id": job.repo_id,
            "filename": job.filename,
            "path": final_path.to_string_lossy(),
            "bytes": bytes,
            "model_created": false,
        }));
    }

    let digest = hash_file(ctx, &final_path, bytes).await?;
    let model = job
        .model_name
        .map(str::to_string)
        .unwrap_or_else(|| default_model_name(job.filename));
    let mut workflow = BlobWorkflow::new(digest.clone());
    blob::upload_and_create(ctx, env, &mut workflow, &final_path, job.filename, &model).await?;

    Ok(json!({
        "repo_id": job.repo_id,
        "filename": job.filename,
        "path": final_path.to_string_lossy(),
        "bytes": bytes,
        "digest": digest,
        "model": model,
        "model_created": workflow.created_from().is_some(),
        "blob": workflow,
    }))
}

async fn download(
    ctx: &JobContext,
    env: &WorkerEnv,
    job: &GgufJob<'_>,
    final_path: &Path,
    expected: Option<u64>,
) -> Result<u64, JobError> {
    let partial = part_path(final_path);
    match fetch(ctx, env, job, &partial, expected).await {
        Ok(written) => {
            fs::rename(&partial, final_path).await?;
            tracing::info!(job_id = %ctx.job_id(), path = %final_path.display(), bytes = written, "Download complete");
            Ok(written)
        }
        Err(JobError::Cancelled) => {
            if let Err(e) = fs::remove_file(&partial).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %partial.display(), error = %e, "Failed to remove partial download");
                }
            }
            Err(JobError::Cancelled)
        }
        // Kept for the next attempt to resume.
        Err(e) => Err(e),
    }
}

async fn fetch(
    ctx: &JobContext,
    env: &WorkerEnv,
    job: &GgufJob<'_>,
    partial: &Path,
    expected: Option<u64>,
) -> Result<u64, JobError> {
    let mut resume_from = fs::metadata(partial).await.map(|m| m.len()).unwrap_or(0);
    if let Some(size) = expected.filter(|size| resume_from >= *size) {
        if resume_from == size {
            tracing::info!(job_id = %ctx.job_id(), bytes = size, "Partial download already complete");
            ctx.progress("downloading", size, Some(size));
            return Ok(size);
        }
        tracing::warn!(
            job_id = %ctx.job_id(),
            partial = resume_from,
            size,
            "Partial download is larger than the file; restarting"
        );
        resume_from = 0;
    }

    let hub = &env.hub;
    let opening = env.retry.run("open hub download", ctx.cancel_token(), || {
        hub.open_download(job.repo_id, job.filename, resume_from)
    });
    let mut body = ctx.or_cancel(opening).await??;
    if resume_from > 0 {
        if body.is_resumed() {
            tracing::info!(job_id = %ctx.job_id(), offset = resume_from, "Resuming partial download");
        } else {
            tracing::info!(job_id = %ctx.job_id(), "Hub ignored the range request; restarting download");
        }
    }

    let total = body.total.or(expected);
    let written = write_body(ctx, partial, &mut body, total).await?;
    match total {
        Some(total) if written != total => Err(JobError::Transport {
            phase: TransportPhase::Read,
            message: format!("Download ended at {} of {} bytes", written, total),
        }),
        _ => Ok(written),
    }
}

async fn write_body(
    ctx: &JobContext,
    partial: &Path,
    body: &mut HubDownload,
    total: Option<u64>,
) -> Result<u64, JobError> {
    let mut file = if body.is_resumed() {
        OpenOptions::new().append(true).open(partial).await?
    } else {
        fs::File::create(partial).await?
    };

    let mut written = body.offset;
    let mut throttle = ProgressThrottle::new(total);
    if throttle.should_emit(written) {
        ctx.progress("downloading", written, total);
    }

    while let Some(chunk) = ctx.or_cancel(body.chunk()).await?? {
        ctx.checkpoint()?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        if throttle.should_emit(written) {
            ctx.progress("downloading", written, total);
        }
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

/// `sha256:<hex>` of the file, publishing `hashing` progress.
async fn hash_file(ctx: &JobContext, path: &Path, size: u64) -> Result<String, JobError> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BLOCK_BYTES];
    let mut done = 0u64;
    let mut throttle = ProgressThrottle::new(Some(size));

    loop {
        ctx.checkpoint()?;
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        done += n as u64;
        if throttle.should_emit(done) {
            ctx.progress("hashing", done, Some(size));
        }
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}
