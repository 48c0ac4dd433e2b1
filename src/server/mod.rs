// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! API server
//!
//! Job submission, polling and cancellation, plus the SSE progress stream.
//!
//! # Endpoints
//!
//! - `POST /api/jobs` - Submit a job (`202 {"job_id"}`)
//! - `GET /api/jobs` - Active and recent jobs
//! - `GET /api/jobs/:id` - One job record (polling fallback)
//! - `POST /api/jobs/:id/cancel` - Request cooperative cancellation
//! - `DELETE /api/jobs/finished` - Clear finished jobs
//! - `GET /api/stream/progress?job_id=...` - Server-Sent Events
//! - `GET /health` - Liveness and model server reachability
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pullbus::bus::MemoryBus;
//! use pullbus::jobs::{JobQueue, MemoryJobStore, QueueSettings};
//! use pullbus::server::Server;
//! use pullbus::upstream::{HttpSettings, OllamaClient, DEFAULT_OLLAMA_URL};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let queue = JobQueue::new(
//!     Arc::new(MemoryJobStore::new()),
//!     Arc::new(MemoryBus::new()),
//!     QueueSettings::default(),
//! );
//! let ollama = OllamaClient::new(DEFAULT_OLLAMA_URL, HttpSettings::default().build_client()?);
//! Server::new(8790, queue, ollama).start().await?;
//! # Ok(())
//! # }
//! ```

mod sse;

pub use sse::ProgressQuery;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Serialize;
use tower_http::timeout::TimeoutLayer;

use crate::errors::{ApiError, ApiResult};
use crate::jobs::{Job, JobQueue, JobRequest, JobState};
use crate::upstream::OllamaClient;

/// Default port.
pub const DEFAULT_PORT: u16 = 8790;

/// Default SSE keep-alive interval.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Default timeout for non-streaming requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// Maximum request body size (64KB); job requests are small
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Server state shared across handlers.
pub struct AppState {
    pub queue: JobQueue,
    /// Model server, for the health probe
    pub ollama: OllamaClient,
    pub keep_alive: Duration,
}

/// API server configuration.
pub struct Server {
    port: u16,
    /// Address to bind to (defaults to 127.0.0.1 for security).
    bind_address: String,
    keep_alive: Duration,
    request_timeout: Duration,
    queue: JobQueue,
    ollama: OllamaClient,
}

impl Server {
    /// Create a new server on `port`, bound to 127.0.0.1.
    pub fn new(port: u16, queue: JobQueue, ollama: OllamaClient) -> Self {
        Self {
            port,
            bind_address: "127.0.0.1".to_string(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            queue,
            ollama,
        }
    }

    /// Set the bind address.
    /// Use "0.0.0.0" to allow network access, "127.0.0.1" (default) for localhost only.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Build the router with all routes.
    pub fn build_router(&self) -> Router {
        let state = Arc::new(AppState {
            queue: self.queue.clone(),
            ollama: self.ollama.clone(),
            keep_alive: self.keep_alive,
        });

        // Streams stay open for as long as the job runs; only plain
        // request/response routes get the timeout.
        let api = Router::new()
            .route("/health", get(health_handler))
            .route("/api/jobs", post(submit_handler).get(list_handler))
            .route("/api/jobs/finished", delete(clear_finished_handler))
            .route("/api/jobs/:id", get(get_job_handler))
            .route("/api/jobs/:id/cancel", post(cancel_handler))
            .layer(TimeoutLayer::new(self.request_timeout));
        let streams = Router::new().route("/api/stream/progress", get(sse::progress_handler));

        api.merge(streams)
            .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
            .with_state(state)
    }

    /// Start the server; returns after a shutdown signal once in-flight
    /// requests have drained.
    pub async fn start(&self) -> Result<()> {
        let router = self.build_router();
        let addr = format!("{}:{}", self.bind_address, self.port);

        tracing::info!("Starting server on {}", addr);

        if self.bind_address == "0.0.0.0" {
            tracing::warn!(
                "Server is binding to 0.0.0.0 which exposes the job API to the network. \
                Use 127.0.0.1 (default) for local-only access."
            );
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. Another pullbus server may be running; \
                    stop it or pick a different port with: pullbus serve --port <PORT>",
                    self.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Serialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Serialize)]
struct JobsResponse {
    jobs: Vec<Job>,
}

#[derive(Serialize)]
struct ClearedResponse {
    cleared: usize,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    ollama_status: &'static str,
    queued: usize,
    running: usize,
}

// =============================================================================
// Handlers
// =============================================================================

async fn submit_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<JobRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = body.map_err(|e| ApiError::invalid_request(e.body_text(), None))?;
    let job = state.queue.submit(request)?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id: job.id })).into_response())
}

async fn list_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<JobsResponse>> {
    Ok(Json(JobsResponse {
        jobs: state.queue.list()?,
    }))
}

async fn get_job_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    state
        .queue
        .get(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(&format!("Job {}", id)))
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.queue.cancel(&id)?))
}

async fn clear_finished_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<ClearedResponse>> {
    Ok(Json(ClearedResponse {
        cleared: state.queue.clear_finished()?,
    }))
}

/// Health check handler.
///
/// Reports `degraded` when the model server does not answer.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let reachable = tokio::time::timeout(Duration::from_secs(2), state.ollama.is_reachable())
        .await
        .unwrap_or(false);
    let ollama_status = if reachable { "ok" } else { "unavailable" };

    let (queued, running) = match state.queue.list() {
        Ok(jobs) => (
            jobs.iter().filter(|j| j.state == JobState::Queued).count(),
            jobs.iter().filter(|j| j.state == JobState::Running).count(),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not read the job store");
            (0, 0)
        }
    };

    Json(HealthResponse {
        status: if reachable { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        ollama_status,
        queued,
        running,
    })
}

/// Graceful shutdown signal handler.
///
/// Waits for SIGINT/SIGTERM (Ctrl+C elsewhere).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "Failed to install signal handlers; falling back to Ctrl+C");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
    }
}
