// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Async client for an Ollama-compatible model server.
//!
//! Covers what jobs need: streamed pulls, blob upload and probe, model
//! creation, and the `generate`/`ps` pair used to force a model out of memory.
//!
//! # Example
//!
//! ```no_run
//! use pullbus::upstream::{HttpSettings, OllamaClient};
//!
//! # async fn demo() -> Result<(), pullbus::errors::JobError> {
//! let http = HttpSettings::default().build_client()?;
//! let client = OllamaClient::new("http://localhost:11434", http);
//!
//! let mut lines = client.pull("llama3.2:latest").await?;
//! while let Some(line) = lines.next_line().await {
//!     let line = line?;
//!     println!("{} {:?}/{:?}", line.status, line.completed, line.total);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::Path;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, LOCATION};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;

use super::{ensure_success, JsonLines};
use crate::errors::{JobError, TransportPhase};

/// Default model server endpoint.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Header some server builds use to report where a blob landed.
const OLLAMA_PATH_HEADER: &str = "x-ollama-path";

/// One line of a streamed pull.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PullLine {
    /// Status message ("pulling manifest", "downloading", "success", ...)
    #[serde(default)]
    pub status: String,
    /// Digest of the layer being downloaded (if applicable)
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub completed: Option<u64>,
    /// Set when the server gives up mid-stream
    #[serde(default)]
    pub error: Option<String>,
}

/// One line of a streamed model creation.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CreateLine {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A model currently loaded by the server (`GET /api/ps`).
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RunningModel {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: String,
}

impl RunningModel {
    /// Whether this entry is `target`. An untagged target matches `:latest`.
    pub fn matches(&self, target: &str) -> bool {
        let latest = if target.contains(':') {
            None
        } else {
            Some(format!("{}:latest", target))
        };
        [self.name.as_str(), self.model.as_str()]
            .iter()
            .any(|n| !n.is_empty() && (*n == target || Some(*n) == latest.as_deref()))
    }

    /// The identifier to address this model by.
    pub fn id(&self) -> &str {
        if self.model.is_empty() {
            &self.name
        } else {
            &self.model
        }
    }
}

#[derive(Debug, Deserialize)]
struct PsResponse {
    #[serde(default)]
    models: Vec<RunningModel>,
}

/// What a successful blob upload told us.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlobUpload {
    pub status: u16,
    /// The `path` field of the JSON body, when present and non-empty
    pub path: Option<String>,
    /// Other places the server hinted at, in priority order: `blob_path` in
    /// the body, then `Location` and `X-Ollama-Path` headers, then a bare-text
    /// body
    pub secondary_paths: Vec<String>,
}

impl BlobUpload {
    fn from_parts(status: u16, headers: &reqwest::header::HeaderMap, body: &str) -> Self {
        let mut upload = BlobUpload {
            status,
            ..Default::default()
        };
        let mut push = |candidate: Option<&str>| {
            if let Some(p) = candidate.map(str::trim).filter(|p| !p.is_empty()) {
                if !upload.secondary_paths.iter().any(|existing| existing == p) {
                    upload.secondary_paths.push(p.to_string());
                }
            }
        };

        let trimmed = body.trim();
        let parsed = serde_json::from_str::<Value>(trimmed).ok();
        let primary = parsed
            .as_ref()
            .and_then(|v| v.get("path"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        push(parsed.as_ref().and_then(|v| v.get("blob_path")).and_then(Value::as_str));
        push(headers.get(LOCATION).and_then(|v| v.to_str().ok()));
        push(headers.get(OLLAMA_PATH_HEADER).and_then(|v| v.to_str().ok()));
        // Bare text that is neither JSON nor an HTML page.
        if parsed.is_none() && !trimmed.starts_with('<') && !trimmed.starts_with('{') {
            push(Some(trimmed).filter(|t| !t.contains('\n') && t.len() <= 4096));
        }

        upload.path = primary;
        upload
    }
}

/// Client for the model server.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Check if the server answers `GET /api/tags`.
    pub async fn is_reachable(&self) -> bool {
        match self.client.get(self.url("/api/tags")).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Start a streamed pull. The transfer stops when the reader is dropped.
    pub async fn pull(&self, model: &str) -> Result<JsonLines<PullLine>, JobError> {
        let response = self
            .client
            .post(self.url("/api/pull"))
            .json(&json!({ "name": model, "model": model, "stream": true }))
            .send()
            .await
            .map_err(|e| JobError::transport(TransportPhase::Connect, &e))?;
        let response = ensure_success(response).await?;
        Ok(JsonLines::new(response))
    }

    /// `HEAD /api/blobs/<digest>`: true on 200, false on 404.
    pub async fn blob_exists(&self, digest: &str) -> Result<bool, JobError> {
        let response = self
            .client
            .head(self.url(&format!("/api/blobs/{}", digest)))
            .send()
            .await
            .map_err(|e| JobError::transport(TransportPhase::Connect, &e))?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(JobError::upstream_status(status, "")),
        }
    }

    /// Stream a local file to `POST /api/blobs/<digest>`.
    ///
    /// `on_progress(sent, total)` is called as the body is read. A 2xx reply
    /// is success whether or not it names a path; see [`BlobUpload`].
    pub async fn upload_blob<F>(
        &self,
        digest: &str,
        file_path: &Path,
        mut on_progress: F,
    ) -> Result<BlobUpload, JobError>
    where
        F: FnMut(u64, u64) + Send + Sync + 'static,
    {
        let file = tokio::fs::File::open(file_path).await?;
        let size = file.metadata().await?.len();

        let mut sent = 0u64;
        let body = ReaderStream::new(file).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sent += bytes.len() as u64;
                on_progress(sent, size);
            }
            chunk
        });

        let response = self
            .client
            .post(self.url(&format!("/api/blobs/{}", digest)))
            .header(CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| JobError::transport(TransportPhase::Connect, &e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let text = response
            .text()
            .await
            .map_err(|e| JobError::transport(TransportPhase::Read, &e))?;
        if !status.is_success() {
            return Err(JobError::upstream_status(status, &text));
        }
        Ok(BlobUpload::from_parts(status.as_u16(), &headers, &text))
    }

    /// Create `name` from a blob at `from`, registering `filename -> digest`.
    ///
    /// `on_status` receives each status line. An `error` line fails the call.
    pub async fn create_model<F>(
        &self,
        name: &str,
        from: &str,
        filename: &str,
        digest: &str,
        mut on_status: F,
    ) -> Result<(), JobError>
    where
        F: FnMut(&str),
    {
        let files: HashMap<&str, &str> = HashMap::from([(filename, digest)]);
        let response = self
            .client
            .post(self.url("/api/create"))
            .json(&json!({
                "model": name,
                "name": name,
                "modelfile": format!("FROM {}\n", from),
                "files": files,
                "stream": true,
            }))
            .send()
            .await
            .map_err(|e| JobError::transport(TransportPhase::Connect, &e))?;
        let mut lines = JsonLines::<CreateLine>::new(ensure_success(response).await?);

        while let Some(line) = lines.next_line().await {
            let line = line?;
            if let Some(message) = line.error {
                return Err(JobError::Upstream {
                    status: None,
                    message,
                });
            }
            if let Some(status) = line.status.as_deref() {
                on_status(status);
            }
        }
        Ok(())
    }

    /// Models currently loaded (`GET /api/ps`).
    pub async fn ps(&self) -> Result<Vec<RunningModel>, JobError> {
        let response = self
            .client
            .get(self.url("/api/ps"))
            .send()
            .await
            .map_err(|e| JobError::transport(TransportPhase::Connect, &e))?;
        let ps: PsResponse = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|e| JobError::transport(TransportPhase::Read, &e))?;
        Ok(ps.models)
    }

    /// Ask the server to unload `model` now (`keep_alive: 0`, empty prompt).
    pub async fn unload(&self, model: &str) -> Result<(), JobError> {
        let response = self
            .client
            .post(self.url("/api/generate"))
            .json(&json!({ "model": model, "prompt": "", "keep_alive": 0, "stream": false }))
            .send()
            .await
            .map_err(|e| JobError::transport(TransportPhase::Connect, &e))?;
        ensure_success(response).await?;
        Ok(())
    }
}
