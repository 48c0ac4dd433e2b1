// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Clients for the services jobs drive: the model server and the model hub.
//!
//! Both speak plain HTTP through one shared `reqwest::Client` configured with
//! a short connect timeout and a long read timeout. Streaming endpoints
//! answer with newline-delimited JSON, read through [`JsonLines`].

mod hub;
mod ollama;
mod retry;

pub use hub::{HubClient, HubDownload, HubFile, DEFAULT_HUB_API_URL, DEFAULT_HUB_URL};
pub use ollama::{
    BlobUpload, CreateLine, OllamaClient, PullLine, RunningModel, DEFAULT_OLLAMA_URL,
};
pub use retry::RetryPolicy;

use std::marker::PhantomData;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::errors::{JobError, TransportPhase};

/// Default connect timeout (seconds).
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default read timeout (seconds). Long: model transfers are big.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 3600;

/// Timeouts applied to every upstream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
        }
    }
}

impl HttpSettings {
    /// Build the shared HTTP client.
    pub fn build_client(&self) -> Result<reqwest::Client, JobError> {
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout)
            .user_agent(concat!("pullbus/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| JobError::Internal(format!("Failed to create HTTP client: {}", e)))
    }
}

/// Fail with [`JobError::Upstream`] unless the response is 2xx.
pub(crate) async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, JobError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(JobError::upstream_status(status, &body))
}

/// Newline-delimited JSON read incrementally from a streaming response.
///
/// Lines that fail to parse are skipped. A read failure mid-body is a
/// read-phase transport error. Dropping the reader drops the response, which
/// closes the connection.
pub struct JsonLines<T> {
    response: reqwest::Response,
    buf: Vec<u8>,
    done: bool,
    bytes_read: u64,
    _item: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> JsonLines<T> {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            buf: Vec::new(),
            done: false,
            bytes_read: 0,
            _item: PhantomData,
        }
    }

    /// Body bytes received so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Next parsed line, or `None` at end of body.
    pub async fn next_line(&mut self) -> Option<Result<T, JobError>> {
        loop {
            if let Some(line) = self.take_line() {
                match parse_line::<T>(&line) {
                    Some(item) => return Some(Ok(item)),
                    None => continue,
                }
            }
            if self.done {
                // Last line may lack a trailing newline.
                if self.buf.is_empty() {
                    return None;
                }
                let rest = std::mem::take(&mut self.buf);
                match parse_line::<T>(&rest) {
                    Some(item) => return Some(Ok(item)),
                    None => return None,
                }
            }
            match self.response.chunk().await {
                Ok(Some(chunk)) => {
                    self.bytes_read += chunk.len() as u64;
                    self.buf.extend_from_slice(&chunk);
                }
                Ok(None) => self.done = true,
                Err(e) => {
                    self.done = true;
                    self.buf.clear();
                    return Some(Err(JobError::transport(TransportPhase::Read, &e)));
                }
            }
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        Some(line)
    }
}

fn parse_line<T: DeserializeOwned>(line: &[u8]) -> Option<T> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_slice(trimmed) {
        Ok(item) => Some(item),
        Err(e) => {
            tracing::debug!(error = %e, line = %String::from_utf8_lossy(trimmed), "Skipping malformed stream line");
            None
        }
    }
}
