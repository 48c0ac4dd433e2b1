// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client for a HuggingFace-compatible model hub.

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, RANGE};
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;

use super::ensure_success;
use crate::errors::{JobError, TransportPhase};

/// Default hub host for file downloads.
pub const DEFAULT_HUB_URL: &str = "https://huggingface.co";

/// Default hub API root.
pub const DEFAULT_HUB_API_URL: &str = "https://huggingface.co/api";

#[derive(Debug, Deserialize)]
struct TreeEntry {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    lfs: Option<LfsInfo>,
}

#[derive(Debug, Deserialize)]
struct LfsInfo {
    #[serde(default)]
    size: Option<u64>,
}

/// A file in a hub repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubFile {
    pub path: String,
    /// Size in bytes; the LFS size when the file is LFS-backed
    pub size: Option<u64>,
}

/// An open download from the hub.
pub struct HubDownload {
    response: reqwest::Response,
    /// Byte offset the body starts at (non-zero when the server honoured a range)
    pub offset: u64,
    /// Full file size, when the server said
    pub total: Option<u64>,
}

impl HubDownload {
    /// True when the body continues a partial file.
    pub fn is_resumed(&self) -> bool {
        self.offset > 0
    }

    /// Next body chunk, or `None` at the end.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, JobError> {
        self.response
            .chunk()
            .await
            .map_err(|e| JobError::transport(TransportPhase::Read, &e))
    }
}

/// Client for the model hub.
#[derive(Debug, Clone)]
pub struct HubClient {
    base_url: String,
    api_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HubClient {
    pub fn new(
        base_url: impl Into<String>,
        api_url: impl Into<String>,
        token: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
            client,
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    /// Files on the `main` branch of `repo_id`.
    pub async fn list_files(&self, repo_id: &str) -> Result<Vec<HubFile>, JobError> {
        let url = format!("{}/models/{}/tree/main", self.api_url, repo_id);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| JobError::transport(TransportPhase::Connect, &e))?;
        let entries: Vec<TreeEntry> = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|e| JobError::transport(TransportPhase::Read, &e))?;

        Ok(entries
            .into_iter()
            .filter(|entry| entry.kind == "file" && !entry.path.is_empty())
            .map(|entry| HubFile {
                size: entry.lfs.and_then(|lfs| lfs.size).or(entry.size),
                path: entry.path,
            })
            .collect())
    }

    async fn send_download(&self, url: &str, resume_from: u64) -> Result<reqwest::Response, JobError> {
        let mut request = self.authorized(self.client.get(url));
        if resume_from > 0 {
            request = request.header(RANGE, format!("bytes={}-", resume_from));
        }
        request
            .send()
            .await
            .map_err(|e| JobError::transport(TransportPhase::Connect, &e))
    }

    /// Open `GET /<repo>/resolve/main/<file>`, asking to resume at `resume_from`.
    ///
    /// The server may ignore the range and send the whole file; check
    /// [`HubDownload::offset`]. A range the server cannot satisfy (416) is
    /// dropped and the whole file requested instead.
    pub async fn open_download(
        &self,
        repo_id: &str,
        filename: &str,
        resume_from: u64,
    ) -> Result<HubDownload, JobError> {
        let url = format!("{}/{}/resolve/main/{}", self.base_url, repo_id, filename);
        let mut resume_from = resume_from;
        let mut response = self.send_download(&url, resume_from).await?;
        if resume_from > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            tracing::info!(url = %url, offset = resume_from, "Hub rejected the resume range; restarting from the beginning");
            resume_from = 0;
            response = self.send_download(&url, 0).await?;
        }
        let response = ensure_success(response).await?;

        let resumed = resume_from > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
        let offset = if resumed { resume_from } else { 0 };
        let length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .or_else(|| response.content_length());
        let total = length.map(|len| len + offset).filter(|total| *total > 0);

        Ok(HubDownload {
            response,
            offset,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::HttpSettings;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, token: Option<&str>) -> HubClient {
        HubClient::new(
            server.uri(),
            format!("{}/api", server.uri()),
            token.map(str::to_string),
            HttpSettings::default().build_client().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_list_files_prefers_lfs_size() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/models/owner/repo/tree/main"))
            .and(header("authorization", "Bearer hf_secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"type": "directory", "path": "docs"},
                {"type": "file", "path": "README.md", "size": 12},
                {"type": "file", "path": "m.Q4.gguf", "size": 135, "lfs": {"size": 4_000_000_000u64}}
            ])))
            .mount(&server)
            .await;

        let files = client(&server, Some("hf_secret")).list_files("owner/repo").await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].path, "m.Q4.gguf");
        assert_eq!(files[1].size, Some(4_000_000_000));
    }

    #[tokio::test]
    async fn test_download_resume_uses_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/owner/repo/resolve/main/m.gguf"))
            .and(header("range", "bytes=4-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"efgh".to_vec()))
            .mount(&server)
            .await;

        let mut dl = client(&server, None)
            .open_download("owner/repo", "m.gguf", 4)
            .await
            .unwrap();
        assert!(dl.is_resumed());
        assert_eq!(dl.total, Some(8));

        let mut body = Vec::new();
        while let Some(chunk) = dl.chunk().await.unwrap() {
            body.extend_from_slice(&chunk);
        }
        assert_eq!(body, b"efgh");
    }

    #[tokio::test]
    async fn test_download_without_range_support_restarts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/owner/repo/resolve/main/m.gguf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abcdefgh".to_vec()))
            .mount(&server)
            .await;

        let dl = client(&server, None)
            .open_download("owner/repo", "m.gguf", 4)
            .await
            .unwrap();
        assert!(!dl.is_resumed());
        assert_eq!(dl.offset, 0);
        assert_eq!(dl.total, Some(8));
    }

    #[tokio::test]
    async fn test_unsatisfiable_range_restarts_from_zero() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/owner/repo/resolve/main/m.gguf"))
            .and(header("range", "bytes=8-"))
            .respond_with(ResponseTemplate::new(416))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/owner/repo/resolve/main/m.gguf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abcdefgh".to_vec()))
            .mount(&server)
            .await;

        let dl = client(&server, None)
            .open_download("owner/repo", "m.gguf", 8)
            .await
            .unwrap();
        assert!(!dl.is_resumed());
        assert_eq!(dl.total, Some(8));
    }

    #[tokio::test]
    async fn test_missing_file_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Entry not found"))
            .mount(&server)
            .await;

        let err = client(&server, None)
            .open_download("owner/repo", "nope.gguf", 0)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, JobError::Upstream { status: Some(404), .. }));
    }
}
