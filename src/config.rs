// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration: `~/.pullbus/config.json`, then environment overrides.
//!
//! Every field has a default, so an empty or missing file is a valid config.
//! CLI flags are applied last by the binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::bus::{FileBus, MemoryBus, ProgressBus, DEFAULT_CHANNEL_CAPACITY};
use crate::jobs::{ConcurrencyLimits, FileJobStore, JobStore, MemoryJobStore, QueueSettings};
use crate::server::DEFAULT_PORT;
use crate::upstream::{
    HttpSettings, HubClient, OllamaClient, RetryPolicy, DEFAULT_CONNECT_TIMEOUT_SECS,
    DEFAULT_HUB_API_URL, DEFAULT_HUB_URL, DEFAULT_OLLAMA_URL, DEFAULT_READ_TIMEOUT_SECS,
};
use crate::workers::WorkerEnv;

const CONFIG_DIR_NAME: &str = ".pullbus";
const CONFIG_FILE_NAME: &str = "config.json";

// ============================================================================
// Storage backend
// ============================================================================

/// Where jobs and progress events live.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local; the server must run its own workers
    #[default]
    Memory,
    /// Shared through the data directory, so `serve --no-workers` and
    /// `worker` can run as separate processes
    File,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            other => Err(format!("unknown storage backend '{}' (expected memory or file)", other)),
        }
    }
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    #[serde(default = "default_hub_url")]
    pub hub_url: String,
    #[serde(default = "default_hub_api_url")]
    pub hub_api_url: String,
    /// Bearer token for gated hub repositories
    #[serde(default)]
    pub hf_token: Option<String>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub limits: ConcurrencyLimits,
    /// Seconds a finished job's events stay replayable
    #[serde(default = "default_grace_window_secs")]
    pub grace_window_secs: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_eject_poll_interval_ms")]
    pub eject_poll_interval_ms: u64,
    #[serde(default = "default_eject_max_duration_secs")]
    pub eject_max_duration_secs: u64,
    #[serde(default = "default_dispatcher_tick_ms")]
    pub dispatcher_tick_ms: u64,
    /// Seconds running jobs get to wind down on shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default)]
    pub storage: StorageBackend,
    /// Defaults to `~/.pullbus/data`
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Where `gguf_download` writes when the job names no `output_dir`
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// The model server's blob directory, when it shares our filesystem
    #[serde(default)]
    pub blobs_dir: Option<PathBuf>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_ollama_url() -> String {
    DEFAULT_OLLAMA_URL.to_string()
}

fn default_hub_url() -> String {
    DEFAULT_HUB_URL.to_string()
}

fn default_hub_api_url() -> String {
    DEFAULT_HUB_API_URL.to_string()
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_read_timeout_secs() -> u64 {
    DEFAULT_READ_TIMEOUT_SECS
}

fn default_grace_window_secs() -> u64 {
    60
}

fn default_keep_alive_secs() -> u64 {
    15
}

fn default_eject_poll_interval_ms() -> u64 {
    1000
}

fn default_eject_max_duration_secs() -> u64 {
    30
}

fn default_dispatcher_tick_ms() -> u64 {
    500
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            ollama_url: default_ollama_url(),
            hub_url: default_hub_url(),
            hub_api_url: default_hub_api_url(),
            hf_token: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            retry: RetryPolicy::default(),
            limits: ConcurrencyLimits::default(),
            grace_window_secs: default_grace_window_secs(),
            keep_alive_secs: default_keep_alive_secs(),
            eject_poll_interval_ms: default_eject_poll_interval_ms(),
            eject_max_duration_secs: default_eject_max_duration_secs(),
            dispatcher_tick_ms: default_dispatcher_tick_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            storage: StorageBackend::default(),
            data_dir: None,
            download_dir: default_download_dir(),
            blobs_dir: None,
            log_level: default_log_level(),
        }
    }
}

/// `~/.pullbus`
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Show only the first `visible_prefix` characters of a secret.
pub fn mask_sensitive(input: &str, visible_prefix: usize) -> String {
    if input.chars().count() <= visible_prefix {
        return "...".to_string();
    }
    let prefix: String = input.chars().take(visible_prefix).collect();
    format!("{}...", prefix)
}

impl Config {
    /// Load from `path`, or from `~/.pullbus/config.json` when `path` is
    /// `None`, then apply environment overrides.
    ///
    /// An explicit path must exist; the default one may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::read(path)?,
            None => {
                let default_path = config_dir()?.join(CONFIG_FILE_NAME);
                if default_path.exists() {
                    Self::read(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_from(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {:?}", path))?;
        tracing::debug!(path = ?path, "Loaded config");
        Ok(config)
    }

    /// Apply `OLLAMA_BASE_URL`, `HF_TOKEN`, `HTTP_CONNECT_TIMEOUT`,
    /// `HTTP_READ_TIMEOUT`, `OLLAMA_BLOBS_BASE_DIR` and `PULLBUS_DATA_DIR`.
    ///
    /// Empty values are ignored. Unparseable timeouts are logged and ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(url) = get("OLLAMA_BASE_URL") {
            self.ollama_url = url;
        }
        if let Some(token) = get("HF_TOKEN") {
            self.hf_token = Some(token);
        }
        for (key, target) in [
            ("HTTP_CONNECT_TIMEOUT", &mut self.connect_timeout_secs),
            ("HTTP_READ_TIMEOUT", &mut self.read_timeout_secs),
        ] {
            if let Some(raw) = get(key) {
                match raw.parse::<u64>() {
                    Ok(secs) if secs > 0 => *target = secs,
                    _ => tracing::warn!(key, value = %raw, "Ignoring invalid timeout override"),
                }
            }
        }
        if let Some(dir) = get("OLLAMA_BLOBS_BASE_DIR") {
            self.blobs_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = get("PULLBUS_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    /// Resolved data directory for the file-backed store and bus.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(config_dir()?.join("data")),
        }
    }

    pub fn masked_token(&self) -> Option<String> {
        self.hf_token.as_deref().map(|t| mask_sensitive(t, 6))
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            limits: self.limits,
            tick: Duration::from_millis(self.dispatcher_tick_ms.max(10)),
            ..QueueSettings::default()
        }
    }

    /// Model-server client with the configured timeouts.
    pub fn ollama_client(&self) -> Result<OllamaClient> {
        let client = self.http_settings().build_client()?;
        Ok(OllamaClient::new(&self.ollama_url, client))
    }

    /// Everything the workers need to reach upstream.
    pub fn worker_env(&self) -> Result<WorkerEnv> {
        let client = self.http_settings().build_client()?;
        let ollama = OllamaClient::new(&self.ollama_url, client.clone());
        let hub = HubClient::new(&self.hub_url, &self.hub_api_url, self.hf_token.clone(), client);
        Ok(WorkerEnv::new(ollama, hub)
            .with_retry(self.retry)
            .with_eject_bounds(
                Duration::from_millis(self.eject_poll_interval_ms.max(1)),
                Duration::from_secs(self.eject_max_duration_secs),
            )
            .with_download_dir(&self.download_dir)
            .with_blobs_dir(self.blobs_dir.clone()))
    }

    pub fn open_store(&self) -> Result<Arc<dyn JobStore>> {
        Ok(match self.storage {
            StorageBackend::Memory => Arc::new(MemoryJobStore::new()),
            StorageBackend::File => {
                let dir = self.data_dir()?;
                Arc::new(FileJobStore::open(&dir).with_context(|| format!("Failed to open job store in {:?}", dir))?)
            }
        })
    }

    pub fn open_bus(&self) -> Result<Arc<dyn ProgressBus>> {
        let grace = Duration::from_secs(self.grace_window_secs);
        Ok(match self.storage {
            StorageBackend::Memory => Arc::new(MemoryBus::with_options(grace, DEFAULT_CHANNEL_CAPACITY)),
            StorageBackend::File => {
                let dir = self.data_dir()?.join("events");
                Arc::new(
                    FileBus::open(&dir)
                        .with_context(|| format!("Failed to open progress bus in {:?}", dir))?
                        .with_grace_window(grace),
                )
            }
        })
    }
}
