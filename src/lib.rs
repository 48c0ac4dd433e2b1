// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! pullbus - background model transfers with live progress
//!
//! Long-running model-server operations (pulling a model, downloading a GGUF
//! file from the hub and registering it, checking for updates, forcing an
//! unload) run as queued jobs. Every job publishes an ordered stream of
//! progress events that any number of clients can follow over SSE, resume
//! after a disconnect, or replace with plain polling.
//!
//! **submit** -> **queue** -> **worker** -> **progress bus** -> **SSE / polling**
//!
//! # Core Modules
//!
//! - [`jobs`] - Job model, store, queue with per-kind concurrency ceilings
//! - [`bus`] - Progress pub/sub with gapless per-job sequence numbers and replay
//! - [`workers`] - Pull, GGUF download, update check, forced eject, blob workflow
//! - [`upstream`] - Model-server and hub HTTP clients, retry policy
//! - [`server`] - HTTP API and the SSE progress stream
//! - [`config`] - Config file, environment overrides, component wiring
//! - [`errors`] - Error taxonomy and HTTP error responses
//!
//! # Example
//!
//! ```
//! use pullbus::jobs::{JobKind, JobRequest};
//!
//! let request: JobRequest = serde_json::from_str(r#"{"kind": "pull", "model": "llama3"}"#).unwrap();
//! assert_eq!(request.kind(), JobKind::Pull);
//! assert!(request.validate().is_ok());
//! ```

pub mod bus;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod server;
pub mod sync;
pub mod upstream;
pub mod workers;

pub use bus::{EventBody, EventKind, MemoryBus, ProgressBus, ProgressEvent};
pub use config::{Config, StorageBackend};
pub use errors::{ApiError, BusError, JobError, StoreError};
pub use jobs::{Job, JobKind, JobQueue, JobRequest, JobState};
pub use server::Server;
