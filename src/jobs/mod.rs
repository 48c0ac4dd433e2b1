// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Jobs: the model, the store, the queue, and what a running worker sees.

mod context;
mod queue;
mod store;
mod types;

pub use context::{JobContext, ProgressPublisher, ProgressThrottle, PROGRESS_STEP_BYTES};
pub use queue::{ConcurrencyLimits, JobQueue, QueueSettings};
pub use store::{
    FileJobStore, JobStore, MemoryJobStore, Transition, DEFAULT_FINISHED_RETENTION,
    DEFAULT_MAX_FINISHED,
};
pub use types::{Job, JobKind, JobRequest, JobState};
