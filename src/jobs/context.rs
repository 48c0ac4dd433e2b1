// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! What a running worker gets: a way to report progress and a way to notice
//! it has been cancelled.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::bus::{EventBody, ProgressBus};
use crate::errors::{BusError, JobError};
use crate::sync::resilient_lock;

/// Byte step at which throttled progress is always reported.
pub const PROGRESS_STEP_BYTES: u64 = 8 * 1024 * 1024;

/// Publishes non-terminal events for one job.
///
/// Cheap to clone, so it can move into upload/download callbacks. Publishing
/// never fails the job: a bus error is logged and the work carries on.
#[derive(Clone)]
pub struct ProgressPublisher {
    job_id: Arc<str>,
    bus: Arc<dyn ProgressBus>,
}

impl ProgressPublisher {
    pub fn new(job_id: &str, bus: Arc<dyn ProgressBus>) -> Self {
        Self {
            job_id: Arc::from(job_id),
            bus,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn progress(&self, phase: &str, bytes_completed: u64, bytes_total: Option<u64>) {
        self.publish(EventBody::progress(phase, bytes_completed, bytes_total));
    }

    pub fn message(&self, message: impl Into<String>) {
        self.publish(EventBody::message(message));
    }

    pub(crate) fn publish(&self, body: EventBody) {
        match self.bus.publish(&self.job_id, body) {
            Ok(_) => {}
            Err(BusError::Closed { .. }) => {
                tracing::warn!(job_id = %self.job_id, "Dropped event published after the terminal event");
            }
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Failed to publish progress");
            }
        }
    }
}

/// Per-job handle passed to workers.
pub struct JobContext {
    publisher: ProgressPublisher,
    cancel: CancellationToken,
    warnings: Mutex<Vec<String>>,
}

impl JobContext {
    pub fn new(job_id: &str, bus: Arc<dyn ProgressBus>, cancel: CancellationToken) -> Self {
        Self {
            publisher: ProgressPublisher::new(job_id, bus),
            cancel,
            warnings: Mutex::new(Vec::new()),
        }
    }

    pub fn job_id(&self) -> &str {
        self.publisher.job_id()
    }

    pub fn publisher(&self) -> ProgressPublisher {
        self.publisher.clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancellation point. Workers call this between units of work.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Await `fut`, giving up early if the job is cancelled meanwhile.
    ///
    /// Only for waits (stream reads, sleeps). Never wrap a write that must
    /// not be torn.
    pub async fn or_cancel<F: Future>(&self, fut: F) -> Result<F::Output, JobError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(JobError::Cancelled),
            out = fut => Ok(out),
        }
    }

    pub fn progress(&self, phase: &str, bytes_completed: u64, bytes_total: Option<u64>) {
        self.publisher.progress(phase, bytes_completed, bytes_total);
    }

    pub fn status(&self, message: impl Into<String>) {
        self.publisher.message(message);
    }

    /// Record a recoverable problem and tell subscribers about it.
    pub fn warn(&self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::warn!(job_id = %self.job_id(), "{}", warning);
        resilient_lock(&self.warnings).push(warning.clone());
        self.publisher.publish(EventBody::warning(warning));
    }

    pub fn warnings(&self) -> Vec<String> {
        resilient_lock(&self.warnings).clone()
    }
}

/// Decides when a byte counter is worth publishing: every 1% of a known
/// total, every [`PROGRESS_STEP_BYTES`], and at completion.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    total: Option<u64>,
    last: Option<u64>,
}

impl ProgressThrottle {
    pub fn new(total: Option<u64>) -> Self {
        Self { total, last: None }
    }

    pub fn should_emit(&mut self, completed: u64) -> bool {
        let emit = match self.last {
            None => true,
            Some(last) => {
                let delta = completed.saturating_sub(last);
                let percent_step = self
                    .total
                    .filter(|t| *t > 0)
                    .map(|t| delta.saturating_mul(100) >= t)
                    .unwrap_or(false);
                let finished = self.total == Some(completed) && completed != last;
                delta >= PROGRESS_STEP_BYTES || percent_step || finished
            }
        };
        if emit {
            self.last = Some(completed);
        }
        emit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, ProgressBus};
    use serde_json::json;

    #[test]
    fn test_checkpoint_reports_cancellation() {
        let bus: Arc<dyn ProgressBus> = Arc::new(MemoryBus::new());
        let token = CancellationToken::new();
        let ctx = JobContext::new("j", bus, token.clone());
        assert!(ctx.checkpoint().is_ok());
        token.cancel();
        assert_eq!(ctx.checkpoint(), Err(JobError::Cancelled));
    }

    #[test]
    fn test_warn_records_and_publishes() {
        let bus = MemoryBus::new();
        let ctx = JobContext::new("j", Arc::new(bus.clone()), CancellationToken::new());
        ctx.warn("blob path unknown");

        assert_eq!(ctx.warnings(), vec!["blob path unknown".to_string()]);
        let history = bus.history("j", 0).unwrap();
        assert_eq!(history[0].body, EventBody::warning("blob path unknown"));
    }

    #[test]
    fn test_publish_after_close_is_swallowed() {
        let bus = MemoryBus::new();
        bus.publish("j", EventBody::done(json!({}))).unwrap();
        let ctx = JobContext::new("j", Arc::new(bus.clone()), CancellationToken::new());
        ctx.status("too late");
        assert_eq!(bus.history("j", 0).unwrap().len(), 1);
    }

    #[test]
    fn test_throttle_by_percent_and_completion() {
        let mut throttle = ProgressThrottle::new(Some(1_000));
        assert!(throttle.should_emit(0));
        assert!(!throttle.should_emit(5));
        assert!(throttle.should_emit(10));
        assert!(!throttle.should_emit(15));
        assert!(throttle.should_emit(1_000));
        assert!(!throttle.should_emit(1_000));
    }

    #[test]
    fn test_throttle_by_bytes_when_total_unknown() {
        let mut throttle = ProgressThrottle::new(None);
        assert!(throttle.should_emit(1));
        assert!(!throttle.should_emit(PROGRESS_STEP_BYTES));
        assert!(throttle.should_emit(PROGRESS_STEP_BYTES + 1));
    }
}
