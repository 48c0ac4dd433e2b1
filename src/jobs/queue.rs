// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job queue and dispatcher.
//!
//! `submit` records a job and wakes the dispatcher. The dispatcher walks
//! queued jobs oldest first, claims each one whose kind has a free slot, and
//! runs it on its own task. The runner is the only place a job reaches a
//! terminal state, so every job ends with exactly one `done` or `error`
//! event, whatever its worker did.
//!
//! A queue built without [`JobQueue::start`] only submits and cancels. That
//! is how `serve --no-workers` runs: a separate `pullbus worker` process
//! sharing the file-backed store and bus does the work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::context::JobContext;
use super::store::{JobStore, Transition, DEFAULT_FINISHED_RETENTION, DEFAULT_MAX_FINISHED};
use super::types::{Job, JobKind, JobRequest, JobState};
use crate::bus::{EventBody, ProgressBus};
use crate::errors::{JobError, StoreError};
use crate::sync::resilient_lock;
use crate::workers::{self, WorkerEnv};

fn default_pull_limit() -> usize {
    2
}

fn default_gguf_limit() -> usize {
    1
}

fn default_update_check_limit() -> usize {
    4
}

fn default_eject_limit() -> usize {
    1
}

/// How many jobs of each kind may run at once in one worker process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConcurrencyLimits {
    #[serde(default = "default_pull_limit")]
    pub pull: usize,
    #[serde(default = "default_gguf_limit")]
    pub gguf_download: usize,
    #[serde(default = "default_update_check_limit")]
    pub update_check: usize,
    #[serde(default = "default_eject_limit")]
    pub eject_force: usize,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            pull: default_pull_limit(),
            gguf_download: default_gguf_limit(),
            update_check: default_update_check_limit(),
            eject_force: default_eject_limit(),
        }
    }
}

impl ConcurrencyLimits {
    /// Ceiling for `kind`. Never zero, or the kind would starve.
    pub fn limit_for(&self, kind: JobKind) -> usize {
        let limit = match kind {
            JobKind::Pull => self.pull,
            JobKind::GgufDownload => self.gguf_download,
            JobKind::UpdateCheck => self.update_check,
            JobKind::EjectForce => self.eject_force,
        };
        limit.max(1)
    }
}

/// Dispatcher tunables.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub limits: ConcurrencyLimits,
    /// Poll interval, so jobs submitted by another process are picked up
    pub tick: Duration,
    /// How often retained bus history and finished jobs are pruned
    pub prune_interval: Duration,
    pub finished_retention: Duration,
    pub max_finished: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            limits: ConcurrencyLimits::default(),
            tick: Duration::from_millis(500),
            prune_interval: Duration::from_secs(30),
            finished_retention: DEFAULT_FINISHED_RETENTION,
            max_finished: DEFAULT_MAX_FINISHED,
        }
    }
}

struct RunningJob {
    kind: JobKind,
    cancel: CancellationToken,
}

struct QueueInner {
    store: Arc<dyn JobStore>,
    bus: Arc<dyn ProgressBus>,
    settings: QueueSettings,
    worker_id: String,
    wake: Notify,
    running: Mutex<HashMap<String, RunningJob>>,
    shutdown: CancellationToken,
}

/// Handle to the job queue. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, bus: Arc<dyn ProgressBus>, settings: QueueSettings) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let worker_id = format!("worker-{}-{}", std::process::id(), &suffix[..8]);
        Self {
            inner: Arc::new(QueueInner {
                store,
                bus,
                settings,
                worker_id,
                wake: Notify::new(),
                running: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start the dispatcher on the current runtime.
    pub fn start(&self, env: WorkerEnv) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let env = Arc::new(env);
        tracing::info!(worker_id = %inner.worker_id, "Starting job dispatcher");
        tokio::spawn(async move {
            QueueInner::dispatch_loop(inner, env).await;
        })
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub fn bus(&self) -> &Arc<dyn ProgressBus> {
        &self.inner.bus
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// Validate and enqueue a job.
    ///
    /// The `queued` status event is published before the record is stored,
    /// so a client that sees the job id can always replay from sequence 0.
    pub fn submit(&self, request: JobRequest) -> Result<Job, JobError> {
        request.validate()?;
        let job = Job::new(request);

        self.inner.bus.publish(&job.id, EventBody::state(JobState::Queued))?;
        if let Err(e) = self.inner.store.insert(job.clone()) {
            let err = JobError::from(e);
            tracing::error!(job_id = %job.id, error = %err, "Failed to record job");
            // Close the topic so prune can reclaim it.
            for body in [EventBody::state(JobState::Failed), EventBody::error(&err)] {
                if let Err(bus_err) = self.inner.bus.publish(&job.id, body) {
                    tracing::warn!(job_id = %job.id, error = %bus_err, "Failed to close progress stream");
                    break;
                }
            }
            return Err(err);
        }
        tracing::info!(job_id = %job.id, kind = %job.kind, "Job queued");

        self.inner.wake.notify_one();
        Ok(job)
    }

    /// Request cooperative cancellation. A terminal job is returned unchanged.
    pub fn cancel(&self, job_id: &str) -> Result<Job, StoreError> {
        let job = self.inner.store.request_cancel(job_id)?;
        if !job.is_terminal() {
            if let Some(running) = resilient_lock(&self.inner.running).get(job_id) {
                running.cancel.cancel();
            }
            tracing::info!(job_id, state = %job.state, "Cancellation requested");
            self.inner.wake.notify_one();
        }
        Ok(job)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        self.inner.store.get(job_id)
    }

    /// Active and recent jobs, oldest first.
    pub fn list(&self) -> Result<Vec<Job>, StoreError> {
        self.inner.store.list()
    }

    /// Remove every finished job from the store.
    pub fn clear_finished(&self) -> Result<usize, StoreError> {
        let cleared = self.inner.store.clear_finished()?;
        tracing::info!(cleared, "Cleared finished jobs");
        Ok(cleared)
    }

    /// Jobs currently running in this process.
    pub fn running_count(&self) -> usize {
        resilient_lock(&self.inner.running).len()
    }

    /// Stop dispatching and cancel running jobs, waiting up to `grace` for
    /// them to publish their terminal events.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.cancel();
        for running in resilient_lock(&self.inner.running).values() {
            running.cancel.cancel();
        }

        let deadline = Instant::now() + grace;
        while self.running_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let left = self.running_count();
        if left > 0 {
            tracing::warn!(running = left, "Shutdown grace elapsed with jobs still running");
        }
    }
}

impl QueueInner {
    async fn dispatch_loop(self: Arc<Self>, env: Arc<WorkerEnv>) {
        let mut tick = tokio::time::interval(self.settings.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_prune = Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tick.tick() => {}
            }

            if let Err(e) = self.dispatch_once(&env) {
                tracing::error!(error = %e, "Dispatcher pass failed");
            }
            if last_prune.elapsed() >= self.settings.prune_interval {
                self.prune();
                last_prune = Instant::now();
            }
        }
        tracing::info!(worker_id = %self.worker_id, "Job dispatcher stopped");
    }

    /// One pass over the store: relay cancellations, finalize cancelled
    /// queued jobs, claim and start what fits under the ceilings.
    fn dispatch_once(self: &Arc<Self>, env: &Arc<WorkerEnv>) -> Result<(), StoreError> {
        let jobs = self.store.list()?;

        let mut active: HashMap<JobKind, usize> = HashMap::new();
        {
            let running = resilient_lock(&self.running);
            for job in jobs.iter().filter(|j| j.cancel_requested) {
                if let Some(r) = running.get(&job.id) {
                    r.cancel.cancel();
                }
            }
            for r in running.values() {
                *active.entry(r.kind).or_insert(0) += 1;
            }
        }

        for job in jobs.into_iter().filter(|j| j.state == JobState::Queued) {
            if job.claimed_by.is_some() {
                continue;
            }
            if job.cancel_requested {
                self.finalize(&job.id, Err(JobError::Cancelled), Vec::new());
                continue;
            }

            let slots = active.entry(job.kind).or_insert(0);
            if *slots >= self.settings.limits.limit_for(job.kind) {
                continue;
            }
            if !self.store.claim(&job.id, &self.worker_id)? {
                continue;
            }
            *slots += 1;
            self.spawn_runner(job, Arc::clone(env));
        }
        Ok(())
    }

    fn spawn_runner(self: &Arc<Self>, job: Job, env: Arc<WorkerEnv>) {
        let cancel = CancellationToken::new();
        resilient_lock(&self.running).insert(
            job.id.clone(),
            RunningJob {
                kind: job.kind,
                cancel: cancel.clone(),
            },
        );

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let job_id = job.id.clone();
            inner.run(job, env, cancel).await;
            resilient_lock(&inner.running).remove(&job_id);
            inner.wake.notify_one();
        });
    }

    async fn run(&self, job: Job, env: Arc<WorkerEnv>, cancel: CancellationToken) {
        let ctx = JobContext::new(&job.id, Arc::clone(&self.bus), cancel);

        let outcome = if ctx.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            self.publish(&job.id, EventBody::state(JobState::Running));
            match self.store.transition(&job.id, Transition::to(JobState::Running)) {
                Ok(_) => {
                    tracing::info!(job_id = %job.id, kind = %job.kind, "Job started");
                    workers::run(&ctx, &env, &job.params).await
                }
                Err(e) => Err(JobError::from(e)),
            }
        };

        self.finalize(&job.id, outcome, ctx.warnings());
    }

    /// Publish the terminal status and event, then record the outcome.
    fn finalize(&self, job_id: &str, outcome: Result<Value, JobError>, warnings: Vec<String>) {
        let (state, result, terminal) = match outcome {
            Ok(result) => (JobState::Succeeded, result.clone(), EventBody::done(result)),
            Err(err) => {
                match &err {
                    JobError::Cancelled => tracing::info!(job_id, "Job cancelled"),
                    other => tracing::warn!(job_id, cause = other.cause(), error = %other, "Job failed"),
                }
                let result = json!({ "error": err.to_string(), "cause": err.cause() });
                (err.terminal_state(), result, EventBody::error(&err))
            }
        };

        self.publish(job_id, EventBody::state(state));
        self.publish(job_id, terminal);

        let transition = Transition::to(state).with_result(result).with_warnings(warnings);
        match self.store.transition(job_id, transition) {
            Ok(job) => {
                tracing::info!(job_id, state = %job.state, warnings = job.warnings.len(), "Job finished");
            }
            Err(e) => tracing::error!(job_id, error = %e, "Failed to record job outcome"),
        }
    }

    fn publish(&self, job_id: &str, body: EventBody) {
        if let Err(e) = self.bus.publish(job_id, body) {
            tracing::warn!(job_id, error = %e, "Failed to publish job event");
        }
    }

    fn prune(&self) {
        let events = self.bus.prune();
        let jobs = match self
            .store
            .prune_finished(self.settings.finished_retention, self.settings.max_finished)
        {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "Failed to prune finished jobs");
                0
            }
        };
        if events > 0 || jobs > 0 {
            tracing::debug!(bus_topics = events, jobs, "Pruned retained state");
        }
    }
}
