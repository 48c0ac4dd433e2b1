// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job store: the authoritative record of every job's state.
//!
//! The store enforces the lifecycle order and the claim rule (a job is claimed
//! at most once, and only while queued). Two backends:
//!
//! - [`MemoryJobStore`]: a map behind an `RwLock`.
//! - [`FileJobStore`]: one JSON document on disk, read-modify-written under an
//!   exclusive file lock, saved through a temp file and an atomic rename.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{Job, JobState};
use crate::errors::StoreError;
use crate::sync::{lock_exclusive, lock_shared, off_runtime, resilient_read, resilient_write, LOCK_TIMEOUT};

/// Finished jobs kept at most this long.
pub const DEFAULT_FINISHED_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// At most this many finished jobs are kept.
pub const DEFAULT_MAX_FINISHED: usize = 50;

/// A requested state change plus what to record with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub to: JobState,
    pub result: Option<Value>,
    pub warnings: Vec<String>,
}

impl Transition {
    pub fn to(state: JobState) -> Self {
        Self {
            to: state,
            result: None,
            warnings: Vec::new(),
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }
}

/// Storage of job records.
pub trait JobStore: Send + Sync {
    fn insert(&self, job: Job) -> Result<(), StoreError>;

    fn get(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// All jobs, oldest first (`created_at`, then id).
    fn list(&self) -> Result<Vec<Job>, StoreError>;

    /// Take ownership of a queued, unclaimed job. Returns false if another
    /// worker got there first or the job is no longer queued.
    fn claim(&self, id: &str, worker_id: &str) -> Result<bool, StoreError>;

    /// Move a job along its lifecycle.
    fn transition(&self, id: &str, transition: Transition) -> Result<Job, StoreError>;

    /// Flag a job for cooperative cancellation. Terminal jobs are returned
    /// unchanged.
    fn request_cancel(&self, id: &str) -> Result<Job, StoreError>;

    /// Remove every terminal job. Returns how many.
    fn clear_finished(&self) -> Result<usize, StoreError>;

    /// Drop finished jobs older than `max_age`, then the oldest beyond
    /// `max_finished`. Returns how many.
    fn prune_finished(&self, max_age: Duration, max_finished: usize) -> Result<usize, StoreError>;
}

// =============================================================================
// SHARED RECORD LOGIC
// =============================================================================

fn sorted(jobs: impl Iterator<Item = Job>) -> Vec<Job> {
    let mut jobs: Vec<Job> = jobs.collect();
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    jobs
}

fn apply_claim(jobs: &mut HashMap<String, Job>, id: &str, worker_id: &str) -> Result<bool, StoreError> {
    let job = jobs
        .get_mut(id)
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    if job.state != JobState::Queued || job.claimed_by.is_some() || job.cancel_requested {
        return Ok(false);
    }
    job.claimed_by = Some(worker_id.to_string());
    job.updated_at = Utc::now();
    Ok(true)
}

fn apply_transition(
    jobs: &mut HashMap<String, Job>,
    id: &str,
    transition: Transition,
) -> Result<Job, StoreError> {
    let job = jobs
        .get_mut(id)
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    if !job.state.can_transition_to(transition.to) {
        return Err(StoreError::InvalidTransition {
            id: id.to_string(),
            from: job.state,
            to: transition.to,
        });
    }
    job.update_state(transition.to);
    if transition.result.is_some() {
        job.result = transition.result;
    }
    job.warnings.extend(transition.warnings);
    Ok(job.clone())
}

fn apply_cancel(jobs: &mut HashMap<String, Job>, id: &str) -> Result<Job, StoreError> {
    let job = jobs
        .get_mut(id)
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    if !job.is_terminal() && !job.cancel_requested {
        job.cancel_requested = true;
        job.updated_at = Utc::now();
    }
    Ok(job.clone())
}

fn apply_clear_finished(jobs: &mut HashMap<String, Job>) -> usize {
    let before = jobs.len();
    jobs.retain(|_, job| !job.is_terminal());
    before - jobs.len()
}

fn apply_prune(jobs: &mut HashMap<String, Job>, max_age: Duration, max_finished: usize) -> usize {
    let before = jobs.len();
    let now = Utc::now();
    jobs.retain(|_, job| {
        !job.is_terminal()
            || now
                .signed_duration_since(job.updated_at)
                .to_std()
                .map(|age| age < max_age)
                .unwrap_or(true)
    });

    let mut finished: Vec<(DateTime<Utc>, String)> = jobs
        .values()
        .filter(|job| job.is_terminal())
        .map(|job| (job.updated_at, job.id.clone()))
        .collect();
    if finished.len() > max_finished {
        finished.sort();
        let excess = finished.len() - max_finished;
        for (_, id) in finished.into_iter().take(excess) {
            jobs.remove(&id);
        }
    }
    before - jobs.len()
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

/// Job store held in process memory.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn insert(&self, job: Job) -> Result<(), StoreError> {
        resilient_write(&self.jobs).insert(job.id.clone(), job);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(resilient_read(&self.jobs).get(id).cloned())
    }

    fn list(&self) -> Result<Vec<Job>, StoreError> {
        Ok(sorted(resilient_read(&self.jobs).values().cloned()))
    }

    fn claim(&self, id: &str, worker_id: &str) -> Result<bool, StoreError> {
        apply_claim(&mut resilient_write(&self.jobs), id, worker_id)
    }

    fn transition(&self, id: &str, transition: Transition) -> Result<Job, StoreError> {
        apply_transition(&mut resilient_write(&self.jobs), id, transition)
    }

    fn request_cancel(&self, id: &str) -> Result<Job, StoreError> {
        apply_cancel(&mut resilient_write(&self.jobs), id)
    }

    fn clear_finished(&self) -> Result<usize, StoreError> {
        Ok(apply_clear_finished(&mut resilient_write(&self.jobs)))
    }

    fn prune_finished(&self, max_age: Duration, max_finished: usize) -> Result<usize, StoreError> {
        Ok(apply_prune(&mut resilient_write(&self.jobs), max_age, max_finished))
    }
}

// =============================================================================
// FILE-BACKED STORE
// =============================================================================

/// On-disk document holding every job.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct JobsDocument {
    jobs: HashMap<String, Job>,
    last_saved: Option<DateTime<Utc>>,
    /// Version for future migrations
    version: u32,
}

/// Job store persisted as one JSON file, shared between processes.
pub struct FileJobStore {
    path: PathBuf,
    lock_timeout: Duration,
}

impl FileJobStore {
    /// Store jobs in `<dir>/jobs.json`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create job store directory: {:?}", dir))?;
        Ok(Self {
            path: dir.join("jobs.json"),
            lock_timeout: LOCK_TIMEOUT,
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Uses a separate .lock file so the lock survives the atomic rename.
    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn load_unlocked(&self) -> anyhow::Result<JobsDocument> {
        if !self.path.exists() {
            return Ok(JobsDocument {
                version: 1,
                ..Default::default()
            });
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read job store: {:?}", self.path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse job store: {:?}", self.path))
    }

    /// Temp file + `sync_all` + rename, so a crash never leaves a torn file.
    fn save_unlocked(&self, doc: &mut JobsDocument) -> anyhow::Result<()> {
        let temp_path = self.path.with_extension("tmp");
        doc.last_saved = Some(Utc::now());

        let content =
            serde_json::to_string_pretty(doc).context("Failed to serialize job store to JSON")?;

        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file
                .write_all(content.as_bytes())
                .context("Failed to write to temp file")?;
            temp_file
                .sync_all()
                .context("Failed to sync temp file to disk")?;
        }

        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp file to job store: {:?} -> {:?}",
                temp_path, self.path
            )
        })
    }

    fn read<T>(&self, f: impl FnOnce(&JobsDocument) -> T) -> Result<T, StoreError> {
        off_runtime(|| -> Result<T, StoreError> {
            let _lock = lock_shared(&self.lock_path(), self.lock_timeout)?;
            let doc = self.load_unlocked()?;
            Ok(f(&doc))
        })
    }

    /// Load, mutate and save while holding the exclusive lock. Nothing is
    /// written when `f` fails.
    fn update<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Job>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        off_runtime(|| -> Result<T, StoreError> {
            let _lock = lock_exclusive(&self.lock_path(), self.lock_timeout)?;
            let mut doc = self.load_unlocked()?;
            let out = f(&mut doc.jobs)?;
            self.save_unlocked(&mut doc)?;
            Ok(out)
        })
    }
}

impl JobStore for FileJobStore {
    fn insert(&self, job: Job) -> Result<(), StoreError> {
        self.update(|jobs| {
            jobs.insert(job.id.clone(), job);
            Ok(())
        })
    }

    fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        self.read(|doc| doc.jobs.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<Job>, StoreError> {
        self.read(|doc| sorted(doc.jobs.values().cloned()))
    }

    fn claim(&self, id: &str, worker_id: &str) -> Result<bool, StoreError> {
        self.update(|jobs| apply_claim(jobs, id, worker_id))
    }

    fn transition(&self, id: &str, transition: Transition) -> Result<Job, StoreError> {
        self.update(|jobs| apply_transition(jobs, id, transition))
    }

    fn request_cancel(&self, id: &str) -> Result<Job, StoreError> {
        self.update(|jobs| apply_cancel(jobs, id))
    }

    fn clear_finished(&self) -> Result<usize, StoreError> {
        self.update(|jobs| Ok(apply_clear_finished(jobs)))
    }

    fn prune_finished(&self, max_age: Duration, max_finished: usize) -> Result<usize, StoreError> {
        self.update(|jobs| Ok(apply_prune(jobs, max_age, max_finished)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobRequest;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn pull(model: &str) -> Job {
        Job::new(JobRequest::Pull { model: model.into() })
    }

    fn backends(dir: &TempDir) -> Vec<(&'static str, Box<dyn JobStore>)> {
        vec![
            ("memory", Box::new(MemoryJobStore::new())),
            ("file", Box::new(FileJobStore::open(dir.path()).unwrap())),
        ]
    }

    #[test]
    fn test_claim_only_once_and_only_while_queued() {
        let dir = TempDir::new().unwrap();
        for (name, store) in backends(&dir) {
            let job = pull("llama3");
            let id = job.id.clone();
            store.insert(job).unwrap();

            assert!(store.claim(&id, "worker-a").unwrap(), "{}", name);
            assert!(!store.claim(&id, "worker-b").unwrap(), "{}", name);
            assert_eq!(store.get(&id).unwrap().unwrap().claimed_by.as_deref(), Some("worker-a"));

            let other = pull("qwen");
            let other_id = other.id.clone();
            store.insert(other).unwrap();
            store.request_cancel(&other_id).unwrap();
            assert!(!store.claim(&other_id, "worker-a").unwrap(), "{}", name);

            assert!(matches!(store.claim("missing", "w"), Err(StoreError::NotFound(_))));
        }
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let dir = TempDir::new().unwrap();
        for (name, store) in backends(&dir) {
            let job = pull("llama3");
            let id = job.id.clone();
            store.insert(job).unwrap();

            let err = store.transition(&id, Transition::to(JobState::Succeeded)).unwrap_err();
            assert!(matches!(err, StoreError::InvalidTransition { .. }), "{}", name);

            store.transition(&id, Transition::to(JobState::Running)).unwrap();
            let done = store
                .transition(
                    &id,
                    Transition::to(JobState::Succeeded)
                        .with_result(json!({"model": "llama3"}))
                        .with_warnings(vec!["blob path unknown".into()]),
                )
                .unwrap();
            assert_eq!(done.state, JobState::Succeeded);
            assert_eq!(done.result, Some(json!({"model": "llama3"})));
            assert_eq!(done.warnings, vec!["blob path unknown".to_string()]);

            let err = store.transition(&id, Transition::to(JobState::Failed)).unwrap_err();
            assert!(matches!(err, StoreError::InvalidTransition { .. }), "{}", name);
            assert_eq!(store.get(&id).unwrap().unwrap().state, JobState::Succeeded);
        }
    }

    #[test]
    fn test_cancel_of_terminal_job_is_noop() {
        let dir = TempDir::new().unwrap();
        for (_, store) in backends(&dir) {
            let job = pull("llama3");
            let id = job.id.clone();
            store.insert(job).unwrap();
            store.transition(&id, Transition::to(JobState::Failed)).unwrap();

            let after = store.request_cancel(&id).unwrap();
            assert!(!after.cancel_requested);
            assert_eq!(after.state, JobState::Failed);

            let queued = pull("other");
            let queued_id = queued.id.clone();
            store.insert(queued).unwrap();
            assert!(store.request_cancel(&queued_id).unwrap().cancel_requested);
        }
    }

    #[test]
    fn test_list_is_fifo() {
        let store = MemoryJobStore::new();
        let mut first = pull("a");
        let mut second = pull("b");
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        first.id = "zzz".into();
        second.id = "aaa".into();
        store.insert(second).unwrap();
        store.insert(first).unwrap();

        let ids: Vec<_> = store.list().unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["zzz".to_string(), "aaa".to_string()]);
    }

    #[test]
    fn test_clear_and_prune_finished() {
        let dir = TempDir::new().unwrap();
        for (name, store) in backends(&dir) {
            let mut ids = Vec::new();
            for i in 0..4 {
                let job = pull(&format!("m{}", i));
                ids.push(job.id.clone());
                store.insert(job).unwrap();
            }
            for id in &ids[..3] {
                store.transition(id, Transition::to(JobState::Running)).unwrap();
                store.transition(id, Transition::to(JobState::Succeeded)).unwrap();
                thread::sleep(Duration::from_millis(5));
            }

            // Keep at most two finished jobs.
            assert_eq!(store.prune_finished(Duration::from_secs(3600), 2).unwrap(), 1, "{}", name);
            assert!(store.get(&ids[0]).unwrap().is_none(), "{}", name);

            assert_eq!(store.clear_finished().unwrap(), 2, "{}", name);
            let left = store.list().unwrap();
            assert_eq!(left.len(), 1);
            assert_eq!(left[0].id, ids[3]);

            assert_eq!(store.prune_finished(Duration::ZERO, 50).unwrap(), 0);
        }
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let job = pull("llama3");
        let id = job.id.clone();
        {
            let store = FileJobStore::open(dir.path()).unwrap();
            store.insert(job).unwrap();
            store.claim(&id, "w1").unwrap();
        }
        let reopened = FileJobStore::open(dir.path()).unwrap();
        let loaded = reopened.get(&id).unwrap().unwrap();
        assert_eq!(loaded.claimed_by.as_deref(), Some("w1"));
        assert!(!dir.path().join("jobs.tmp").exists());
    }

    #[test]
    fn test_file_store_claim_race_has_one_winner() {
        let dir = TempDir::new().unwrap();
        let job = pull("llama3");
        let id = job.id.clone();
        FileJobStore::open(dir.path()).unwrap().insert(job).unwrap();

        let wins = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = dir.path().to_path_buf();
                let id = id.clone();
                let wins = Arc::clone(&wins);
                thread::spawn(move || {
                    let store = FileJobStore::open(&path)
                        .unwrap()
                        .with_lock_timeout(Duration::from_secs(30));
                    if store.claim(&id, &format!("worker-{}", i)).unwrap() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_update_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::open(dir.path()).unwrap();
        assert!(store.transition("missing", Transition::to(JobState::Running)).is_err());
        assert!(!store.path().exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_insert_waiting_on_held_lock_leaves_runtime_free() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileJobStore::open(dir.path()).unwrap());

        let held = lock_exclusive(&store.lock_path(), LOCK_TIMEOUT).unwrap();
        let holder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            drop(held);
        });

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        let job = pull("llama3");
        let id = job.id.clone();
        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.insert(job) })
        };
        writer.await.unwrap().unwrap();
        ticker.abort();
        holder.join().unwrap();

        assert!(store.get(&id).unwrap().is_some());
        assert!(ticks.load(Ordering::SeqCst) >= 5);
    }
}
