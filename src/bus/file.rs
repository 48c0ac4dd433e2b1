// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! File-backed progress bus.
//!
//! One JSON-lines log per job (`<dir>/<job_id>.jsonl`). Appends take an
//! exclusive lock on `<dir>/<job_id>.lock`, so a job's sequence numbers stay
//! gapless even when the HTTP process publishes `queued` and a separate worker
//! process publishes the rest. Subscribers poll the log from a byte offset and
//! only parse complete lines.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use super::{EventBody, ProgressBus, ProgressEvent, Subscription, DEFAULT_GRACE_WINDOW};
use crate::errors::BusError;
use crate::sync::{lock_exclusive, off_runtime, resilient_lock, LOCK_TIMEOUT};

/// How often a subscriber checks the log for new lines.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// What this process last saw at the end of a job's log.
#[derive(Debug, Clone, Copy)]
struct LogTail {
    len: u64,
    next_seq: u64,
    closed: bool,
}

/// Progress bus persisted as per-job JSON-lines logs.
pub struct FileBus {
    dir: PathBuf,
    grace: Duration,
    poll_interval: Duration,
    tails: Mutex<HashMap<String, LogTail>>,
}

impl FileBus {
    /// Open (creating if needed) a bus rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, BusError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| BusError::Storage(format!("Failed to create {:?}: {}", dir, e)))?;
        Ok(Self {
            dir,
            grace: DEFAULT_GRACE_WINDOW,
            poll_interval: DEFAULT_POLL_INTERVAL,
            tails: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_grace_window(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self, job_id: &str) -> Result<PathBuf, BusError> {
        check_job_id(job_id)?;
        Ok(self.dir.join(format!("{}.jsonl", job_id)))
    }

    fn lock_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", job_id))
    }

    /// End-of-log state, rescanning when another process appended since we
    /// last looked. Caller holds the job's exclusive lock.
    fn current_tail(&self, job_id: &str, log_path: &Path) -> Result<LogTail, BusError> {
        let len = match fs::metadata(log_path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(BusError::Storage(e.to_string())),
        };

        if let Some(cached) = resilient_lock(&self.tails).get(job_id) {
            if cached.len == len {
                return Ok(*cached);
            }
        }

        let tail = match read_complete_lines(log_path, 0) {
            Ok(Some((events, _))) => LogTail {
                len,
                next_seq: events.last().map(|e| e.seq + 1).unwrap_or(0),
                closed: events.last().map(|e| e.is_terminal()).unwrap_or(false),
            },
            Ok(None) => LogTail {
                len: 0,
                next_seq: 0,
                closed: false,
            },
            Err(e) => return Err(BusError::Storage(e.to_string())),
        };
        Ok(tail)
    }
}

fn check_job_id(job_id: &str) -> Result<(), BusError> {
    let valid = !job_id.is_empty()
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(BusError::Storage(format!("Invalid job id for file bus: {:?}", job_id)))
    }
}

/// Read every complete line at or after `offset`.
///
/// Returns `None` if the log does not exist, otherwise the parsed events and
/// the offset just past the last complete line.
fn read_complete_lines(path: &Path, offset: u64) -> io::Result<Option<(Vec<ProgressEvent>, u64)>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let complete = match buf.iter().rposition(|b| *b == b'\n') {
        Some(pos) => &buf[..=pos],
        None => return Ok(Some((Vec::new(), offset))),
    };

    let mut events = Vec::new();
    for line in complete.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
        match serde_json::from_slice::<ProgressEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!(path = ?path, error = %e, "Skipping malformed progress line");
            }
        }
    }
    Ok(Some((events, offset + complete.len() as u64)))
}

/// [`read_complete_lines`] on the blocking pool, for subscribers polling from
/// async code.
async fn poll_log(path: PathBuf, offset: u64) -> io::Result<Option<(Vec<ProgressEvent>, u64)>> {
    tokio::task::spawn_blocking(move || read_complete_lines(&path, offset))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

impl FileBus {
    fn append(&self, job_id: &str, body: EventBody) -> Result<ProgressEvent, BusError> {
        let log_path = self.log_path(job_id)?;
        let _guard = lock_exclusive(&self.lock_path(job_id), LOCK_TIMEOUT)?;

        let tail = self.current_tail(job_id, &log_path)?;
        if tail.closed {
            return Err(BusError::Closed {
                job_id: job_id.to_string(),
            });
        }

        let event = ProgressEvent {
            job_id: job_id.to_string(),
            seq: tail.next_seq,
            body,
            at: Utc::now(),
        };
        let mut line = serde_json::to_string(&event)
            .map_err(|e| BusError::Storage(format!("Failed to serialize event: {}", e)))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| BusError::Storage(format!("Failed to open {:?}: {}", log_path, e)))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| BusError::Storage(format!("Failed to append to {:?}: {}", log_path, e)))?;

        resilient_lock(&self.tails).insert(
            job_id.to_string(),
            LogTail {
                len: tail.len + line.len() as u64,
                next_seq: event.seq + 1,
                closed: event.is_terminal(),
            },
        );

        tracing::trace!(job_id = %job_id, seq = event.seq, kind = event.kind().as_str(), "Appended");
        Ok(event)
    }

    fn prune_expired(&self) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = ?self.dir, error = %e, "Failed to list progress logs");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(job_id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };

            let last = match read_complete_lines(&path, 0) {
                Ok(Some((events, _))) => events.into_iter().last(),
                _ => None,
            };
            let expired = last
                .filter(|event| event.is_terminal())
                .and_then(|event| Utc::now().signed_duration_since(event.at).to_std().ok())
                .map(|age| age >= self.grace)
                .unwrap_or(false);
            if !expired {
                continue;
            }

            let Ok(_guard) = lock_exclusive(&self.lock_path(&job_id), LOCK_TIMEOUT) else {
                continue;
            };
            if fs::remove_file(&path).is_ok() {
                removed += 1;
                resilient_lock(&self.tails).remove(&job_id);
            }
            drop(_guard);
            let _ = fs::remove_file(self.lock_path(&job_id));
        }

        if removed > 0 {
            tracing::debug!(removed, "Pruned progress logs");
        }
        removed
    }
}

impl ProgressBus for FileBus {
    fn publish(&self, job_id: &str, body: EventBody) -> Result<ProgressEvent, BusError> {
        off_runtime(|| self.append(job_id, body))
    }

    fn history(&self, job_id: &str, from_seq: u64) -> Result<Vec<ProgressEvent>, BusError> {
        let log_path = self.log_path(job_id)?;
        let events = off_runtime(|| read_complete_lines(&log_path, 0))
            .map_err(|e| BusError::Storage(e.to_string()))?
            .map(|(events, _)| events)
            .unwrap_or_default();
        Ok(events.into_iter().filter(|e| e.seq >= from_seq).collect())
    }

    fn subscribe(&self, job_id: &str, from_seq: u64) -> Result<Subscription, BusError> {
        let log_path = self.log_path(job_id)?;
        let poll_interval = self.poll_interval;
        let job_id = job_id.to_string();

        let stream = async_stream::stream! {
            let mut next = from_seq;
            let mut offset = 0u64;
            let mut seen_log = false;

            loop {
                match poll_log(log_path.clone(), offset).await {
                    Ok(Some((events, new_offset))) => {
                        seen_log = true;
                        offset = new_offset;
                        for event in events {
                            let terminal = event.is_terminal();
                            if event.seq >= next {
                                next = event.seq + 1;
                                yield event;
                            }
                            if terminal {
                                return;
                            }
                        }
                    }
                    // Pruned while we were following it.
                    Ok(None) if seen_log => return,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Failed to read progress log");
                        return;
                    }
                }
                tokio::time::sleep(poll_interval).await;
            }
        };

        Ok(Box::pin(stream))
    }

    fn is_retained(&self, job_id: &str) -> bool {
        self.log_path(job_id)
            .map(|path| path.exists())
            .unwrap_or(false)
    }

    fn prune(&self) -> usize {
        off_runtime(|| self.prune_expired())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobState;
    use futures_util::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn bus(dir: &TempDir) -> FileBus {
        FileBus::open(dir.path())
            .unwrap()
            .with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn test_publish_appends_gapless_sequence() {
        let dir = TempDir::new().unwrap();
        let bus = bus(&dir);
        for expected in 0..3 {
            assert_eq!(bus.publish("job1", EventBody::message("x")).unwrap().seq, expected);
        }
        let history = bus.history("job1", 1).unwrap();
        assert_eq!(history.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_two_handles_share_one_sequence() {
        let dir = TempDir::new().unwrap();
        let http_side = bus(&dir);
        let worker_side = bus(&dir);

        assert_eq!(http_side.publish("job1", EventBody::state(JobState::Queued)).unwrap().seq, 0);
        assert_eq!(worker_side.publish("job1", EventBody::state(JobState::Running)).unwrap().seq, 1);
        assert_eq!(http_side.publish("job1", EventBody::message("hi")).unwrap().seq, 2);
        worker_side.publish("job1", EventBody::done(json!({}))).unwrap();

        let err = http_side.publish("job1", EventBody::message("late")).unwrap_err();
        assert!(matches!(err, BusError::Closed { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_publish_waiting_on_held_lock_leaves_runtime_free() {
        let dir = TempDir::new().unwrap();
        let bus = Arc::new(bus(&dir));

        // A second process mid-append, holding the job's lock.
        let held = lock_exclusive(&dir.path().join("job1.lock"), LOCK_TIMEOUT).unwrap();
        let holder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
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

        let publisher = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.publish("job1", EventBody::message("after the lock")) })
        };
        let event = publisher.await.unwrap().unwrap();
        ticker.abort();
        holder.join().unwrap();

        assert_eq!(event.seq, 0);
        assert!(ticks.load(Ordering::SeqCst) >= 5);
    }

    #[test]
    fn test_rejects_path_like_job_ids() {
        let dir = TempDir::new().unwrap();
        let bus = bus(&dir);
        assert!(bus.publish("../escape", EventBody::message("x")).is_err());
        assert!(!bus.is_retained("../escape"));
    }

    #[tokio::test]
    async fn test_subscriber_follows_appends_from_other_handle() {
        let dir = TempDir::new().unwrap();
        let reader = bus(&dir);
        let writer = bus(&dir);

        writer.publish("job1", EventBody::state(JobState::Queued)).unwrap();
        let mut sub = reader.subscribe("job1", 0).unwrap();

        let first = timeout(Duration::from_secs(2), sub.next()).await.unwrap().unwrap();
        assert_eq!(first.seq, 0);

        writer.publish("job1", EventBody::progress("pulling", 5, Some(10))).unwrap();
        writer.publish("job1", EventBody::done(json!({"ok": true}))).unwrap();

        let mut seqs = Vec::new();
        while let Some(event) = timeout(Duration::from_secs(2), sub.next()).await.unwrap() {
            seqs.push(event.seq);
        }
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_partial_line_is_not_delivered() {
        let dir = TempDir::new().unwrap();
        let bus = bus(&dir);
        bus.publish("job1", EventBody::message("one")).unwrap();

        // Simulate a writer caught mid-append.
        let log = dir.path().join("job1.jsonl");
        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        file.write_all(br#"{"job_id":"job1","seq":1,"#).unwrap();

        let (events, offset) = read_complete_lines(&log, 0).unwrap().unwrap();
        assert_eq!(events.len(), 1);
        let (more, _) = read_complete_lines(&log, offset).unwrap().unwrap();
        assert!(more.is_empty());
    }

    #[tokio::test]
    async fn test_cursor_past_terminal_ends_stream() {
        let dir = TempDir::new().unwrap();
        let bus = bus(&dir);
        bus.publish("job1", EventBody::message("one")).unwrap();
        bus.publish("job1", EventBody::done(json!({}))).unwrap();

        let mut sub = bus.subscribe("job1", 5).unwrap();
        let next = timeout(Duration::from_secs(2), sub.next()).await.unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn test_prune_removes_only_expired_terminal_logs() {
        let dir = TempDir::new().unwrap();
        let bus = bus(&dir).with_grace_window(Duration::ZERO);
        bus.publish("finished", EventBody::done(json!({}))).unwrap();
        bus.publish("running", EventBody::message("still going")).unwrap();

        assert_eq!(bus.prune(), 1);
        assert!(!bus.is_retained("finished"));
        assert!(bus.is_retained("running"));
        assert!(!dir.path().join("finished.lock").exists());

        let patient = FileBus::open(dir.path()).unwrap();
        patient.publish("other", EventBody::done(json!({}))).unwrap();
        assert_eq!(patient.prune(), 0);
    }
}
