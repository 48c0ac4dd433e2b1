// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process progress bus.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::broadcast::{self, error::RecvError};

use super::{EventBody, ProgressBus, ProgressEvent, Subscription, DEFAULT_GRACE_WINDOW};
use crate::errors::BusError;
use crate::sync::{resilient_read, resilient_write};

/// Live events buffered per job before a slow receiver lags.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

struct Topic {
    events: Vec<ProgressEvent>,
    tx: broadcast::Sender<ProgressEvent>,
    created_at: Instant,
    closed_at: Option<Instant>,
}

impl Topic {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            events: Vec::new(),
            tx,
            created_at: Instant::now(),
            closed_at: None,
        }
    }
}

struct Inner {
    topics: RwLock<HashMap<String, Topic>>,
    grace: Duration,
    capacity: usize,
}

impl Inner {
    fn history(&self, job_id: &str, from_seq: u64) -> Vec<ProgressEvent> {
        let topics = resilient_read(&self.topics);
        topics
            .get(job_id)
            .map(|topic| tail(&topic.events, from_seq))
            .unwrap_or_default()
    }
}

fn tail(events: &[ProgressEvent], from_seq: u64) -> Vec<ProgressEvent> {
    let start = usize::try_from(from_seq).unwrap_or(usize::MAX).min(events.len());
    events[start..].to_vec()
}

/// Progress bus backed by per-job history plus a broadcast channel.
///
/// History snapshot and live receiver are taken under one lock, so the
/// hand-over from replay to live neither drops nor repeats an event.
///
/// # Example
///
/// ```
/// use pullbus::bus::{EventBody, MemoryBus, ProgressBus};
///
/// let bus = MemoryBus::new();
/// let first = bus.publish("job-1", EventBody::message("starting")).unwrap();
/// assert_eq!(first.seq, 0);
/// assert_eq!(bus.history("job-1", 0).unwrap().len(), 1);
/// ```
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_options(DEFAULT_GRACE_WINDOW, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with a custom grace window and live-channel capacity.
    pub fn with_options(grace: Duration, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: RwLock::new(HashMap::new()),
                grace,
                capacity: capacity.max(1),
            }),
        }
    }

    /// Number of live subscriptions attached to a job.
    pub fn subscriber_count(&self, job_id: &str) -> usize {
        resilient_read(&self.inner.topics)
            .get(job_id)
            .map(|topic| topic.tx.receiver_count())
            .unwrap_or(0)
    }
}

impl ProgressBus for MemoryBus {
    fn publish(&self, job_id: &str, body: EventBody) -> Result<ProgressEvent, BusError> {
        let mut topics = resilient_write(&self.inner.topics);
        let capacity = self.inner.capacity;
        let topic = topics
            .entry(job_id.to_string())
            .or_insert_with(|| Topic::new(capacity));

        if topic.closed_at.is_some() {
            return Err(BusError::Closed {
                job_id: job_id.to_string(),
            });
        }

        let event = ProgressEvent {
            job_id: job_id.to_string(),
            seq: topic.events.len() as u64,
            body,
            at: Utc::now(),
        };
        if event.is_terminal() {
            topic.closed_at = Some(Instant::now());
        }
        topic.events.push(event.clone());
        // No receivers is fine; history holds the event.
        let _ = topic.tx.send(event.clone());

        tracing::trace!(job_id = %job_id, seq = event.seq, kind = event.kind().as_str(), "Published");
        Ok(event)
    }

    fn history(&self, job_id: &str, from_seq: u64) -> Result<Vec<ProgressEvent>, BusError> {
        Ok(self.inner.history(job_id, from_seq))
    }

    fn subscribe(&self, job_id: &str, from_seq: u64) -> Result<Subscription, BusError> {
        let (backlog, mut rx, closed) = {
            let mut topics = resilient_write(&self.inner.topics);
            let capacity = self.inner.capacity;
            // Subscribing before the first publish is allowed.
            let topic = topics
                .entry(job_id.to_string())
                .or_insert_with(|| Topic::new(capacity));
            (
                tail(&topic.events, from_seq),
                topic.tx.subscribe(),
                topic.closed_at.is_some(),
            )
        };

        let inner = Arc::clone(&self.inner);
        let job_id = job_id.to_string();

        let stream = async_stream::stream! {
            let mut next = from_seq;

            for event in backlog {
                next = event.seq + 1;
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    return;
                }
            }
            if closed {
                return;
            }

            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.seq < next {
                            continue;
                        }
                        next = event.seq + 1;
                        let terminal = event.is_terminal();
                        yield event;
                        if terminal {
                            return;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(job_id = %job_id, skipped, "Subscriber lagged; replaying from history");
                        for event in inner.history(&job_id, next) {
                            next = event.seq + 1;
                            let terminal = event.is_terminal();
                            yield event;
                            if terminal {
                                return;
                            }
                        }
                    }
                    // Topic pruned.
                    Err(RecvError::Closed) => return,
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn is_retained(&self, job_id: &str) -> bool {
        resilient_read(&self.inner.topics)
            .get(job_id)
            .map(|topic| !topic.events.is_empty())
            .unwrap_or(false)
    }

    fn prune(&self) -> usize {
        let grace = self.inner.grace;
        let mut topics = resilient_write(&self.inner.topics);
        let before = topics.len();
        topics.retain(|_, topic| match topic.closed_at {
            Some(closed_at) => closed_at.elapsed() < grace,
            // Topics created by a subscriber for a job that never published.
            None => {
                !topic.events.is_empty()
                    || topic.tx.receiver_count() > 0
                    || topic.created_at.elapsed() < grace
            }
        });
        let removed = before - topics.len();
        if removed > 0 {
            tracing::debug!(removed, "Pruned progress history");
        }
        removed
    }
}
