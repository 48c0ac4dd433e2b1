// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Race Detection Tests for pullbus
//!
//! Concurrent publishers, subscribers and claimers against the bus and store
//! backends. Designed to also be run under ThreadSanitizer.
//!
//! # Running with ThreadSanitizer
//!
//! ```bash
//! RUSTFLAGS="-Z sanitizer=thread" cargo +nightly test --target x86_64-unknown-linux-gnu --test race_detection_test
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::timeout;

use pullbus::bus::{EventBody, FileBus, MemoryBus, ProgressBus};
use pullbus::jobs::{FileJobStore, Job, JobRequest, JobStore, MemoryJobStore};

// Test configuration
const CONCURRENCY_LEVEL: usize = 16;
const ITERATIONS_PER_TASK: usize = 25;
const TEST_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// BUS CONCURRENT PUBLISH TESTS
// =============================================================================

/// Publish from many tasks at once, then close the topic.
async fn hammer(bus: Arc<dyn ProgressBus>, job_id: &'static str) {
    let mut handles = Vec::new();
    for task in 0..CONCURRENCY_LEVEL {
        let bus = Arc::clone(&bus);
        handles.push(tokio::task::spawn_blocking(move || {
            for i in 0..ITERATIONS_PER_TASK {
                bus.publish(job_id, EventBody::message(format!("{}-{}", task, i)))
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    bus.publish(job_id, EventBody::done(serde_json::Value::Null)).unwrap();
}

fn assert_gapless(bus: &dyn ProgressBus, job_id: &str) {
    let history = bus.history(job_id, 0).unwrap();
    assert_eq!(history.len(), CONCURRENCY_LEVEL * ITERATIONS_PER_TASK + 1);
    for (i, event) in history.iter().enumerate() {
        assert_eq!(event.seq, i as u64);
    }
}

#[tokio::test]
async fn test_memory_bus_concurrent_publish_is_gapless() {
    let bus: Arc<dyn ProgressBus> = Arc::new(MemoryBus::new());
    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), hammer(Arc::clone(&bus), "mem")).await;
    assert!(result.is_ok(), "Test timed out - possible deadlock");
    assert_gapless(bus.as_ref(), "mem");
}

#[tokio::test]
async fn test_file_bus_concurrent_publish_is_gapless() {
    let dir = tempfile::tempdir().unwrap();
    // Two handles on one directory stand in for two processes.
    let first: Arc<dyn ProgressBus> = Arc::new(FileBus::open(dir.path()).unwrap());
    let second: Arc<dyn ProgressBus> = Arc::new(FileBus::open(dir.path()).unwrap());

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        let mut handles = Vec::new();
        for (n, bus) in [first.clone(), second.clone()].into_iter().enumerate() {
            handles.push(tokio::task::spawn_blocking(move || {
                for i in 0..ITERATIONS_PER_TASK {
                    bus.publish("shared", EventBody::message(format!("{}-{}", n, i)))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out - possible deadlock");

    let history = second.history("shared", 0).unwrap();
    assert_eq!(history.len(), 2 * ITERATIONS_PER_TASK);
    for (i, event) in history.iter().enumerate() {
        assert_eq!(event.seq, i as u64);
    }
}

// =============================================================================
// SUBSCRIBE WHILE PUBLISHING
// =============================================================================

#[tokio::test]
async fn test_subscribers_joining_mid_stream_miss_nothing() {
    let bus: Arc<dyn ProgressBus> = Arc::new(MemoryBus::new());
    let publisher = tokio::spawn(hammer(Arc::clone(&bus), "live"));

    let mut readers = Vec::new();
    for _ in 0..CONCURRENCY_LEVEL {
        let bus = Arc::clone(&bus);
        readers.push(tokio::spawn(async move {
            tokio::task::yield_now().await;
            let events: Vec<_> = bus.subscribe("live", 0).unwrap().collect().await;
            events.into_iter().map(|e| e.seq).collect::<Vec<u64>>()
        }));
    }

    let total = (CONCURRENCY_LEVEL * ITERATIONS_PER_TASK + 1) as u64;
    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        publisher.await.unwrap();
        for reader in readers {
            let seqs = reader.await.unwrap();
            assert_eq!(seqs, (0..total).collect::<Vec<_>>());
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out - possible deadlock");
}

// =============================================================================
// STORE CLAIM CONTENTION
// =============================================================================

async fn race_claims(store: Arc<dyn JobStore>) {
    let job = Job::new(JobRequest::Pull {
        model: "llama3".into(),
    });
    let id = job.id.clone();
    store.insert(job).unwrap();

    let mut handles = Vec::new();
    for worker in 0..CONCURRENCY_LEVEL {
        let store = Arc::clone(&store);
        let id = id.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let worker_id = format!("worker-{}", worker);
            store.claim(&id, &worker_id).unwrap().then_some(worker_id)
        }));
    }

    let mut winners = HashSet::new();
    for handle in handles {
        if let Some(winner) = handle.await.unwrap() {
            winners.insert(winner);
        }
    }
    assert_eq!(winners.len(), 1, "exactly one worker may claim a job");
    let claimed_by = store.get(&id).unwrap().unwrap().claimed_by.unwrap();
    assert!(winners.contains(&claimed_by));
}

#[tokio::test]
async fn test_memory_store_single_claim_winner() {
    let result = timeout(
        Duration::from_secs(TEST_TIMEOUT_SECS),
        race_claims(Arc::new(MemoryJobStore::new())),
    )
    .await;
    assert!(result.is_ok(), "Test timed out - possible deadlock");
}

#[tokio::test]
async fn test_file_store_single_claim_winner() {
    let dir = tempfile::tempdir().unwrap();
    let result = timeout(
        Duration::from_secs(TEST_TIMEOUT_SECS),
        race_claims(Arc::new(FileJobStore::open(dir.path()).unwrap())),
    )
    .await;
    assert!(result.is_ok(), "Test timed out - possible deadlock");
}
