// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end job flows: submit through the queue, run a worker against a
//! simulated model server and hub, and watch the progress bus.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pullbus::bus::{EventBody, MemoryBus, ProgressBus, ProgressEvent};
use pullbus::jobs::{Job, JobQueue, JobRequest, JobState, MemoryJobStore, QueueSettings};
use pullbus::upstream::{HttpSettings, HubClient, OllamaClient, RetryPolicy};
use pullbus::workers::WorkerEnv;

const FOO_DIGEST: &str = "sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae";

// =============================================================================
// Helpers
// =============================================================================

fn worker_env(server: &MockServer) -> WorkerEnv {
    let http = HttpSettings::default().build_client().unwrap();
    WorkerEnv::new(
        OllamaClient::new(server.uri(), http.clone()),
        HubClient::new(server.uri(), format!("{}/api", server.uri()), None, http),
    )
    .with_retry(RetryPolicy {
        max_attempts: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
    })
    .with_eject_bounds(Duration::from_millis(20), Duration::from_millis(300))
}

fn started_queue(server: &MockServer) -> JobQueue {
    let queue = JobQueue::new(
        Arc::new(MemoryJobStore::new()),
        Arc::new(MemoryBus::new()),
        QueueSettings {
            tick: Duration::from_millis(20),
            ..QueueSettings::default()
        },
    );
    queue.start(worker_env(server));
    queue
}

/// Every event from `from` until the stream ends.
async fn collect(queue: &JobQueue, job_id: &str, from: u64) -> Vec<ProgressEvent> {
    let stream = queue.bus().subscribe(job_id, from).unwrap();
    tokio::time::timeout(Duration::from_secs(10), stream.collect::<Vec<_>>())
        .await
        .expect("job stream never ended")
}

/// Job record once the store shows a terminal state.
async fn settled(queue: &JobQueue, job_id: &str) -> Job {
    for _ in 0..500 {
        let job = queue.get(job_id).unwrap().unwrap();
        if job.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {} never settled", job_id);
}

fn assert_gapless_single_terminal(events: &[ProgressEvent], from: u64) {
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, from + i as u64, "gap or duplicate at {}", i);
    }
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(events.last().unwrap().is_terminal());
}

fn progress(events: &[ProgressEvent]) -> Vec<(String, u64, Option<u64>)> {
    events
        .iter()
        .filter_map(|e| match &e.body {
            EventBody::Progress(p) => Some((p.phase.clone(), p.bytes_completed, p.bytes_total)),
            _ => None,
        })
        .collect()
}

fn warnings(events: &[ProgressEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match &e.body {
            EventBody::Status(s) => s.warning.clone(),
            _ => None,
        })
        .collect()
}

async fn mount_pull_feed(server: &MockServer, body: &str) {
    Mock::given(method("POST"))
        .and(path("/api/pull"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
        .mount(server)
        .await;
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_pull_reports_progress_then_done() {
    let server = MockServer::start().await;
    mount_pull_feed(
        &server,
        "{\"status\":\"pulling\",\"total\":100,\"completed\":30}\n{\"status\":\"success\"}\n",
    )
    .await;
    let queue = started_queue(&server);

    let job = queue
        .submit(JobRequest::Pull {
            model: "llama3.2".into(),
        })
        .unwrap();
    let events = collect(&queue, &job.id, 0).await;

    assert_gapless_single_terminal(&events, 0);
    assert_eq!(events[0].body, EventBody::state(JobState::Queued));
    let progress = progress(&events);
    assert_eq!(progress.len(), 2);
    assert!(progress[1].1 >= progress[0].1);
    assert!(matches!(events.last().unwrap().body, EventBody::Done(_)));

    let record = settled(&queue, &job.id).await;
    assert_eq!(record.state, JobState::Succeeded);
    assert_eq!(record.result.as_ref().unwrap()["status"], "success");
}

#[tokio::test]
async fn test_gguf_upload_without_path_still_creates_model() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/models/owner/repo/tree/main"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"type": "file", "path": "m.gguf", "size": 3}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/owner/repo/resolve/main/m.gguf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"foo".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/api/blobs/{}", FOO_DIGEST)))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/api/blobs/{}", FOO_DIGEST)))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/create"))
        .and(body_partial_json(json!({"model": "m", "modelfile": "FROM m.gguf\n"})))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"status\":\"success\"}\n"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let queue = started_queue(&server);
    let job = queue
        .submit(JobRequest::GgufDownload {
            repo_id: "owner/repo".into(),
            filename: "m.gguf".into(),
            output_dir: Some(dir.path().to_string_lossy().into_owned()),
            create_model: true,
            model_name: None,
        })
        .unwrap();
    let events = collect(&queue, &job.id, 0).await;

    assert_gapless_single_terminal(&events, 0);
    assert!(matches!(events.last().unwrap().body, EventBody::Done(_)));
    assert_eq!(warnings(&events).len(), 1);

    let record = settled(&queue, &job.id).await;
    assert_eq!(record.state, JobState::Succeeded);
    assert_eq!(record.warnings.len(), 1);
    let result = record.result.unwrap();
    assert_eq!(result["model_created"], true);
    assert_eq!(result["blob"]["created_from"], "m.gguf");
    assert!(dir.path().join("m.gguf").exists());
}

#[tokio::test]
async fn test_update_check_already_current_transfers_nothing() {
    let server = MockServer::start().await;
    mount_pull_feed(
        &server,
        "{\"status\":\"already up to date\"}\n{\"status\":\"pulling\",\"total\":500,\"completed\":100}\n",
    )
    .await;
    let queue = started_queue(&server);

    let job = queue
        .submit(JobRequest::UpdateCheck {
            model: "llama3.2".into(),
        })
        .unwrap();
    let events = collect(&queue, &job.id, 0).await;

    assert_gapless_single_terminal(&events, 0);
    assert!(progress(&events).is_empty());
    match &events.last().unwrap().body {
        EventBody::Done(done) => {
            assert_eq!(done.result["status"], "up_to_date");
            assert_eq!(done.result["update_available"], false);
            assert_eq!(done.result["bytes_transferred"], 0);
        }
        other => panic!("expected done, got {:?}", other),
    }
}

#[tokio::test]
async fn test_eject_of_model_that_never_leaves_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"done": true})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/ps"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{"name": "llama3:latest", "model": "llama3:latest"}]
        })))
        .mount(&server)
        .await;
    let queue = started_queue(&server);

    let job = queue
        .submit(JobRequest::EjectForce {
            model: Some("llama3".into()),
        })
        .unwrap();
    let events = collect(&queue, &job.id, 0).await;

    assert_gapless_single_terminal(&events, 0);
    match &events.last().unwrap().body {
        EventBody::Error(err) => assert_eq!(err.cause, "timeout"),
        other => panic!("expected error, got {:?}", other),
    }
    let record = settled(&queue, &job.id).await;
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.result.unwrap()["cause"], "timeout");
}

// =============================================================================
// Bus properties
// =============================================================================

#[tokio::test]
async fn test_late_subscriber_replays_from_cursor() {
    let server = MockServer::start().await;
    mount_pull_feed(
        &server,
        "{\"status\":\"pulling\",\"total\":100,\"completed\":10}\n\
         {\"status\":\"pulling\",\"total\":100,\"completed\":60}\n\
         {\"status\":\"success\"}\n",
    )
    .await;
    let queue = started_queue(&server);

    let job = queue
        .submit(JobRequest::Pull {
            model: "llama3.2".into(),
        })
        .unwrap();
    let everything = collect(&queue, &job.id, 0).await;
    settled(&queue, &job.id).await;

    // Within the grace window a late subscriber still gets the tail.
    let tail = collect(&queue, &job.id, 3).await;
    assert_gapless_single_terminal(&tail, 3);
    assert_eq!(tail, everything[3..].to_vec());
}

#[tokio::test]
async fn test_concurrent_subscribers_see_the_same_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/pull"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("{\"status\":\"pulling\",\"total\":4,\"completed\":2}\n{\"status\":\"success\"}\n")
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;
    let queue = started_queue(&server);

    let job = queue
        .submit(JobRequest::Pull {
            model: "llama3.2".into(),
        })
        .unwrap();
    let (a, b) = tokio::join!(collect(&queue, &job.id, 0), collect(&queue, &job.id, 0));
    assert_gapless_single_terminal(&a, 0);
    assert_eq!(a, b);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancel_running_pull_ends_cancelled_and_publishes_nothing_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/pull"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("{\"status\":\"success\"}\n")
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;
    let queue = started_queue(&server);

    let job = queue
        .submit(JobRequest::Pull {
            model: "llama3.2".into(),
        })
        .unwrap();
    for _ in 0..200 {
        if queue.get(&job.id).unwrap().unwrap().state == JobState::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    queue.cancel(&job.id).unwrap();

    let events = collect(&queue, &job.id, 0).await;
    assert_gapless_single_terminal(&events, 0);
    match &events.last().unwrap().body {
        EventBody::Error(err) => assert_eq!(err.cause, "cancelled"),
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(settled(&queue, &job.id).await.state, JobState::Cancelled);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.bus().history(&job.id, 0).unwrap(), events);
}

// =============================================================================
// Polling and SSE
// =============================================================================

#[tokio::test]
async fn test_polling_and_sse_agree_on_the_result() {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    let server = MockServer::start().await;
    mount_pull_feed(
        &server,
        "{\"status\":\"pulling\",\"total\":100,\"completed\":50}\n{\"status\":\"success\"}\n",
    )
    .await;
    let queue = started_queue(&server);
    let ollama = OllamaClient::new(server.uri(), HttpSettings::default().build_client().unwrap());
    let router = pullbus::server::Server::new(0, queue.clone(), ollama).build_router();

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/jobs")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"kind": "pull", "model": "llama3.2"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let accepted: Value =
        serde_json::from_slice(&axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap()).unwrap();
    let job_id = accepted["job_id"].as_str().unwrap().to_string();

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/stream/progress?job_id={}", job_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = tokio::time::timeout(
        Duration::from_secs(10),
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .unwrap()
    .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    let done_data = text
        .split("\n\n")
        .find(|record| record.contains("event: done"))
        .and_then(|record| record.lines().find_map(|l| l.strip_prefix("data: ")))
        .expect("no done record");
    let done: Value = serde_json::from_str(done_data).unwrap();

    let record = settled(&queue, &job_id).await;
    let response = router
        .oneshot(
            Request::builder()
                .uri(format!("/api/jobs/{}", job_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let polled: Value =
        serde_json::from_slice(&axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap()).unwrap();

    assert_eq!(polled["state"], "succeeded");
    assert_eq!(polled["result"], done["result"]);
    assert_eq!(Some(&done["result"]), record.result.as_ref());
}
