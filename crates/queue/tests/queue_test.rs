use async_trait::async_trait;
use courier_core::types::JobPriority;
use courier_queue::{
    BulkOp, BulkOptions, Job, JobOptions, JobProcessor, QueueConfig, QueueEvent, QueueManager,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Records processed payloads in order; fails the first `fail_first` calls.
struct RecordingProcessor {
    seen: Mutex<Vec<Value>>,
    calls: AtomicUsize,
    fail_first: usize,
}

impl RecordingProcessor {
    fn new() -> Arc<Self> {
        Self::failing(0)
    }

    fn failing(fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            fail_first,
        })
    }

    fn seen(&self) -> Vec<Value> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobProcessor for RecordingProcessor {
    async fn process(&self, job: &Job) -> anyhow::Result<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            anyhow::bail!("scripted failure {}", call);
        }
        self.seen.lock().unwrap().push(job.data.clone());
        Ok(json!({"ok": true}))
    }
}

fn fast_config() -> QueueConfig {
    QueueConfig {
        concurrency: 1,
        rate_limit_per_second: 1000,
        retry_delay: Duration::from_millis(10),
        tick: Duration::from_millis(10),
        ..QueueConfig::default()
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<QueueEvent>,
    mut pred: impl FnMut(&QueueEvent) -> bool,
) -> QueueEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for queue event")
}

// High-priority jobs run before earlier normal-priority ones.
#[tokio::test]
async fn test_high_priority_jumps_the_line() {
    let processor = RecordingProcessor::new();
    let manager = QueueManager::new(processor.clone(), fast_config());
    let mut events = manager.subscribe();

    manager.create_queue("mail", 1).await;
    manager.pause("mail").await;

    manager.add_job("mail", json!({"n": 1}), JobOptions::default()).await;
    manager.add_job("mail", json!({"n": 2}), JobOptions::default()).await;
    manager
        .add_job(
            "mail",
            json!({"n": 3}),
            JobOptions { priority: JobPriority::High, ..JobOptions::default() },
        )
        .await;

    manager.resume("mail").await;
    let handle = manager.spawn_processing_loop();

    for _ in 0..3 {
        wait_for(&mut events, |e| matches!(e, QueueEvent::JobCompleted { .. })).await;
    }
    handle.abort();

    let order: Vec<i64> = processor.seen().iter().map(|v| v["n"].as_i64().unwrap()).collect();
    assert_eq!(order, vec![3, 1, 2]);
}

// 1234 items at batch size 500 split into 3 jobs whose batches cover all items.
#[tokio::test]
async fn test_bulk_split_is_deterministic() {
    let processor = RecordingProcessor::new();
    let manager = QueueManager::new(processor.clone(), fast_config());
    let mut events = manager.subscribe();

    let items: Vec<Value> = (0..1234).map(|i| json!(i)).collect();
    let ids = manager
        .add_bulk_job("contacts", BulkOp::AddMembers, items, BulkOptions { batch_size: 500 })
        .await;
    assert_eq!(ids.len(), 3);

    let handle = manager.spawn_processing_loop();
    let completed = wait_for(&mut events, |e| matches!(e, QueueEvent::BulkCompleted { .. })).await;
    handle.abort();

    match completed {
        QueueEvent::BulkCompleted { operation, total_batches, .. } => {
            assert_eq!(operation, BulkOp::AddMembers);
            assert_eq!(total_batches, 3);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let batch_sizes: Vec<usize> = processor
        .seen()
        .iter()
        .map(|v| v.as_array().unwrap().len())
        .collect();
    let mut sorted = batch_sizes.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![234, 500, 500]);
    assert_eq!(batch_sizes.iter().sum::<usize>(), 1234);
}

// Bulk progress events step through (i+1)/total.
#[tokio::test]
async fn test_bulk_progress_reported_per_batch() {
    let processor = RecordingProcessor::new();
    let manager = QueueManager::new(processor, fast_config());
    let mut events = manager.subscribe();

    let items: Vec<Value> = (0..4).map(|i| json!(i)).collect();
    manager
        .add_bulk_job("contacts", BulkOp::AddTags, items, BulkOptions { batch_size: 2 })
        .await;

    let handle = manager.spawn_processing_loop();
    let mut progress = Vec::new();
    while progress.len() < 2 {
        if let QueueEvent::BulkProgress { progress: p, .. } =
            wait_for(&mut events, |e| matches!(e, QueueEvent::BulkProgress { .. })).await
        {
            progress.push(p);
        }
    }
    handle.abort();

    assert_eq!(progress, vec![0.5, 1.0]);
}

// A failing job retries with front-of-queue placement, then succeeds.
#[tokio::test]
async fn test_retry_then_success() {
    let processor = RecordingProcessor::failing(1);
    let manager = QueueManager::new(processor.clone(), fast_config());
    let mut events = manager.subscribe();

    manager.add_job("mail", json!({"n": 1}), JobOptions::default()).await;

    let handle = manager.spawn_processing_loop();
    let retried = wait_for(&mut events, |e| matches!(e, QueueEvent::JobRetried { .. })).await;
    wait_for(&mut events, |e| matches!(e, QueueEvent::JobCompleted { .. })).await;
    handle.abort();

    match retried {
        QueueEvent::JobRetried { retry_count, .. } => assert_eq!(retry_count, 1),
        other => panic!("unexpected event {:?}", other),
    }

    let metrics = manager.metrics().await;
    assert_eq!(metrics.completed_jobs, 1);
    assert_eq!(metrics.retried_jobs, 1);
    assert_eq!(metrics.failed_jobs, 0);
}

// Exhausting max_retries marks the job failed, with no further attempts.
#[tokio::test]
async fn test_exhaustion_is_terminal() {
    let processor = RecordingProcessor::failing(usize::MAX);
    let manager = QueueManager::new(processor.clone(), fast_config());
    let mut events = manager.subscribe();

    manager
        .add_job(
            "mail",
            json!({"n": 1}),
            JobOptions { max_retries: 2, ..JobOptions::default() },
        )
        .await;

    let handle = manager.spawn_processing_loop();
    wait_for(&mut events, |e| matches!(e, QueueEvent::JobExhausted { .. })).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.abort();

    // initial attempt + 2 retries
    assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
    let metrics = manager.metrics().await;
    assert_eq!(metrics.failed_jobs, 1);
    assert!(metrics.completed_jobs + metrics.failed_jobs <= metrics.total_jobs);
}

// A pending job past its timeout is discarded, never executed.
#[tokio::test]
async fn test_expired_job_never_runs() {
    let processor = RecordingProcessor::new();
    let manager = QueueManager::new(processor.clone(), fast_config());
    let mut events = manager.subscribe();

    manager.create_queue("mail", 1).await;
    manager.pause("mail").await;
    manager
        .add_job(
            "mail",
            json!({"n": 1}),
            JobOptions { timeout: Duration::from_millis(20), ..JobOptions::default() },
        )
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.resume("mail").await;

    let handle = manager.spawn_processing_loop();
    wait_for(&mut events, |e| matches!(e, QueueEvent::JobTimedOut { .. })).await;
    handle.abort();

    assert!(processor.seen().is_empty());
    let metrics = manager.metrics().await;
    assert_eq!(metrics.timed_out_jobs, 1);
}

// Delayed jobs stay off the pending list until the delay fires.
#[tokio::test]
async fn test_delayed_job_waits() {
    let processor = RecordingProcessor::new();
    let manager = QueueManager::new(processor.clone(), fast_config());
    let mut events = manager.subscribe();

    manager.create_queue("mail", 1).await;
    manager
        .add_job(
            "mail",
            json!({"n": 1}),
            JobOptions { delay: Duration::from_millis(80), ..JobOptions::default() },
        )
        .await;

    let handle = manager.spawn_processing_loop();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(processor.seen().is_empty(), "job ran before its delay elapsed");

    wait_for(&mut events, |e| matches!(e, QueueEvent::JobCompleted { .. })).await;
    handle.abort();
    assert_eq!(processor.seen().len(), 1);
}

// Paused queues hold jobs; cleared queues drop them.
#[tokio::test]
async fn test_pause_and_clear() {
    let processor = RecordingProcessor::new();
    let manager = QueueManager::new(processor.clone(), fast_config());

    manager.create_queue("mail", 1).await;
    manager.pause("mail").await;
    manager.add_job("mail", json!({"n": 1}), JobOptions::default()).await;
    manager.add_job("mail", json!({"n": 2}), JobOptions::default()).await;

    manager.tick_once().await;
    let status = manager.queue_status("mail").await.unwrap();
    assert!(status.paused);
    assert_eq!(status.pending, 2);

    assert_eq!(manager.clear("mail").await, 2);
    assert_eq!(manager.queue_status("mail").await.unwrap().pending, 0);
    assert!(processor.seen().is_empty());
}

// With no tokens left, dispatch defers and records the stall.
#[tokio::test]
async fn test_rate_limiter_defers_dispatch() {
    let processor = RecordingProcessor::new();
    let config = QueueConfig { rate_limit_per_second: 1, ..fast_config() };
    let manager = QueueManager::new(processor.clone(), config);
    let mut events = manager.subscribe();

    for n in 0..3 {
        manager.add_job("mail", json!({"n": n}), JobOptions::default()).await;
    }

    let handle = manager.spawn_processing_loop();
    for _ in 0..3 {
        wait_for(&mut events, |e| matches!(e, QueueEvent::JobCompleted { .. })).await;
    }
    handle.abort();

    let metrics = manager.metrics().await;
    assert_eq!(metrics.completed_jobs, 3);
    assert!(metrics.rate_limit_hits > 0, "expected at least one deferred dispatch");
}
