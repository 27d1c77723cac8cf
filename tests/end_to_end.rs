//! End-to-end scenarios against a live store.
//!
//! Skipped unless `REDIS_TEST_URL` is set, following this codebase's
//! existing convention of gating live-store tests behind an environment
//! variable so the rest of the suite runs without Redis available.

use arcana_jobs::{
    BackoffOptions, ConnectionSpec, DependencyFailurePolicy, FlowJob, FlowProducer, JobContext, JobError,
    JobOptions, JobProcessor, Queue, QueueOptions, Worker, WorkerOptions,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

fn redis_url() -> Option<String> {
    std::env::var("REDIS_TEST_URL").ok()
}

fn unique_prefix() -> String {
    format!("arcana-jobs-test-{}", Uuid::new_v4())
}

async fn open_queue(prefix: &str, name: &str, url: &str) -> Queue {
    let opts = QueueOptions {
        prefix: prefix.to_string(),
        connection: Some(ConnectionSpec::Url(url.to_string())),
        default_job_options: JobOptions::default(),
    };
    Queue::new(name, opts).await.expect("queue opens")
}

fn worker_opts(prefix: &str, url: &str, concurrency: usize) -> WorkerOptions {
    WorkerOptions {
        prefix: prefix.to_string(),
        connection: Some(ConnectionSpec::Url(url.to_string())),
        concurrency,
        lock_duration_ms: 1000,
        stalled_interval_ms: 1000,
        ..WorkerOptions::default()
    }
}

async fn wait_for_state(queue: &Queue, job_id: &str, state: &str, bound: Duration) -> String {
    let deadline = tokio::time::Instant::now() + bound;
    loop {
        let current = queue.get_job_state(job_id).await.expect("state read");
        if current == state || tokio::time::Instant::now() >= deadline {
            return current;
        }
        sleep(Duration::from_millis(25)).await;
    }
}

struct ReturnsDone;

#[async_trait]
impl JobProcessor for ReturnsDone {
    async fn process(&self, _job: &arcana_jobs::Job, _ctx: &JobContext) -> Result<serde_json::Value, JobError> {
        Ok(serde_json::json!("done"))
    }
}

#[tokio::test]
async fn simple_completion() {
    let Some(url) = redis_url() else { return };
    let prefix = unique_prefix();
    let queue = open_queue(&prefix, "t1", &url).await;

    let job = queue
        .add("t", serde_json::json!({"x": 1}), JobOptions::default())
        .await
        .expect("add succeeds");

    let worker = Worker::new("t1", worker_opts(&prefix, &url, 1), Arc::new(ReturnsDone))
        .await
        .expect("worker builds");
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    let state = wait_for_state(&queue, &job.id, "completed", Duration::from_secs(5)).await;
    assert_eq!(state, "completed");

    let stored = queue.get_job(&job.id).await.unwrap().expect("job persisted");
    assert_eq!(stored.returnvalue, Some(serde_json::json!("done")));
    assert_eq!(stored.attempts_made, 1);
    assert!(stored.finished_on.unwrap() >= stored.processed_on.unwrap());

    worker.close(false);
    let _ = timeout(Duration::from_secs(2), handle).await;
}

struct FailsTwiceThenSucceeds {
    attempts: AtomicU32,
}

#[async_trait]
impl JobProcessor for FailsTwiceThenSucceeds {
    async fn process(&self, _job: &arcana_jobs::Job, _ctx: &JobContext) -> Result<serde_json::Value, JobError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < 2 {
            Err(JobError::ExecutionFailed("transient failure".into()))
        } else {
            Ok(serde_json::json!(null))
        }
    }
}

#[tokio::test]
async fn retry_with_fixed_backoff() {
    let Some(url) = redis_url() else { return };
    let prefix = unique_prefix();
    let queue = open_queue(&prefix, "t2", &url).await;

    let started = tokio::time::Instant::now();
    let job = queue
        .add(
            "t",
            serde_json::json!({}),
            JobOptions {
                attempts: Some(3),
                backoff: Some(BackoffOptions::Fixed { delay: 1000 }),
                ..Default::default()
            },
        )
        .await
        .expect("add succeeds");

    let processor = Arc::new(FailsTwiceThenSucceeds { attempts: AtomicU32::new(0) });
    let worker = Worker::new("t2", worker_opts(&prefix, &url, 1), processor)
        .await
        .expect("worker builds");
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    let state = wait_for_state(&queue, &job.id, "completed", Duration::from_secs(10)).await;
    assert_eq!(state, "completed");
    assert!(started.elapsed() >= Duration::from_millis(2000));

    let stored = queue.get_job(&job.id).await.unwrap().expect("job persisted");
    assert_eq!(stored.attempts_made, 3);

    worker.close(false);
    let _ = timeout(Duration::from_secs(2), handle).await;
}

#[tokio::test]
async fn flow_fail_parent_on_child_failure() {
    let Some(url) = redis_url() else { return };
    let prefix = unique_prefix();
    let pool = ConnectionSpec::Url(url.clone()).into_pool().await.expect("pool builds");
    let producer = FlowProducer::new(pool.clone(), prefix.clone());

    let flow = FlowJob::new("parent", "flow-parent", serde_json::json!({})).with_children(vec![FlowJob::new(
        "child",
        "flow-child",
        serde_json::json!({}),
    )
    .with_opts(JobOptions {
        dependency_policy: Some(DependencyFailurePolicy::FailParentOnFailure),
        ..Default::default()
    })]);

    let node = producer.add(flow).await.expect("flow adds");
    let parent_id = node.job.id.clone();
    let child_id = node.children[0].job.id.clone();

    struct AlwaysFails;
    #[async_trait]
    impl JobProcessor for AlwaysFails {
        async fn process(&self, _job: &arcana_jobs::Job, _ctx: &JobContext) -> Result<serde_json::Value, JobError> {
            Err(JobError::Unrecoverable("child always fails".into()))
        }
    }

    let worker_opts_child = worker_opts(&prefix, &url, 1);
    let worker = Worker::new("flow-child", worker_opts_child, Arc::new(AlwaysFails))
        .await
        .expect("worker builds");
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    let child_queue = open_queue(&prefix, "flow-child", &url).await;
    let parent_queue = open_queue(&prefix, "flow-parent", &url).await;

    let child_state = wait_for_state(&child_queue, &child_id, "failed", Duration::from_secs(5)).await;
    assert_eq!(child_state, "failed");

    let parent_state = wait_for_state(&parent_queue, &parent_id, "failed", Duration::from_secs(5)).await;
    assert_eq!(parent_state, "failed");

    let parent_job = parent_queue.get_job(&parent_id).await.unwrap().expect("parent persisted");
    assert!(parent_job.failed_reason.is_some());
    assert!(parent_job.processed_on.is_none(), "parent must never have entered active");

    worker.close(false);
    let _ = timeout(Duration::from_secs(2), handle).await;
}

/// Holds a job "active" forever once reserved, so the test can simulate a
/// worker host dying mid-processing by aborting its run task and clearing
/// the lock directly, without waiting on a real process to disappear.
struct HangsForever;

#[async_trait]
impl JobProcessor for HangsForever {
    async fn process(&self, _job: &arcana_jobs::Job, _ctx: &JobContext) -> Result<serde_json::Value, JobError> {
        sleep(Duration::from_secs(3600)).await;
        Ok(serde_json::json!(null))
    }
}

#[tokio::test]
async fn stalled_job_is_recovered_by_another_worker() {
    let Some(url) = redis_url() else { return };
    let prefix = unique_prefix();
    let queue = open_queue(&prefix, "t3", &url).await;

    let job = queue
        .add("t", serde_json::json!({}), JobOptions::default())
        .await
        .expect("add succeeds");

    let opts_a = worker_opts(&prefix, &url, 1);
    let worker_a = Worker::new("t3", opts_a, Arc::new(HangsForever))
        .await
        .expect("worker a builds");
    let handle_a = tokio::spawn({
        let worker = worker_a.clone();
        async move { worker.run().await }
    });

    let state = wait_for_state(&queue, &job.id, "active", Duration::from_secs(5)).await;
    assert_eq!(state, "active");

    // Simulate worker A's host dying: stop its reservation/lock-extend loop
    // and clear the lock it was holding, regardless of any in-flight renewal.
    handle_a.abort();
    let _ = timeout(Duration::from_secs(1), handle_a).await;
    {
        let mut conn = queue.pool().get().await.expect("conn");
        let _: () = redis::AsyncCommands::del(&mut *conn, queue.keys().lock(&job.id)).await.unwrap();
    }

    let worker_b = Worker::new("t3", worker_opts(&prefix, &url, 1), Arc::new(ReturnsDone))
        .await
        .expect("worker b builds");
    let handle_b = tokio::spawn({
        let worker = worker_b.clone();
        async move { worker.run().await }
    });

    let state = wait_for_state(&queue, &job.id, "completed", Duration::from_secs(10)).await;
    assert_eq!(state, "completed");

    let stored = queue.get_job(&job.id).await.unwrap().expect("job persisted");
    assert_eq!(stored.attempts_made, 1);

    worker_b.close(false);
    let _ = timeout(Duration::from_secs(2), handle_b).await;
}

#[tokio::test]
async fn deduplication_throttles_then_admits_after_ttl() {
    let Some(url) = redis_url() else { return };
    let prefix = unique_prefix();
    let queue = open_queue(&prefix, "t5", &url).await;

    let dedup = |id: &str| arcana_jobs::DeduplicationOptions {
        id: id.to_string(),
        ttl: Some(1000),
        extend: false,
        replace: false,
    };

    let first = queue
        .add(
            "t",
            serde_json::json!(1),
            JobOptions { deduplication: Some(dedup("k")), ..Default::default() },
        )
        .await
        .expect("first add succeeds");

    let second = queue
        .add(
            "t",
            serde_json::json!(2),
            JobOptions { deduplication: Some(dedup("k")), ..Default::default() },
        )
        .await
        .expect("second add succeeds");

    assert_eq!(first.id, second.id);
    let stored = queue.get_job(&first.id).await.unwrap().expect("job persisted");
    assert_eq!(stored.data, serde_json::json!(1));

    sleep(Duration::from_millis(1100)).await;

    let third = queue
        .add(
            "t",
            serde_json::json!(3),
            JobOptions { deduplication: Some(dedup("k")), ..Default::default() },
        )
        .await
        .expect("third add succeeds");

    assert_ne!(third.id, first.id);
    let stored_third = queue.get_job(&third.id).await.unwrap().expect("job persisted");
    assert_eq!(stored_third.data, serde_json::json!(3));
}

#[tokio::test]
async fn priority_ordering_is_respected() {
    let Some(url) = redis_url() else { return };
    let prefix = unique_prefix();
    let queue = open_queue(&prefix, "t6", &url).await;

    let mut ids = Vec::new();
    for priority in [0_i64, 1, 2, 3] {
        let job = queue
            .add(
                "t",
                serde_json::json!(priority),
                JobOptions { priority: Some(priority), ..Default::default() },
            )
            .await
            .expect("add succeeds");
        ids.push(job.id);
    }

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    struct RecordOrder {
        order: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl JobProcessor for RecordOrder {
        async fn process(&self, job: &arcana_jobs::Job, _ctx: &JobContext) -> Result<serde_json::Value, JobError> {
            self.order.lock().unwrap().push(job.id.clone());
            Ok(serde_json::json!(null))
        }
    }

    let processor = Arc::new(RecordOrder { order: order.clone() });
    let worker = Worker::new("t6", worker_opts(&prefix, &url, 1), processor)
        .await
        .expect("worker builds");
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while order.lock().unwrap().len() < ids.len() && tokio::time::Instant::now() < deadline {
        sleep(Duration::from_millis(25)).await;
    }

    worker.close(false);
    let _ = timeout(Duration::from_secs(2), handle).await;

    assert_eq!(*order.lock().unwrap(), ids);
}
