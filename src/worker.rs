//! Worker: the cooperative reservation/processing runloop.
//!
//! Single logical task driving reservation, with up to `concurrency`
//! processing units suspended concurrently on the async runtime, governed by
//! a semaphore — this satisfies the ordering contract of the original's
//! single-threaded cooperative loop without requiring native OS threads.

use crate::config::WorkerOptions;
use crate::error::{JobError, JobResult};
use crate::events::{Event, EventSink, NullEventSink};
use crate::job::{now_ms, DependencyFailurePolicy, FailureDecision, Job};
use crate::keys::QueueKeys;
use crate::retry::{self, BackoffStrategy};
use crate::scripts::{MoveToActiveResult, Scripts};
use async_trait::async_trait;
use deadpool_redis::Pool;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// `minimumBlockTimeout`: the shortest blocking pop the store is asked for.
/// 1 ms, since `tokio-comp` supports sub-second block timeouts.
const MINIMUM_BLOCK_TIMEOUT_MS: i64 = 1;
const MAXIMUM_BLOCK_TIMEOUT_MS: i64 = 10_000;

/// Default `stackTraceLimit` when a job doesn't set one.
const DEFAULT_STACK_TRACE_LIMIT: i64 = 10;

/// Per-job handle passed to the user processor: everything it needs to
/// report progress, append a log line, or move itself to waiting-children
/// without reaching into the worker's internals.
#[derive(Clone)]
pub struct JobContext {
    scripts: Arc<Scripts>,
    pool: Pool,
    job_id: String,
    token: String,
}

impl JobContext {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn update_progress(&self, progress: serde_json::Value) -> JobResult<()> {
        let mut conn = self.pool.get().await?;
        self.scripts.update_progress(&mut *conn, &self.job_id, &progress).await
    }

    pub async fn log(&self, row: &str) -> JobResult<i64> {
        let mut conn = self.pool.get().await?;
        self.scripts.append_log(&mut *conn, &self.job_id, row, 0).await
    }

    /// Moves this job to waiting-children. The processor should return
    /// `Err(JobError::WaitingChildren)` immediately afterwards so the
    /// runloop treats the exit as neither a completion nor a failure.
    pub async fn move_to_waiting_children(&self) -> JobResult<()> {
        let mut conn = self.pool.get().await?;
        self.scripts
            .move_to_waiting_children(&mut *conn, &self.job_id, &self.token, now_ms())
            .await
    }
}

/// User-supplied job processing logic for one worker.
///
/// `#[cfg_attr(test, automock)]` gives mock-only verification of the
/// processor callable in tests that don't need a live store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job, ctx: &JobContext) -> Result<serde_json::Value, JobError>;
}

/// Boxed-closure processor, for callers who'd rather not define a struct.
pub type ProcessorFn =
    Box<dyn Fn(Job, JobContext) -> BoxFuture<'static, Result<serde_json::Value, JobError>> + Send + Sync>;

pub struct FnProcessor(pub ProcessorFn);

#[async_trait]
impl JobProcessor for FnProcessor {
    async fn process(&self, job: &Job, ctx: &JobContext) -> Result<serde_json::Value, JobError> {
        (self.0)(job.clone(), ctx.clone()).await
    }
}

struct UntrackGuard {
    worker: Worker,
    job_id: String,
}

impl Drop for UntrackGuard {
    fn drop(&mut self) {
        self.worker.untrack(&self.job_id);
    }
}

/// One worker process's reservation/processing loop for a single queue.
///
/// Cheap to clone: every field is an `Arc` or a pooled handle, so the same
/// logical worker can be handed to spawned tasks (lock-extend timer,
/// stalled-check timer, per-job processing tasks) without extra wrapping.
#[derive(Clone)]
pub struct Worker {
    id: Arc<String>,
    queue_name: Arc<String>,
    pool: Pool,
    scripts: Arc<Scripts>,
    options: Arc<WorkerOptions>,
    processor: Arc<dyn JobProcessor>,
    backoff_strategy: Option<Arc<dyn BackoffStrategy>>,
    sink: Arc<dyn EventSink>,
    in_flight: Arc<Mutex<HashMap<String, String>>>,
    closing: Arc<AtomicBool>,
    force_closing: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    counter: Arc<AtomicU64>,
}

impl Worker {
    pub async fn new(
        queue_name: impl Into<String>,
        options: WorkerOptions,
        processor: Arc<dyn JobProcessor>,
    ) -> JobResult<Self> {
        let queue_name = queue_name.into();
        let pool = options.connection.clone().unwrap_or_default().into_pool().await?;
        Ok(Self::with_pool(queue_name, pool, options, processor))
    }

    /// Builds a worker around an already-constructed pool, e.g. one shared
    /// with a [`crate::queue::Queue`].
    pub fn with_pool(
        queue_name: impl Into<String>,
        pool: Pool,
        options: WorkerOptions,
        processor: Arc<dyn JobProcessor>,
    ) -> Self {
        let queue_name = queue_name.into();
        let scripts = Arc::new(Scripts::new(&options.prefix, &queue_name));
        Self {
            id: Arc::new(format!("{}:{}", queue_name, Uuid::new_v4())),
            queue_name: Arc::new(queue_name),
            pool,
            scripts,
            options: Arc::new(options),
            processor,
            backoff_strategy: None,
            sink: Arc::new(NullEventSink),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            closing: Arc::new(AtomicBool::new(false)),
            force_closing: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_backoff_strategy(mut self, strategy: Arc<dyn BackoffStrategy>) -> Self {
        self.backoff_strategy = Some(strategy);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Worker-local pause: new reservations stop, in-flight executions run
    /// to completion.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.sink.emit(Event::Paused);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.sink.emit(Event::Resumed);
    }

    /// Signals the runloop to stop. With `force`, in-flight processing tasks
    /// are aborted instead of awaited; their jobs are recovered by the next
    /// stalled-check. Returns immediately — await the `run()` future to know
    /// when the worker has actually stopped.
    pub fn close(&self, force: bool) {
        self.closing.store(true, Ordering::SeqCst);
        if force {
            self.force_closing.store(true, Ordering::SeqCst);
        }
    }

    /// Runs the reservation/processing loop until `close()` is called (or an
    /// unrecoverable error occurs). Intended to be spawned and supervised by
    /// the caller, mirroring the reference implementation's `worker.run()`.
    pub async fn run(&self) -> JobResult<()> {
        info!(
            worker_id = %self.id,
            queue = %self.queue_name,
            concurrency = self.options.concurrency,
            "worker starting"
        );

        let lock_extend = tokio::spawn(Self::lock_extend_loop(self.clone()));
        let stalled_check = tokio::spawn(Self::stalled_check_loop(self.clone()));

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut tasks: JoinSet<String> = JoinSet::new();
        let mut block_until = now_ms();
        let mut drained = true;

        let result = loop {
            if self.closing.load(Ordering::SeqCst) && self.force_closing.load(Ordering::SeqCst) {
                tasks.abort_all();
                break Ok(());
            }

            if !self.closing.load(Ordering::SeqCst) && !self.paused.load(Ordering::SeqCst) {
                let mut stop_reserving = false;
                while !stop_reserving {
                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    match self.reserve(&mut block_until, &mut drained).await {
                        Ok(Some((job, token))) => {
                            self.track(&job.id, &token);
                            let worker = self.clone();
                            tasks.spawn(async move {
                                let job_id = worker.process_job(job, token).await;
                                drop(permit);
                                job_id
                            });
                        }
                        Ok(None) => {
                            drop(permit);
                            stop_reserving = true;
                        }
                        Err(err) if err.is_transient_connection_error() => {
                            drop(permit);
                            warn!(error = %err, "reservation failed, retrying after delay");
                            tokio::time::sleep(self.options.run_retry_delay()).await;
                            stop_reserving = true;
                        }
                        Err(err) => {
                            drop(permit);
                            if self.closing.load(Ordering::SeqCst) {
                                stop_reserving = true;
                            } else {
                                break Err(err);
                            }
                        }
                    }
                }
            }

            if tasks.is_empty() {
                if self.closing.load(Ordering::SeqCst) {
                    break Ok(());
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
                continue;
            }

            if let Some(outcome) = tasks.join_next().await {
                if let Err(join_err) = outcome {
                    warn!(error = %join_err, "job processing task panicked");
                }
            }
        };

        lock_extend.abort();
        stalled_check.abort();
        self.sink.emit(Event::Closed);
        info!(worker_id = %self.id, "worker stopped");
        result
    }

    /// `getNextJob`: blocks on the marker when drained, then attempts
    /// `moveToActive`. Returns the reserved job and its token, or `None` if
    /// nothing was available (caller should stop spawning this round).
    async fn reserve(&self, block_until: &mut i64, drained: &mut bool) -> JobResult<Option<(Job, String)>> {
        if *drained {
            let now = now_ms();
            let timeout_ms = clamp_block_timeout_ms(*block_until, now);
            let mut conn = self.pool.get().await?;
            let popped: Option<(String, String, f64)> = conn
                .bzpopmin(self.scripts.keys().marker(), timeout_ms as f64 / 1000.0)
                .await?;
            if let Some((_, _, score)) = popped {
                *block_until = score as i64;
            }
        }

        let token = self.next_token();
        let limiter = self.options.limiter.clone().unwrap_or_default();
        let mut conn = self.pool.get().await?;
        let reservation = self
            .scripts
            .move_to_active(
                &mut *conn,
                &token,
                self.options.lock_duration_ms,
                now_ms(),
                limiter.max,
                limiter.duration_ms,
            )
            .await?;

        match reservation {
            MoveToActiveResult::Reserved(reservation) => {
                *drained = false;
                debug!(job_id = %reservation.job.id, %token, "job reserved");
                Ok(Some((reservation.job, token)))
            }
            MoveToActiveResult::RateLimited { limit_until } => {
                *drained = false;
                let wait_ms = (limit_until - now_ms()).max(0) as u64;
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                Ok(None)
            }
            MoveToActiveResult::Empty { delay_until } => {
                *drained = true;
                *block_until = if delay_until > 0 { delay_until } else { now_ms() };
                Ok(None)
            }
        }
    }

    fn next_token(&self) -> String {
        format!("{}:{}", self.id, self.counter.fetch_add(1, Ordering::Relaxed))
    }

    fn track(&self, job_id: &str, token: &str) {
        self.in_flight.lock().insert(job_id.to_string(), token.to_string());
    }

    fn untrack(&self, job_id: &str) {
        self.in_flight.lock().remove(job_id);
    }

    /// Calls the user processor and routes the outcome to completion,
    /// terminal failure, or a retry/delay, per the failure-decision policy.
    /// Returns the job id for the caller's bookkeeping.
    async fn process_job(self, job: Job, token: String) -> String {
        let job_id = job.id.clone();
        let _guard = UntrackGuard {
            worker: self.clone(),
            job_id: job_id.clone(),
        };
        self.sink.emit(Event::Active { job_id: job_id.clone() });

        let ctx = JobContext {
            scripts: self.scripts.clone(),
            pool: self.pool.clone(),
            job_id: job_id.clone(),
            token: token.clone(),
        };

        match self.processor.process(&job, &ctx).await {
            Ok(returnvalue) => {
                if let Err(err) = self.finalize_success(&job, &token, returnvalue).await {
                    error!(job_id = %job_id, error = %err, "failed to finalize completed job");
                }
            }
            Err(JobError::WaitingChildren) => {
                debug!(job_id = %job_id, "job moved itself to waiting-children");
            }
            Err(err) => {
                if let Err(finalize_err) = self.finalize_failure(&job, &token, err).await {
                    error!(job_id = %job_id, error = %finalize_err, "failed to finalize failed job");
                }
            }
        }

        job_id
    }

    async fn finalize_success(&self, job: &Job, token: &str, returnvalue: serde_json::Value) -> JobResult<()> {
        let keep = job.opts.remove_on_complete.unwrap_or_default();
        let payload = serde_json::to_string(&returnvalue).map_err(JobError::Serialization)?;
        let mut conn = self.pool.get().await?;
        self.scripts
            .move_to_finished(&mut *conn, job, token, "completed", &payload, &keep, now_ms())
            .await?;
        debug!(job_id = %job.id, "job completed");
        self.sink.emit(Event::Completed {
            job_id: job.id.clone(),
            returnvalue,
        });
        Ok(())
    }

    async fn finalize_failure(&self, job: &Job, token: &str, err: JobError) -> JobResult<()> {
        let failed_reason = err.to_string();
        let unrecoverable = matches!(err, JobError::Unrecoverable(_));
        let decision = job.failure_decision(unrecoverable);

        let mut conn = self.pool.get().await?;
        let stacktrace = append_stacktrace(&job.stacktrace, &failed_reason, job.opts.stack_trace_limit);
        self.scripts
            .save_stacktrace(&mut *conn, &job.id, &stacktrace, &failed_reason)
            .await?;

        match decision {
            FailureDecision::Terminal => {
                let keep = job.opts.remove_on_fail.unwrap_or_default();
                self.scripts
                    .move_to_finished(&mut *conn, job, token, "failed", &failed_reason, &keep, now_ms())
                    .await?;
                warn!(job_id = %job.id, reason = %failed_reason, "job failed terminally");
                // `move_to_finished` already failed the immediate parent inline
                // when fpof is set; this continues the cascade to ancestors
                // further up, which may live in other queues.
                if let Err(err) = self.cascade_fail_ancestors(job, &failed_reason).await {
                    error!(job_id = %job.id, error = %err, "failed to cascade fpof to ancestors");
                }
                self.sink.emit(Event::Failed {
                    job_id: job.id.clone(),
                    failed_reason,
                });
            }
            FailureDecision::RetryNow => {
                self.scripts
                    .retry_job(&mut *conn, &job.id, token, job.opts.lifo, job.priority, now_ms())
                    .await?;
                debug!(job_id = %job.id, "job requeued for immediate retry");
            }
            FailureDecision::RetryAfter(raw_delay) => {
                let delay = match &job.opts.backoff {
                    Some(backoff) => retry::calculate(
                        backoff,
                        job.attempts_made + 1,
                        &failed_reason,
                        self.backoff_strategy.as_ref(),
                    )
                    .await
                    .unwrap_or(raw_delay),
                    None => raw_delay,
                };
                self.scripts
                    .move_to_delayed(&mut *conn, &job.id, token, now_ms() + delay, now_ms())
                    .await?;
                debug!(job_id = %job.id, delay, "job scheduled for delayed retry");
            }
        }
        Ok(())
    }

    /// Continues a fail-parent-on-failure cascade past the immediate parent,
    /// which `move_to_finished` already failed inline. Each further ancestor
    /// may live in a different queue and the chain's depth isn't known up
    /// front, so this walks the `parent` pointer one hop at a time, stopping
    /// as soon as an ancestor doesn't also opt into fpof or has none itself.
    async fn cascade_fail_ancestors(&self, job: &Job, failed_reason: &str) -> JobResult<()> {
        let child_fpof = matches!(
            job.opts.dependency_policy,
            Some(DependencyFailurePolicy::FailParentOnFailure)
        );
        let Some(mut ancestor) = job.parent.clone() else {
            return Ok(());
        };
        if !child_fpof {
            return Ok(());
        }

        let mut conn = self.pool.get().await?;
        let mut child_job_key = format!("{}:{}", ancestor.queue, ancestor.id);
        let mut reason = format!("child {} failed: {}", job.id, failed_reason);

        loop {
            let keys = QueueKeys::from_base(ancestor.queue.clone());
            let hash: HashMap<String, String> = conn.hgetall(keys.job(&ancestor.id)).await?;
            if hash.is_empty() {
                break;
            }
            let ancestor_job = match Job::from_hash(&ancestor.id, &hash) {
                Ok(j) => j,
                Err(_) => break,
            };
            let ancestor_fpof = matches!(
                ancestor_job.opts.dependency_policy,
                Some(DependencyFailurePolicy::FailParentOnFailure)
            );
            let Some(grandparent) = ancestor_job.parent.clone() else {
                break;
            };
            if !ancestor_fpof {
                break;
            }

            let grandparent_scripts = Scripts::from_base(grandparent.queue.clone());
            let failed = grandparent_scripts
                .fail_parent(&mut *conn, &child_job_key, &grandparent.id, &reason, now_ms())
                .await?;
            if !failed {
                break;
            }

            reason = format!("child {} failed: {}", ancestor.id, reason);
            child_job_key = format!("{}:{}", grandparent.queue, grandparent.id);
            ancestor = grandparent;
        }

        Ok(())
    }

    async fn lock_extend_loop(worker: Worker) {
        let period = Duration::from_millis((worker.options.lock_duration_ms / 2).max(1) as u64);
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let snapshot: Vec<(String, String)> = {
                let guard = worker.in_flight.lock();
                guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            };
            if snapshot.is_empty() {
                continue;
            }
            let mut conn = match worker.pool.get().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(error = %err, "could not get connection for lock extension");
                    continue;
                }
            };
            for (job_id, token) in snapshot {
                if let Err(err) = worker
                    .scripts
                    .extend_lock(&mut *conn, &job_id, &token, worker.options.lock_duration_ms)
                    .await
                {
                    warn!(job_id = %job_id, error = %err, "failed to extend lock");
                }
            }
        }
    }

    async fn stalled_check_loop(worker: Worker) {
        let mut ticker = tokio::time::interval(worker.options.stalled_interval());
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let mut conn = match worker.pool.get().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(error = %err, "could not get connection for stalled check");
                    continue;
                }
            };
            match worker
                .scripts
                .move_stalled_jobs_to_wait(
                    &mut *conn,
                    worker.options.max_stalled_count,
                    worker.options.stalled_interval_ms,
                    now_ms(),
                )
                .await
            {
                Ok((failed, recovered)) => {
                    for job_id in failed.iter().chain(recovered.iter()) {
                        worker.sink.emit(Event::Stalled { job_id: job_id.clone() });
                    }
                    if !failed.is_empty() {
                        warn!(count = failed.len(), "jobs exceeded max stalled count and were failed");
                    }
                }
                Err(err) => warn!(error = %err, "stalled check failed"),
            }
        }
    }
}

/// Clamps the blocking marker pop's timeout to `[minimum, 10s]`.
fn clamp_block_timeout_ms(block_until: i64, now: i64) -> i64 {
    (block_until - now).max(MINIMUM_BLOCK_TIMEOUT_MS).min(MAXIMUM_BLOCK_TIMEOUT_MS)
}

/// Appends a failure reason to the retained stacktrace, bounded by `limit`
/// (a limit of `0` clears the stacktrace on every failure).
fn append_stacktrace(existing: &[String], reason: &str, limit: Option<i64>) -> Vec<String> {
    let limit = limit.unwrap_or(DEFAULT_STACK_TRACE_LIMIT);
    if limit <= 0 {
        return Vec::new();
    }
    let mut stacktrace = existing.to_vec();
    stacktrace.push(reason.to_string());
    let limit = limit as usize;
    if stacktrace.len() > limit {
        let excess = stacktrace.len() - limit;
        stacktrace.drain(0..excess);
    }
    stacktrace
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_block_timeout_to_bounds() {
        let now = 1_000_000;
        assert_eq!(clamp_block_timeout_ms(now - 500, now), MINIMUM_BLOCK_TIMEOUT_MS);
        assert_eq!(clamp_block_timeout_ms(now + 60_000, now), MAXIMUM_BLOCK_TIMEOUT_MS);
        assert_eq!(clamp_block_timeout_ms(now + 5_000, now), 5_000);
    }

    #[test]
    fn stacktrace_clears_when_limit_is_zero() {
        let existing = vec!["a".to_string(), "b".to_string()];
        let result = append_stacktrace(&existing, "c", Some(0));
        assert!(result.is_empty());
    }

    #[test]
    fn stacktrace_trims_to_limit_keeping_most_recent() {
        let existing = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let result = append_stacktrace(&existing, "d", Some(2));
        assert_eq!(result, vec!["c".to_string(), "d".to_string()]);
    }

    #[test]
    fn stacktrace_uses_default_limit_when_unset() {
        let existing: Vec<String> = (0..12).map(|i| i.to_string()).collect();
        let result = append_stacktrace(&existing, "latest", None);
        assert_eq!(result.len(), DEFAULT_STACK_TRACE_LIMIT as usize);
        assert_eq!(result.last().unwrap(), "latest");
    }

    #[tokio::test]
    async fn mock_processor_reports_completion_payload() {
        let mut mock = MockJobProcessor::new();
        mock.expect_process()
            .times(1)
            .returning(|_job, _ctx| Box::pin(async { Ok(serde_json::json!({"ok": true})) }));

        let job = Job::new("t", serde_json::json!({}), crate::job::JobOptions::default()).unwrap();
        let ctx = JobContext {
            scripts: Arc::new(Scripts::new("bull", "test")),
            pool: unreachable_pool(),
            job_id: "1".into(),
            token: "worker:0".into(),
        };

        // Only the processor call is exercised here; finalization against a
        // live store is covered by the REDIS_TEST_URL-gated integration
        // suite, which this crate keeps separate from mock-only unit tests.
        let result = mock.process(&job, &ctx).await.unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }

    fn unreachable_pool() -> Pool {
        // A pool is required to construct `JobContext`, but this test never
        // calls a method that touches it.
        deadpool_redis::Config::from_url("redis://127.0.0.1:0")
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .expect("pool construction is lazy and does not connect")
    }
}
