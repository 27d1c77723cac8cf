//! Queue: the producer-side API for adding and introspecting jobs.

use crate::config::{ConnectionSpec, QueueOptions};
use crate::error::JobResult;
use crate::events::{Event, EventSink, NullEventSink};
use crate::job::{now_ms, resolve_kind_and_score, Job, JobOptions};
use crate::keys::QueueKeys;
use crate::scripts::Scripts;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// The producer-side handle to one named queue.
///
/// Holds a connection pool and the compiled script catalog; every mutation
/// goes through [`Scripts`], every introspection reads plain Redis commands
/// directly (see the module doc on `scripts.rs` for why those two paths
/// diverge).
pub struct Queue {
    name: String,
    pool: Pool,
    scripts: Scripts,
    default_job_options: JobOptions,
    sink: Arc<dyn EventSink>,
}

impl Queue {
    /// Opens a queue, building a connection pool from `options.connection`
    /// (or a default local connection if none is given).
    pub async fn new(name: impl Into<String>, options: QueueOptions) -> JobResult<Self> {
        let name = name.into();
        let pool = options
            .connection
            .unwrap_or_default()
            .into_pool()
            .await?;
        let scripts = Scripts::new(&options.prefix, &name);
        Ok(Self {
            name,
            pool,
            scripts,
            default_job_options: options.default_job_options,
            sink: Arc::new(NullEventSink),
        })
    }

    /// Builds a queue handle around an already-constructed pool, e.g. one
    /// shared with a worker.
    pub fn with_pool(name: impl Into<String>, prefix: &str, pool: Pool, default_job_options: JobOptions) -> Self {
        let name = name.into();
        let scripts = Scripts::new(prefix, &name);
        Self {
            name,
            pool,
            scripts,
            default_job_options,
            sink: Arc::new(NullEventSink),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> &QueueKeys {
        self.scripts.keys()
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Adds one job, merging `opts` over the queue's default job options.
    #[instrument(skip(self, data, opts), fields(queue = %self.name))]
    pub async fn add(
        &self,
        name: impl Into<String>,
        data: serde_json::Value,
        opts: JobOptions,
    ) -> JobResult<Job> {
        let merged = opts.merged_over(&self.default_job_options);
        let job = Job::new(name, data, merged)?;
        let (kind, score) = resolve_kind_and_score(&job.opts);

        let mut conn = self.pool.get().await?;
        let id = self
            .scripts
            .add_job(&mut *conn, &job, kind, score, now_ms())
            .await?;

        debug!(job_id = %id, kind, "job added");
        let mut job = job;
        job.id = id;
        self.sink.emit(Event::Added {
            job_id: job.id.clone(),
            name: job.name.clone(),
        });
        Ok(job)
    }

    /// Adds every job in `jobs`, reusing one connection in caller order.
    ///
    /// The reference implementation issues one Redis pipeline for the whole
    /// batch; a single atomic script per job already round-trips once each,
    /// so the practical difference is network latency only, not semantics
    /// (see DESIGN.md).
    pub async fn add_bulk(
        &self,
        jobs: Vec<(String, serde_json::Value, JobOptions)>,
    ) -> JobResult<Vec<Job>> {
        let mut conn = self.pool.get().await?;
        let mut results = Vec::with_capacity(jobs.len());
        for (name, data, opts) in jobs {
            let merged = opts.merged_over(&self.default_job_options);
            let mut job = Job::new(name, data, merged)?;
            let (kind, score) = resolve_kind_and_score(&job.opts);
            let id = self
                .scripts
                .add_job(&mut *conn, &job, kind, score, now_ms())
                .await?;
            job.id = id;
            self.sink.emit(Event::Added {
                job_id: job.id.clone(),
                name: job.name.clone(),
            });
            results.push(job);
        }
        Ok(results)
    }

    pub async fn pause(&self) -> JobResult<()> {
        let mut conn = self.pool.get().await?;
        self.scripts.pause(&mut *conn, true).await
    }

    pub async fn resume(&self) -> JobResult<()> {
        let mut conn = self.pool.get().await?;
        self.scripts.pause(&mut *conn, false).await
    }

    pub async fn is_paused(&self) -> JobResult<bool> {
        let mut conn = self.pool.get().await?;
        let paused: bool = conn.hexists(self.keys().meta(), "paused").await?;
        Ok(paused)
    }

    /// Returns counts for each requested logical state, normalizing
    /// `"waiting"` to `"wait"`.
    pub async fn get_job_counts(&self, types: &[String]) -> JobResult<HashMap<String, i64>> {
        let mut conn = self.pool.get().await?;
        let mut counts = HashMap::new();
        for raw in types {
            let state = crate::keys::normalize_state_name(raw);
            let key = self.keys().by_state(state);
            let count: i64 = match state {
                "wait" | "paused" | "active" => conn.llen(&key).await?,
                "delayed" | "prioritized" | "waiting-children" | "completed" | "failed" => {
                    conn.zcard(&key).await?
                }
                _ => conn.llen(&key).await.unwrap_or(0),
            };
            counts.insert(raw.clone(), count);
        }
        Ok(counts)
    }

    /// Returns the count of prioritized jobs at each requested priority.
    pub async fn get_counts_per_priority(&self, priorities: &[i64]) -> JobResult<HashMap<i64, i64>> {
        let mut conn = self.pool.get().await?;
        let key = self.keys().prioritized();
        let mut counts = HashMap::new();
        for &p in priorities {
            let count: i64 = conn.zcount(&key, p, p).await?;
            counts.insert(p, count);
        }
        Ok(counts)
    }

    /// Returns job ids in `[start, end]` for a logical state, in ascending
    /// or descending insertion order. List-backed states are stored
    /// head-pushed/tail-popped, so ascending order reads the list in
    /// reverse of raw storage order to reflect FIFO.
    pub async fn get_ranges(&self, state: &str, start: isize, end: isize, asc: bool) -> JobResult<Vec<String>> {
        let normalized = crate::keys::normalize_state_name(state);
        let key = self.keys().by_state(normalized);
        let mut conn = self.pool.get().await?;

        let mut ids: Vec<String> = match normalized {
            "wait" | "paused" | "active" => conn.lrange(&key, 0, -1).await?,
            _ => conn.zrange(&key, 0, -1).await?,
        };

        if matches!(normalized, "wait" | "paused" | "active") && asc {
            ids.reverse();
        }
        if matches!(normalized, "delayed" | "prioritized" | "completed" | "failed" | "waiting-children") && !asc {
            ids.reverse();
        }

        let len = ids.len() as isize;
        let clamp = |i: isize| -> usize {
            if i < 0 {
                0.max(len + i) as usize
            } else {
                (i as usize).min(ids.len())
            }
        };
        let s = clamp(start);
        let e = (clamp(end) + 1).min(ids.len());
        if s >= e {
            return Ok(Vec::new());
        }
        Ok(ids[s..e].to_vec())
    }

    /// Returns the logical state a job is currently in.
    pub async fn get_job_state(&self, job_id: &str) -> JobResult<String> {
        let mut conn = self.pool.get().await?;
        let k = self.keys();

        for (state, set) in [
            ("completed", k.completed()),
            ("failed", k.failed()),
            ("delayed", k.delayed()),
            ("prioritized", k.prioritized()),
            ("waiting-children", k.waiting_children()),
        ] {
            let score: Option<f64> = conn.zscore(set, job_id).await?;
            if score.is_some() {
                return Ok(state.to_string());
            }
        }

        for (state, list) in [("active", k.active()), ("paused", k.paused()), ("waiting", k.wait())] {
            let pos: Option<usize> = conn.lpos(list, job_id, redis::LposOptions::default()).await?;
            if pos.is_some() {
                return Ok(state.to_string());
            }
        }

        Ok("unknown".into())
    }

    /// Removes up to `limit` finished jobs in `state` older than `grace_ms`.
    pub async fn clean(&self, grace_ms: i64, limit: u32, state: &str) -> JobResult<Vec<String>> {
        let normalized = crate::keys::normalize_state_name(state);
        let cutoff = now_ms() - grace_ms;
        let mut conn = self.pool.get().await?;
        self.scripts.clean_jobs_in_set(&mut *conn, normalized, cutoff, limit).await
    }

    /// Moves up to `count` jobs per batch from `state` back to wait,
    /// optionally restricted to `finishedOn <= timestamp`. Returns the total
    /// number of jobs moved.
    pub async fn retry_jobs(&self, state: &str, count: u32, timestamp: Option<i64>) -> JobResult<i64> {
        self.pump_to_wait(state, count, timestamp).await
    }

    /// Moves every due (or, per spec, all regardless of due time) delayed
    /// job back to wait, in batches of `count`.
    pub async fn promote_jobs(&self, count: u32) -> JobResult<i64> {
        self.pump_to_wait("delayed", count, None).await
    }

    async fn pump_to_wait(&self, state: &str, count: u32, timestamp: Option<i64>) -> JobResult<i64> {
        let mut conn = self.pool.get().await?;
        let mut total = 0i64;
        loop {
            let progress = self
                .scripts
                .move_jobs_to_wait(&mut *conn, state, count, timestamp, now_ms())
                .await?;
            total += progress.processed;
            if progress.processed == 0 || progress.remaining == 0 {
                break;
            }
        }
        Ok(total)
    }

    /// Removes every job from wait/paused (and delayed, if requested),
    /// leaving active/completed/failed and waiting-children untouched.
    pub async fn drain(&self, delayed: bool) -> JobResult<()> {
        let mut conn = self.pool.get().await?;
        let k = self.keys();
        let _: () = conn.del(k.wait()).await?;
        let _: () = conn.del(k.paused()).await?;
        if delayed {
            let _: () = conn.del(k.delayed()).await?;
        }
        Ok(())
    }

    /// Deletes the entire queue's keyspace. Requires the queue to be paused
    /// and (unless `force`) to have no active jobs.
    pub async fn obliterate(&self, force: bool) -> JobResult<()> {
        let mut conn = self.pool.get().await?;
        loop {
            let cursor = self.scripts.obliterate(&mut *conn, 1000, force).await?;
            if cursor == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Appends a log line for `job_id`, trimming to `keep_logs` if positive.
    pub async fn log(&self, job_id: &str, row: &str, keep_logs: i64) -> JobResult<i64> {
        let mut conn = self.pool.get().await?;
        self.scripts.append_log(&mut *conn, job_id, row, keep_logs).await
    }

    /// Lists client names belonging to this queue (`P:Q` or `P:Q:w:*`).
    pub async fn workers(&self) -> JobResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let list: String = redis::cmd("CLIENT")
            .arg("LIST")
            .query_async(&mut *conn)
            .await?;

        let prefix_exact = self.keys().base().to_string();
        let prefix_worker = format!("{}:w:", self.keys().base());

        let mut names = Vec::new();
        for line in list.lines() {
            for field in line.split_whitespace() {
                if let Some(name) = field.strip_prefix("name=") {
                    if name == prefix_exact || name.starts_with(&prefix_worker) {
                        names.push(name.to_string());
                    }
                }
            }
        }
        Ok(names)
    }

    /// Fetches one job's current hash by id.
    pub async fn get_job(&self, job_id: &str) -> JobResult<Option<Job>> {
        let mut conn = self.pool.get().await?;
        let hash: HashMap<String, String> = conn.hgetall(self.keys().job(job_id)).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        Ok(Some(Job::from_hash(job_id, &hash)?))
    }

    /// Permanently removes one job and all of its ancillary keys.
    pub async fn remove(&self, job_id: &str) -> JobResult<()> {
        let mut conn = self.pool.get().await?;
        self.scripts.remove_job(&mut *conn, job_id).await
    }

    /// Connection spec suitable for constructing a [`crate::worker::Worker`]
    /// or [`crate::flow::FlowProducer`] against the same pool.
    pub fn connection_spec(&self) -> ConnectionSpec {
        ConnectionSpec::PreBuilt(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_ranges_clamps_out_of_bounds_indices() {
        // Pure-Rust clamp logic exercised without a live connection: this
        // mirrors the slicing `get_ranges` applies after fetching ids.
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let len = ids.len() as isize;
        let clamp = |i: isize| -> usize {
            if i < 0 {
                0.max(len + i) as usize
            } else {
                (i as usize).min(ids.len())
            }
        };
        assert_eq!(clamp(-1), 2);
        assert_eq!(clamp(10), 3);
        assert_eq!(clamp(0), 0);
    }
}
