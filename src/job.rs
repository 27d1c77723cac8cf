//! Job entity, options, and the codec to/from the store's hash representation.

use crate::error::{JobError, JobResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Policy for `removeOnComplete` / `removeOnFail`.
///
/// The wire encoding on the store remains the short-key form the scripts
/// expect; this sum type only exists on the in-process side to replace the
/// original's dynamic dispatch over a dict-shaped option.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeepJobs {
    Bool(bool),
    Count(i64),
    AgeAndCount { age: i64, count: i64 },
}

impl Default for KeepJobs {
    fn default() -> Self {
        KeepJobs::Bool(false)
    }
}

impl KeepJobs {
    /// True if every finished job should be kept unconditionally.
    pub fn keep_all(&self) -> bool {
        matches!(self, KeepJobs::Bool(true))
    }

    /// True if every finished job should be removed unconditionally.
    pub fn remove_all(&self) -> bool {
        matches!(self, KeepJobs::Bool(false))
    }

    /// The count bound, if any (`None` means unbounded).
    pub fn count(&self) -> Option<i64> {
        match self {
            KeepJobs::Count(c) => Some(*c),
            KeepJobs::AgeAndCount { count, .. } => Some(*count),
            _ => None,
        }
    }

    /// The age bound in seconds, if any.
    pub fn age(&self) -> Option<i64> {
        match self {
            KeepJobs::AgeAndCount { age, .. } => Some(*age),
            _ => None,
        }
    }
}

/// Backoff strategy selection, normalized from either a bare integer delay or
/// an explicit `{type, delay}` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffOptions {
    Fixed { delay: i64 },
    Exponential { delay: i64 },
    Custom { name: String, delay: i64 },
}

impl BackoffOptions {
    /// Normalizes a bare millisecond integer into a fixed backoff, per spec §6.
    pub fn normalize(raw: i64) -> Self {
        BackoffOptions::Fixed { delay: raw }
    }

    pub fn delay(&self) -> i64 {
        match self {
            BackoffOptions::Fixed { delay }
            | BackoffOptions::Exponential { delay }
            | BackoffOptions::Custom { delay, .. } => *delay,
        }
    }
}

/// `{id, ttl?, extend?, replace?}` deduplication options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeduplicationOptions {
    pub id: String,
    pub ttl: Option<i64>,
    #[serde(default)]
    pub extend: bool,
    #[serde(default)]
    pub replace: bool,
}

/// `{id, queue}` pointer to a parent job's qualified key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentRef {
    pub id: String,
    pub queue: String,
}

/// The four mutually exclusive dependency-failure policies a child may set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyFailurePolicy {
    /// `fpof`: recursively fail every ancestor that also opts in.
    FailParentOnFailure,
    /// `cpof`: leave siblings and the parent running.
    ContinueParentOnFailure,
    /// `idof`: remove the dependency without failing the parent.
    IgnoreDependencyOnFailure,
    /// `rdof`: remove the child from `dependencies` but keep its record.
    RemoveDependencyOnFailure,
}

/// Typed job options, replacing the original's string-keyed option maps.
///
/// `fpof`/`cpof`/`idof`/`rdof`/`kl`/`de` are the short keys these fields are
/// encoded under on the wire (see §3), preserved for wire compatibility.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    pub job_id: Option<String>,
    pub timestamp: Option<i64>,
    pub delay: Option<i64>,
    pub priority: Option<i64>,
    pub attempts: Option<u32>,
    pub backoff: Option<BackoffOptions>,
    #[serde(default)]
    pub lifo: bool,
    pub remove_on_complete: Option<KeepJobs>,
    pub remove_on_fail: Option<KeepJobs>,
    /// `kl`
    pub keep_logs: Option<i64>,
    pub stack_trace_limit: Option<i64>,
    pub parent: Option<ParentRef>,
    pub dependency_policy: Option<DependencyFailurePolicy>,
    /// `de`
    pub deduplication: Option<DeduplicationOptions>,
}

impl JobOptions {
    /// Merges caller-supplied options over a queue's `defaultJobOptions`,
    /// caller opts winning field-by-field.
    pub fn merged_over(mut self, defaults: &JobOptions) -> Self {
        macro_rules! fill {
            ($field:ident) => {
                if self.$field.is_none() {
                    self.$field = defaults.$field.clone();
                }
            };
        }
        fill!(job_id);
        fill!(timestamp);
        fill!(delay);
        fill!(priority);
        fill!(attempts);
        fill!(backoff);
        fill!(remove_on_complete);
        fill!(remove_on_fail);
        fill!(keep_logs);
        fill!(stack_trace_limit);
        fill!(parent);
        fill!(dependency_policy);
        fill!(deduplication);
        if !self.lifo {
            self.lifo = defaults.lifo;
        }
        self
    }

    /// Returns the short-key map used on the wire, matching `optsDecodeMap`
    /// in the original implementation extended to all four dependency flags.
    pub fn to_short_keys(&self) -> HashMap<&'static str, serde_json::Value> {
        let mut map = HashMap::new();
        if let Some(n) = self.keep_logs {
            map.insert("kl", serde_json::json!(n));
        }
        if let Some(policy) = self.dependency_policy {
            let key = match policy {
                DependencyFailurePolicy::FailParentOnFailure => "fpof",
                DependencyFailurePolicy::ContinueParentOnFailure => "cpof",
                DependencyFailurePolicy::IgnoreDependencyOnFailure => "idof",
                DependencyFailurePolicy::RemoveDependencyOnFailure => "rdof",
            };
            map.insert(key, serde_json::json!(true));
        }
        if let Some(dedup) = &self.deduplication {
            map.insert("de", serde_json::json!(dedup));
        }
        map
    }
}

/// The in-memory projection of a stored job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    /// Opaque, JSON-encoded payload.
    pub data: serde_json::Value,
    pub opts: JobOptions,
    pub timestamp: i64,
    pub delay: i64,
    pub attempts: u32,
    pub attempts_made: u32,
    pub attempts_started: u32,
    pub stalled_counter: u32,
    pub priority: i64,
    pub processed_on: Option<i64>,
    pub finished_on: Option<i64>,
    pub returnvalue: Option<serde_json::Value>,
    pub failed_reason: Option<String>,
    pub stacktrace: Vec<String>,
    pub deferred_failure: Option<String>,
    pub repeat_job_key: Option<String>,
    pub parent_key: Option<String>,
    pub parent: Option<ParentRef>,
    pub deduplication_id: Option<String>,
}

impl Job {
    /// Constructs a new job about to be added, with an unassigned id.
    pub fn new(name: impl Into<String>, data: serde_json::Value, opts: JobOptions) -> JobResult<Self> {
        reject_non_finite(&data)?;

        let timestamp = opts.timestamp.unwrap_or_else(now_ms);
        let delay = opts.delay.unwrap_or(0);
        let priority = opts.priority.unwrap_or(0);
        let attempts = opts.attempts.unwrap_or(1);
        let deduplication_id = opts.deduplication.as_ref().map(|d| d.id.clone());
        let (parent_key, parent) = match &opts.parent {
            Some(p) => (Some(format!("{}:{}", p.queue, p.id)), Some(p.clone())),
            None => (None, None),
        };

        Ok(Self {
            id: opts.job_id.clone().unwrap_or_default(),
            name: name.into(),
            data,
            opts,
            timestamp,
            delay,
            attempts,
            attempts_made: 0,
            attempts_started: 0,
            stalled_counter: 0,
            priority,
            processed_on: None,
            finished_on: None,
            returnvalue: None,
            failed_reason: None,
            stacktrace: Vec::new(),
            deferred_failure: None,
            repeat_job_key: None,
            parent_key,
            parent,
            deduplication_id,
        })
    }

    /// Serializes to the flat string/string map stored as a Redis hash.
    pub fn to_hash_fields(&self) -> JobResult<Vec<(String, String)>> {
        let mut fields = vec![
            ("name".into(), self.name.clone()),
            ("data".into(), serde_json::to_string(&self.data)?),
            ("timestamp".into(), self.timestamp.to_string()),
            ("delay".into(), self.delay.to_string()),
            ("attempts".into(), self.attempts.to_string()),
            ("attemptsMade".into(), self.attempts_made.to_string()),
            ("attemptsStarted".into(), self.attempts_started.to_string()),
            ("stalledCounter".into(), self.stalled_counter.to_string()),
            ("priority".into(), self.priority.to_string()),
            ("stacktrace".into(), serde_json::to_string(&self.stacktrace)?),
        ];

        let opts_json = serde_json::to_value(&self.opts)?;
        fields.push(("opts".into(), serde_json::to_string(&opts_json)?));

        if let Some(v) = self.processed_on {
            fields.push(("processedOn".into(), v.to_string()));
        }
        if let Some(v) = self.finished_on {
            fields.push(("finishedOn".into(), v.to_string()));
        }
        if let Some(v) = &self.returnvalue {
            fields.push(("returnvalue".into(), serde_json::to_string(v)?));
        }
        if let Some(v) = &self.failed_reason {
            fields.push(("failedReason".into(), v.clone()));
        }
        if let Some(v) = &self.repeat_job_key {
            fields.push(("rjk".into(), v.clone()));
        }
        if let Some(v) = &self.parent_key {
            fields.push(("parentKey".into(), v.clone()));
        }
        if let Some(v) = &self.parent {
            fields.push(("parent".into(), serde_json::to_string(v)?));
        }
        if let Some(v) = &self.deduplication_id {
            fields.push(("deid".into(), v.clone()));
        }

        Ok(fields)
    }

    /// Parses a job back out of its stored hash representation, mirroring
    /// `Job.fromJSON` in the original implementation.
    pub fn from_hash(id: &str, hash: &HashMap<String, String>) -> JobResult<Self> {
        if hash.is_empty() {
            return Err(JobError::NotFound(id.to_string()));
        }

        let get = |k: &str| hash.get(k).cloned();
        let get_i64 = |k: &str| -> i64 { hash.get(k).and_then(|v| v.parse().ok()).unwrap_or(0) };
        let get_u32 = |k: &str| -> u32 { hash.get(k).and_then(|v| v.parse().ok()).unwrap_or(0) };

        let opts: JobOptions = match get("opts") {
            Some(raw) => serde_json::from_str(&raw)?,
            None => JobOptions::default(),
        };

        let data = match get("data") {
            Some(raw) => serde_json::from_str(&raw)?,
            None => serde_json::Value::Null,
        };

        let stacktrace = match get("stacktrace") {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => Vec::new(),
        };

        let parent = match get("parent") {
            Some(raw) => serde_json::from_str(&raw).ok(),
            None => None,
        };

        Ok(Self {
            id: id.to_string(),
            name: get("name").unwrap_or_default(),
            data,
            opts,
            timestamp: get_i64("timestamp"),
            delay: get_i64("delay"),
            attempts: get_u32("attempts").max(1),
            attempts_made: get_u32("attemptsMade"),
            attempts_started: get_u32("attemptsStarted"),
            stalled_counter: get_u32("stalledCounter"),
            priority: get_i64("priority"),
            processed_on: hash.get("processedOn").and_then(|v| v.parse().ok()),
            finished_on: hash.get("finishedOn").and_then(|v| v.parse().ok()),
            returnvalue: get("returnvalue").and_then(|raw| serde_json::from_str(&raw).ok()),
            failed_reason: get("failedReason"),
            stacktrace,
            deferred_failure: get("deferredFailure"),
            repeat_job_key: get("rjk"),
            parent_key: get("parentKey"),
            parent,
            deduplication_id: get("deid"),
        })
    }

    /// Whether this job should be retried with a delay, immediately, or fail
    /// terminally, given the error it just raised. Does not mutate state;
    /// callers apply the resulting decision via the appropriate script.
    pub fn failure_decision(&self, unrecoverable: bool) -> FailureDecision {
        if unrecoverable || self.attempts_made + 1 >= self.attempts {
            return FailureDecision::Terminal;
        }
        match &self.opts.backoff {
            None => FailureDecision::RetryNow,
            Some(backoff) => {
                let delay = backoff.delay();
                if delay < 0 {
                    FailureDecision::Terminal
                } else if delay == 0 {
                    FailureDecision::RetryNow
                } else {
                    FailureDecision::RetryAfter(delay)
                }
            }
        }
    }
}

/// The outcome of consulting the backoff/retry policy after a processor error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    Terminal,
    RetryNow,
    RetryAfter(i64),
}

fn reject_non_finite(value: &serde_json::Value) -> JobResult<()> {
    match value {
        serde_json::Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return Err(JobError::InvalidData(
                        "job data contains a non-finite number".into(),
                    ));
                }
            }
            Ok(())
        }
        serde_json::Value::Array(items) => {
            for item in items {
                reject_non_finite(item)?;
            }
            Ok(())
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                reject_non_finite(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Which atomic add script a job's options route it through, and the score
/// its destination sorted set (if any) should use: `deliverAt` for delayed
/// jobs, `priority` for prioritized ones.
pub fn resolve_kind_and_score(opts: &JobOptions) -> (&'static str, i64) {
    if opts.delay.unwrap_or(0) > 0 {
        ("delayed", now_ms() + opts.delay.unwrap_or(0))
    } else if opts.priority.unwrap_or(0) > 0 {
        ("prioritized", opts.priority.unwrap_or(0))
    } else {
        ("standard", 0)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Job({}:{})", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_finite_data() {
        let data = serde_json::json!({ "x": f64::NAN });
        let err = Job::new("t", data, JobOptions::default()).unwrap_err();
        assert!(matches!(err, JobError::InvalidData(_)));
    }

    #[test]
    fn round_trips_through_hash() {
        let job = Job::new("t", serde_json::json!({"x": 1}), JobOptions::default()).unwrap();
        let fields = job.to_hash_fields().unwrap();
        let hash: HashMap<String, String> = fields.into_iter().collect();
        let restored = Job::from_hash("1", &hash).unwrap();
        assert_eq!(restored.name, "t");
        assert_eq!(restored.data, serde_json::json!({"x": 1}));
    }

    #[test]
    fn normalizes_integer_backoff_to_fixed() {
        let backoff = BackoffOptions::normalize(500);
        assert_eq!(backoff, BackoffOptions::Fixed { delay: 500 });
    }

    #[test]
    fn failure_decision_respects_attempts_and_backoff() {
        let mut job = Job::new("t", serde_json::json!(null), JobOptions {
            attempts: Some(1),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(job.failure_decision(false), FailureDecision::Terminal);

        job.attempts = 3;
        job.opts.backoff = Some(BackoffOptions::Fixed { delay: 1000 });
        assert_eq!(job.failure_decision(false), FailureDecision::RetryAfter(1000));

        job.opts.backoff = Some(BackoffOptions::Fixed { delay: 0 });
        assert_eq!(job.failure_decision(false), FailureDecision::RetryNow);

        assert_eq!(job.failure_decision(true), FailureDecision::Terminal);
    }

    #[test]
    fn resolve_kind_prefers_delay_over_priority() {
        let opts = JobOptions {
            delay: Some(5000),
            priority: Some(3),
            ..Default::default()
        };
        let (kind, score) = resolve_kind_and_score(&opts);
        assert_eq!(kind, "delayed");
        assert!(score > now_ms());
    }

    #[test]
    fn resolve_kind_falls_back_to_priority_then_standard() {
        let prioritized = JobOptions {
            priority: Some(7),
            ..Default::default()
        };
        assert_eq!(resolve_kind_and_score(&prioritized), ("prioritized", 7));
        assert_eq!(resolve_kind_and_score(&JobOptions::default()), ("standard", 0));
    }

    #[test]
    fn merges_defaults_with_caller_winning() {
        let defaults = JobOptions {
            attempts: Some(5),
            lifo: true,
            ..Default::default()
        };
        let caller = JobOptions {
            attempts: Some(2),
            ..Default::default()
        };
        let merged = caller.merged_over(&defaults);
        assert_eq!(merged.attempts, Some(2));
        assert!(merged.lifo);
    }
}
