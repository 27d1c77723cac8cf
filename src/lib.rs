//! Distributed, Redis-backed job queue.
//!
//! The store is the sole source of truth: every multi-key state transition
//! runs as an atomic server-side script (see `scripts.rs`), so a `Queue`
//! (producer), `Worker` (consumer), and `FlowProducer` (parent/child trees)
//! can all operate against the same keyspace concurrently without a
//! coordinator.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Job lifecycle                          │
//! │                                                                   │
//! │   Queue::add ──► wait ──► active ──► completed / failed           │
//! │                    ▲         │            │                      │
//! │         (retry) ────┘         ▼            ▼                      │
//! │                           stalled      (retry or terminal)        │
//! │                                                                   │
//! │   delayed ──(due)──► wait        prioritized ──(reserved)──► active│
//! │   waiting-children ──(deps resolved)──► wait                      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use arcana_jobs::{Queue, QueueOptions, Worker, WorkerOptions, JobProcessor, JobContext, Job};
//! use async_trait::async_trait;
//!
//! struct SendEmail;
//!
//! #[async_trait]
//! impl JobProcessor for SendEmail {
//!     async fn process(&self, job: &Job, _ctx: &JobContext) -> Result<serde_json::Value, arcana_jobs::JobError> {
//!         println!("sending {:?}", job.data);
//!         Ok(serde_json::json!({"sent": true}))
//!     }
//! }
//!
//! # async fn run() -> Result<(), arcana_jobs::JobError> {
//! let queue = Queue::new("emails", QueueOptions::default()).await?;
//! queue.add("welcome", serde_json::json!({"to": "a@b.com"}), Default::default()).await?;
//!
//! let worker = Worker::new("emails", WorkerOptions::default(), std::sync::Arc::new(SendEmail)).await?;
//! worker.run().await?;
//! # Ok(()) }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod flow;
pub mod job;
pub mod keys;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod scripts;
pub mod worker;

pub use config::{ConnectionSpec, JobsConfig, LimiterOptions, QueueOptions, RedisConfig, WorkerOptions};
pub use error::{JobError, JobResult};
pub use events::{BroadcastEventSink, Event, EventSink, NullEventSink};
pub use flow::{FlowJob, FlowNode, FlowProducer};
pub use job::{
    BackoffOptions, DependencyFailurePolicy, DeduplicationOptions, FailureDecision, Job, JobOptions, KeepJobs,
    ParentRef,
};
pub use metrics::{register_metrics, JobMetrics, RedisMetrics, WorkerMetrics};
pub use queue::Queue;
pub use retry::BackoffStrategy;
pub use worker::{FnProcessor, JobContext, JobProcessor, Worker};

/// Re-export of the traits and types most callers need.
pub mod prelude {
    pub use crate::config::{QueueOptions, WorkerOptions};
    pub use crate::error::{JobError, JobResult};
    pub use crate::events::{Event, EventSink};
    pub use crate::job::{Job, JobOptions};
    pub use crate::queue::Queue;
    pub use crate::worker::{JobContext, JobProcessor, Worker};
}
