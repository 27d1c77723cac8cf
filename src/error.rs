//! Job error types, including the taxonomy of atomic-script return codes.

use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// The negative-integer return codes atomic scripts use to signal a logical
/// failure without raising a Redis-level error. Scripts return a plain
/// integer; [`ScriptError::from_code`] maps it back to a typed variant.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    /// Target job hash missing.
    #[error("job does not exist")]
    JobNotExist,
    /// Lock missing for finalization.
    #[error("job lock does not exist")]
    JobLockNotExist,
    /// Expected source state mismatch.
    #[error("job is not in the expected state")]
    JobNotInState,
    /// Parent cannot move: unresolved children.
    #[error("job has pending dependencies")]
    JobPendingDependencies,
    /// Referenced parent id not found.
    #[error("parent job does not exist")]
    ParentJobNotExist,
    /// Lock owned by a different token.
    #[error("job lock is held by a different token")]
    JobLockMismatch,
    /// Attempt to redefine an existing parent.
    #[error("parent job cannot be replaced")]
    ParentJobCannotBeReplaced,
}

impl ScriptError {
    /// Maps a script's negative return code to a typed error. Returns `None`
    /// for non-negative codes (success) or codes outside the known taxonomy.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(Self::JobNotExist),
            -2 => Some(Self::JobLockNotExist),
            -3 => Some(Self::JobNotInState),
            -4 => Some(Self::JobPendingDependencies),
            -5 => Some(Self::ParentJobNotExist),
            -6 => Some(Self::JobLockMismatch),
            -7 => Some(Self::ParentJobCannotBeReplaced),
            _ => None,
        }
    }
}

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// A script reported a logical failure via a negative return code.
    #[error("script error: {0}")]
    Script(#[from] ScriptError),

    /// Input failed local, synchronous validation before ever reaching the store.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Job `data` contained a non-finite number (NaN/Infinity) and was rejected.
    #[error("invalid job data: {0}")]
    InvalidData(String),

    /// The queue is not paused but an operation required it to be.
    #[error("queue is not paused")]
    NotPaused,

    /// The queue has active jobs but the operation requires none (without `force`).
    #[error("queue has active jobs")]
    ActiveJobsPresent,

    /// Job not found.
    #[error("job not found: {0}")]
    NotFound(String),

    /// The user processor raised `Unrecoverable`, forcing terminal failure.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    /// The user processor signalled it moved the job to waiting-children itself.
    #[error("job is waiting on children")]
    WaitingChildren,

    /// Job execution failed (wraps the user processor's error as a string).
    #[error("job execution failed: {0}")]
    ExecutionFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// msgpack encode/decode error (options wire format).
    #[error("msgpack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    /// msgpack decode error.
    #[error("msgpack decode error: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    /// Redis error.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Worker error.
    #[error("worker error: {0}")]
    Worker(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error that does not fit another variant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// True for errors the worker's reservation loop should retry after a
    /// delay rather than propagate, per the connection-loss retry policy.
    pub fn is_transient_connection_error(&self) -> bool {
        matches!(self, JobError::Redis(_) | JobError::Pool(_))
    }

    /// True for script errors that represent a lock no longer being held by
    /// the caller, i.e. a stale worker trying to finalize.
    pub fn is_lock_mismatch(&self) -> bool {
        matches!(
            self,
            JobError::Script(ScriptError::JobLockMismatch | ScriptError::JobLockNotExist)
        )
    }
}
