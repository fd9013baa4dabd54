//! Domain error model.

use thiserror::Error;

use crate::id::JobId;
use crate::job::JobState;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// These are deterministic failures caused by the caller's input or by the job's
/// current state. They are surfaced immediately and never retried. Storage and
/// execution failures belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. empty command, `max_retries` of zero).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// No job exists with the given id.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// The config key is not one the queue understands.
    #[error("unknown config key: {0}")]
    UnknownConfigKey(String),

    /// The job is not in a state that allows the requested transition.
    #[error("illegal transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },

    /// The job is held by a different worker (or by none).
    #[error("job {job_id} is not claimed by {worker}")]
    NotClaimed { job_id: JobId, worker: String },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_config_key(key: impl Into<String>) -> Self {
        Self::UnknownConfigKey(key.into())
    }
}
