//! `queuectl-core`: job lifecycle domain.
//!
//! This crate contains the **pure domain** of the queue: identifiers, the job
//! state machine, the retry/backoff policy and the known configuration keys. It
//! performs no I/O; stores, runners and workers live in `queuectl-infra`.

pub mod clock;
pub mod config;
pub mod error;
pub mod id;
pub mod job;
pub mod retry;

pub use config::{ConfigKey, QueueSettings};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, WorkerId};
pub use job::{Job, JobState, MAX_RETRIES_REACHED};
pub use retry::{Decision, Outcome, RetryPolicy};
