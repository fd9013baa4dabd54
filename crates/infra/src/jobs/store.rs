//! Job storage boundary.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use queuectl_core::{Decision, DomainError, Job, JobId, JobState, WorkerId};

/// Durable job + config storage.
///
/// Every method is atomic with respect to concurrent callers, including callers
/// in other processes for stores that support it. In particular:
///
/// - `claim_next` never hands the same job to two workers;
/// - `update_if_claimed` only writes when the job is still `processing` under the
///   given worker's claim;
/// - `init` seeds default config without overwriting existing values.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create the storage area if absent and seed `defaults` for missing keys.
    async fn init(&self, defaults: &[(&str, String)]) -> Result<(), JobStoreError>;

    /// Persist a freshly created job.
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Promote due `failed` jobs to `pending`, then reserve the oldest claimable
    /// `pending` job for `worker`.
    ///
    /// Returns the job as it was *before* the claim.
    async fn claim_next(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Apply `decision` to a job currently claimed by `worker`.
    async fn update_if_claimed(
        &self,
        id: JobId,
        worker: &WorkerId,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Jobs in `state` (all jobs when `None`), newest first.
    async fn list_by_state(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError>;

    async fn summary(&self) -> Result<JobSummary, JobStoreError>;

    /// `dead -> pending`.
    async fn requeue_dead(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError>;

    /// Return `processing` jobs locked before `locked_before` to `pending`.
    async fn reclaim_expired(
        &self,
        locked_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    async fn get_config(&self, key: &str) -> Result<Option<String>, JobStoreError>;

    /// Upsert a config value (last write wins).
    async fn set_config(&self, key: &str, value: &str) -> Result<(), JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// The state machine refused the write (wrong state or claim holder).
    #[error(transparent)]
    Rejected(#[from] DomainError),
    /// The store could not be reached or the operation failed inside it.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Persisted data could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl JobStoreError {
    /// Storage-level failure, as opposed to a refusal about a specific job.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, JobStoreError::Unavailable(_) | JobStoreError::Corrupt(_))
    }
}

/// Job counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

impl JobSummary {
    pub fn count(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }

    pub fn add(&mut self, state: JobState, n: u64) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Processing => &mut self.processing,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Dead => &mut self.dead,
        };
        *slot += n;
    }

    pub fn total(&self) -> u64 {
        JobState::ALL.iter().map(|s| self.count(*s)).sum()
    }

    /// `(state, count)` for every state, in lifecycle order.
    pub fn iter(&self) -> impl Iterator<Item = (JobState, u64)> + '_ {
        JobState::ALL.into_iter().map(|s| (s, self.count(s)))
    }
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn init(&self, defaults: &[(&str, String)]) -> Result<(), JobStoreError> {
        (**self).init(defaults).await
    }

    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).insert(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(id).await
    }

    async fn claim_next(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(worker, now).await
    }

    async fn update_if_claimed(
        &self,
        id: JobId,
        worker: &WorkerId,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        (**self).update_if_claimed(id, worker, decision, now).await
    }

    async fn list_by_state(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_state(state).await
    }

    async fn summary(&self) -> Result<JobSummary, JobStoreError> {
        (**self).summary().await
    }

    async fn requeue_dead(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        (**self).requeue_dead(id, now).await
    }

    async fn reclaim_expired(
        &self,
        locked_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).reclaim_expired(locked_before, now).await
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>, JobStoreError> {
        (**self).get_config(key).await
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), JobStoreError> {
        (**self).set_config(key, value).await
    }
}
