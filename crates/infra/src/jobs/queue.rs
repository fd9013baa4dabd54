//! `JobQueue`: the operations exposed to workers and operators.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use queuectl_core::config::WORKER_STOP_KEY;
use queuectl_core::{
    clock, ConfigKey, DomainError, Job, JobId, JobState, Outcome, QueueSettings, WorkerId,
};

use super::store::{JobStore, JobStoreError, JobSummary};

/// Error returned by [`JobQueue`] operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// Caller input or job state made the operation impossible. Never retried.
    #[error(transparent)]
    Validation(#[from] DomainError),
    /// The store failed; the operation may succeed later.
    #[error(transparent)]
    Store(JobStoreError),
}

impl QueueError {
    pub fn is_validation(&self) -> bool {
        matches!(self, QueueError::Validation(_))
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, QueueError::Store(e) if e.is_unavailable())
    }
}

impl From<JobStoreError> for QueueError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => QueueError::Validation(DomainError::JobNotFound(id)),
            JobStoreError::Rejected(domain) => QueueError::Validation(domain),
            other => QueueError::Store(other),
        }
    }
}

/// Persistent job queue over an injected [`JobStore`].
///
/// Queue settings (`max_retries`, `backoff_base`) are read from the store on every
/// use, so `config set` takes effect for running workers.
#[derive(Debug, Clone)]
pub struct JobQueue<S> {
    store: S,
}

impl<S: JobStore> JobQueue<S> {
    /// Initialize the store (schema + default config) and wrap it.
    pub async fn open(store: S) -> Result<Self, QueueError> {
        let defaults: Vec<_> = ConfigKey::defaults().collect();
        store.init(&defaults).await?;
        Ok(Self { store })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Effective settings. Missing or unparsable stored values fall back to the
    /// defaults.
    pub async fn settings(&self) -> Result<QueueSettings, QueueError> {
        let mut settings = QueueSettings::default();
        for key in ConfigKey::ALL {
            let Some(raw) = self.store.get_config(key.as_str()).await? else {
                continue;
            };
            match key.parse_value(&raw) {
                Ok(value) => settings = settings.with(key, value),
                Err(err) => {
                    warn!(key = %key, value = %raw, error = %err, "ignoring invalid stored config value");
                }
            }
        }
        Ok(settings)
    }

    /// Add a `pending` job. `max_retries` defaults to the configured value.
    #[instrument(skip(self), err)]
    pub async fn enqueue(
        &self,
        command: &str,
        max_retries: Option<u32>,
    ) -> Result<JobId, QueueError> {
        let max_retries = match max_retries {
            Some(n) => n,
            None => self.settings().await?.max_retries,
        };
        let job = Job::new_at(command, max_retries, clock::now())?;
        self.store.insert(&job).await?;
        info!(job_id = %job.id, max_retries, "job enqueued");
        Ok(job.id)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job, QueueError> {
        self.store
            .get(id)
            .await?
            .ok_or(QueueError::Validation(DomainError::JobNotFound(id)))
    }

    /// Reserve the next claimable job for `worker`. `None` means idle.
    pub async fn claim(&self, worker: &WorkerId) -> Result<Option<Job>, QueueError> {
        Ok(self.store.claim_next(worker, clock::now()).await?)
    }

    /// Apply the retry policy to a finished attempt and persist the transition.
    ///
    /// Fails with `NotClaimed` if `worker` no longer holds the job.
    #[instrument(skip(self, worker, outcome), fields(worker = %worker), err)]
    pub async fn record_outcome(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        outcome: &Outcome,
    ) -> Result<Job, QueueError> {
        let job = self.get_job(job_id).await?;
        if !job.is_claimed_by(worker) {
            return Err(DomainError::NotClaimed {
                job_id,
                worker: worker.to_string(),
            }
            .into());
        }

        let now = clock::now();
        let policy = self.settings().await?.retry_policy();
        let decision = policy.decide(&job, outcome, now);
        Ok(self
            .store
            .update_if_claimed(job_id, worker, &decision, now)
            .await?)
    }

    /// Jobs in `state` (every job when `None`), newest first.
    pub async fn list_by_state(&self, state: Option<JobState>) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.list_by_state(state).await?)
    }

    pub async fn summary(&self) -> Result<JobSummary, QueueError> {
        Ok(self.store.summary().await?)
    }

    /// Distinct holders of `processing` jobs.
    pub async fn active_workers(&self) -> Result<Vec<WorkerId>, QueueError> {
        let mut workers: Vec<_> = self
            .store
            .list_by_state(Some(JobState::Processing))
            .await?
            .into_iter()
            .filter_map(|j| j.locked_by)
            .collect();
        workers.sort();
        workers.dedup();
        Ok(workers)
    }

    /// Move a dead-lettered job back to `pending`, keeping its attempt count.
    #[instrument(skip(self), err)]
    pub async fn retry_from_dlq(&self, job_id: JobId) -> Result<Job, QueueError> {
        let job = self.store.requeue_dead(job_id, clock::now()).await?;
        info!(job_id = %job.id, attempts = job.attempts, "job requeued from DLQ");
        Ok(job)
    }

    /// Return `processing` jobs whose claim is older than `lease` to `pending`.
    pub async fn reclaim_expired(&self, lease: Duration) -> Result<Vec<Job>, QueueError> {
        let now = clock::now();
        let cutoff = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let reclaimed = self.store.reclaim_expired(cutoff, now).await?;
        for job in &reclaimed {
            warn!(
                job_id = %job.id,
                last_error = job.last_error.as_deref().unwrap_or_default(),
                "reclaimed expired claim"
            );
        }
        Ok(reclaimed)
    }

    /// Raw stored value for `key`, if any.
    pub async fn get_config(&self, key: &str) -> Result<Option<String>, QueueError> {
        Ok(self.store.get_config(key).await?)
    }

    /// Validate and store a config value.
    #[instrument(skip(self), err)]
    pub async fn set_config(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let key: ConfigKey = key.parse()?;
        let parsed = key.parse_value(value)?;
        self.store
            .set_config(key.as_str(), &parsed.to_string())
            .await?;
        info!(key = %key, value = parsed, "config updated");
        Ok(())
    }

    /// Every known key with its stored value.
    pub async fn all_config(&self) -> Result<Vec<(ConfigKey, Option<String>)>, QueueError> {
        let mut out = Vec::with_capacity(ConfigKey::ALL.len());
        for key in ConfigKey::ALL {
            out.push((key, self.store.get_config(key.as_str()).await?));
        }
        Ok(out)
    }

    /// Ask every running worker pool sharing this store to stop.
    pub async fn request_worker_stop(&self) -> Result<DateTime<Utc>, QueueError> {
        let now = clock::now();
        self.store
            .set_config(WORKER_STOP_KEY, &now.to_rfc3339())
            .await?;
        info!(requested_at = %now, "worker stop requested");
        Ok(now)
    }

    /// Whether a stop was requested after `since`.
    pub async fn stop_requested_since(&self, since: DateTime<Utc>) -> Result<bool, QueueError> {
        let Some(raw) = self.store.get_config(WORKER_STOP_KEY).await? else {
            return Ok(false);
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(at) => Ok(at.with_timezone(&Utc) > since),
            Err(err) => {
                warn!(value = %raw, error = %err, "ignoring malformed stop request");
                Ok(false)
            }
        }
    }
}
