//! In-process job store for tests and single-process use.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use queuectl_core::{Decision, Job, JobId, JobState, WorkerId};

use super::store::{JobStore, JobStoreError, JobSummary};

/// In-memory job store.
///
/// Claims happen under the write lock, so the scan for the oldest claimable job
/// and its transition to `processing` are one step.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    config: RwLock<HashMap<String, String>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[cfg(test)]
impl InMemoryJobStore {
    /// Overwrite a stored job, bypassing the state machine.
    pub(crate) fn overwrite(&self, job: Job) {
        self.jobs.write().unwrap().insert(job.id, job);
    }
}

fn poisoned<T>(_: PoisonError<T>) -> JobStoreError {
    JobStoreError::Unavailable("in-memory store lock poisoned".to_string())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn init(&self, defaults: &[(&str, String)]) -> Result<(), JobStoreError> {
        let mut config = self.config.write().map_err(poisoned)?;
        for (key, value) in defaults {
            config
                .entry((*key).to_string())
                .or_insert_with(|| value.clone());
        }
        Ok(())
    }

    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&id).cloned())
    }

    async fn claim_next(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;

        for job in jobs.values_mut() {
            job.promote_if_due(now);
        }

        let Some(id) = jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .min_by_key(|j| j.claim_order())
            .map(|j| j.id)
        else {
            return Ok(None);
        };

        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        let before = job.clone();
        job.claim(worker, now)?;
        Ok(Some(before))
    }

    async fn update_if_claimed(
        &self,
        id: JobId,
        worker: &WorkerId,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.apply(worker, decision, now)?;
        Ok(job.clone())
    }

    async fn list_by_state(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| state.is_none_or(|s| j.state == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| std::cmp::Reverse(j.claim_order()));
        Ok(result)
    }

    async fn summary(&self) -> Result<JobSummary, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut summary = JobSummary::default();
        for job in jobs.values() {
            summary.add(job.state, 1);
        }
        Ok(summary)
    }

    async fn requeue_dead(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.retry_from_dlq(now)?;
        Ok(job.clone())
    }

    async fn reclaim_expired(
        &self,
        locked_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let mut reclaimed = Vec::new();
        for job in jobs.values_mut() {
            let stale = job.state == JobState::Processing
                && job.locked_at.is_some_and(|at| at < locked_before);
            if stale {
                job.reclaim_expired(now)?;
                reclaimed.push(job.clone());
            }
        }
        Ok(reclaimed)
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>, JobStoreError> {
        let config = self.config.read().map_err(poisoned)?;
        Ok(config.get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), JobStoreError> {
        let mut config = self.config.write().map_err(poisoned)?;
        config.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
