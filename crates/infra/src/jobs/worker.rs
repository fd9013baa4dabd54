//! Worker pool: claim, execute, record.
//!
//! Each worker is an independent tokio task looping over
//! `claim -> run command -> record outcome`. Stop is cooperative: the
//! [`CancellationToken`] is observed between iterations and during idle waits,
//! never while a command runs.
//!
//! An outcome that could not be written is kept and written again, after
//! `error_backoff`, before the worker claims anything new.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use queuectl_core::{clock, JobId, JobState, Outcome, WorkerId};

use super::queue::{JobQueue, QueueError};
use super::runner::CommandRunner;
use super::store::JobStore;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent worker loops.
    pub count: usize,
    /// Idle wait when no job is claimable.
    pub poll_interval: Duration,
    /// Wait after a store failure before the next iteration.
    pub error_backoff: Duration,
    /// Reclaim `processing` jobs held longer than this. Off when `None`.
    /// Must exceed the longest expected command run.
    pub lease_timeout: Option<Duration>,
    /// How often to look for a cross-process stop request.
    pub stop_check_interval: Duration,
    pub watch_stop_requests: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 1,
            poll_interval: Duration::from_millis(2000),
            error_backoff: Duration::from_secs(5),
            lease_timeout: None,
            stop_check_interval: Duration::from_secs(1),
            watch_stop_requests: true,
        }
    }
}

impl WorkerConfig {
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// A zero lease is treated as no lease.
    pub fn with_lease_timeout(mut self, lease: Option<Duration>) -> Self {
        self.lease_timeout = lease.filter(|d| !d.is_zero());
        self
    }

    pub fn with_stop_check_interval(mut self, interval: Duration) -> Self {
        self.stop_check_interval = interval;
        self
    }

    pub fn without_stop_watch(mut self) -> Self {
        self.watch_stop_requests = false;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Outcomes dropped because the claim was lost (e.g. lease expired).
    pub discarded: u64,
    pub reclaimed: u64,
    pub store_errors: u64,
}

type SharedStats = Arc<Mutex<WorkerStats>>;

fn update_stats(stats: &SharedStats, f: impl FnOnce(&mut WorkerStats)) {
    let mut guard = stats.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard);
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    worker_ids: Vec<WorkerId>,
    started_at: DateTime<Utc>,
    stats: SharedStats,
}

impl WorkerPoolHandle {
    /// Token that stops the pool when cancelled. Clone it into signal handlers.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn worker_ids(&self) -> &[WorkerId] {
        &self.worker_ids
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Request stop and wait for in-flight jobs to finish.
    pub async fn stop(self) -> WorkerStats {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait until the pool stops (token cancelled elsewhere).
    pub async fn join(self) -> WorkerStats {
        for handle in self.workers {
            if let Err(err) = handle.await {
                error!(error = %err, "worker task failed");
            }
        }
        self.cancel.cancel();
        for handle in self.background {
            if let Err(err) = handle.await {
                error!(error = %err, "pool background task failed");
            }
        }

        let stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        info!(
            processed = stats.processed,
            completed = stats.completed,
            dead_lettered = stats.dead_lettered,
            "worker pool stopped"
        );
        stats
    }
}

/// Spawns worker loops plus the pool's background tasks.
pub struct WorkerPool;

impl WorkerPool {
    /// Start `config.count` workers with ids `<pid>-<n>`.
    pub fn spawn<S, R>(
        queue: Arc<JobQueue<S>>,
        runner: Arc<R>,
        config: WorkerConfig,
    ) -> WorkerPoolHandle
    where
        S: JobStore + 'static,
        R: CommandRunner + ?Sized + 'static,
    {
        let cancel = CancellationToken::new();
        let stats = SharedStats::default();
        let started_at = clock::now();

        let mut workers = Vec::with_capacity(config.count);
        let mut worker_ids = Vec::with_capacity(config.count);
        for n in 1..=config.count.max(1) {
            let worker = Worker {
                id: WorkerId::numbered(n),
                queue: Arc::clone(&queue),
                runner: Arc::clone(&runner),
                config: config.clone(),
                stats: Arc::clone(&stats),
                unrecorded: Mutex::new(None),
            };
            worker_ids.push(worker.id.clone());
            workers.push(tokio::spawn(worker.run(cancel.clone())));
        }

        let mut background = Vec::new();
        if let Some(lease) = config.lease_timeout {
            background.push(tokio::spawn(reap_expired(
                Arc::clone(&queue),
                lease,
                cancel.clone(),
                Arc::clone(&stats),
            )));
        }
        if config.watch_stop_requests {
            background.push(tokio::spawn(watch_stop_requests(
                Arc::clone(&queue),
                started_at,
                config.stop_check_interval,
                cancel.clone(),
            )));
        }

        info!(count = worker_ids.len(), lease = ?config.lease_timeout, "worker pool started");

        WorkerPoolHandle {
            cancel,
            workers,
            background,
            worker_ids,
            started_at,
            stats,
        }
    }
}

/// One worker loop.
pub struct Worker<S, R: ?Sized> {
    id: WorkerId,
    queue: Arc<JobQueue<S>>,
    runner: Arc<R>,
    config: WorkerConfig,
    stats: SharedStats,
    unrecorded: Mutex<Option<(JobId, Outcome)>>,
}

impl<S, R> Worker<S, R>
where
    S: JobStore + 'static,
    R: CommandRunner + ?Sized + 'static,
{
    pub fn new(
        id: WorkerId,
        queue: Arc<JobQueue<S>>,
        runner: Arc<R>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id,
            queue,
            runner,
            config,
            stats: SharedStats::default(),
            unrecorded: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Loop until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(worker = %self.id, "worker started");

        while !cancel.is_cancelled() {
            let wait = match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => self.config.poll_interval,
                Err(err) => {
                    error!(worker = %self.id, error = %err, "store operation failed");
                    update_stats(&self.stats, |s| s.store_errors += 1);
                    self.config.error_backoff
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        if let Some((job_id, outcome)) = self.take_unrecorded() {
            if let Err(err) = self.record(job_id, outcome).await {
                error!(
                    worker = %self.id,
                    job_id = %job_id,
                    error = %err,
                    "outcome not recorded before shutdown, job left in processing"
                );
            }
        }

        info!(worker = %self.id, "worker stopped");
    }

    /// Claim and process at most one job. `Ok(false)` when nothing was claimable.
    ///
    /// A previously unrecorded outcome is written first; the job is not run again.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        if let Some((job_id, outcome)) = self.take_unrecorded() {
            self.record(job_id, outcome).await?;
            return Ok(true);
        }

        let Some(job) = self.queue.claim(&self.id).await? else {
            return Ok(false);
        };

        info!(
            worker = %self.id,
            job_id = %job.id,
            command = %job.command,
            attempt = job.attempts + 1,
            "executing job"
        );

        let output = self.runner.run(&job.command).await;
        if !output.stdout.is_empty() {
            debug!(worker = %self.id, job_id = %job.id, stdout = %output.stdout.trim_end(), "command output");
        }
        if !output.stderr.is_empty() {
            debug!(worker = %self.id, job_id = %job.id, stderr = %output.stderr.trim_end(), "command error output");
        }
        update_stats(&self.stats, |s| s.processed += 1);

        self.record(job.id, output.outcome()).await?;
        Ok(true)
    }

    fn take_unrecorded(&self) -> Option<(JobId, Outcome)> {
        self.unrecorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Write `outcome` for a job this worker ran. On a store failure the outcome
    /// is kept for the next iteration.
    async fn record(&self, job_id: JobId, outcome: Outcome) -> Result<(), QueueError> {
        match self.queue.record_outcome(job_id, &self.id, &outcome).await {
            Ok(after) => match after.state {
                JobState::Completed => {
                    update_stats(&self.stats, |s| s.completed += 1);
                    info!(worker = %self.id, job_id = %after.id, "job completed");
                }
                JobState::Failed => {
                    update_stats(&self.stats, |s| s.retried += 1);
                    warn!(
                        worker = %self.id,
                        job_id = %after.id,
                        attempts = after.attempts,
                        last_error = after.last_error.as_deref().unwrap_or_default(),
                        "job failed, will retry"
                    );
                }
                JobState::Dead => {
                    update_stats(&self.stats, |s| s.dead_lettered += 1);
                    warn!(worker = %self.id, job_id = %after.id, attempts = after.attempts, "job moved to DLQ");
                }
                other => {
                    warn!(worker = %self.id, job_id = %after.id, state = %other, "unexpected state after outcome");
                }
            },
            Err(QueueError::Validation(err)) => {
                update_stats(&self.stats, |s| s.discarded += 1);
                warn!(worker = %self.id, job_id = %job_id, error = %err, "outcome discarded");
            }
            Err(err) => {
                *self.unrecorded.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some((job_id, outcome));
                return Err(err);
            }
        }
        Ok(())
    }
}

async fn reap_expired<S: JobStore>(
    queue: Arc<JobQueue<S>>,
    lease: Duration,
    cancel: CancellationToken,
    stats: SharedStats,
) {
    let interval = (lease / 2).max(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match queue.reclaim_expired(lease).await {
            Ok(jobs) if !jobs.is_empty() => {
                update_stats(&stats, |s| s.reclaimed += jobs.len() as u64);
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "lease reclaim failed"),
        }
    }
}

async fn watch_stop_requests<S: JobStore>(
    queue: Arc<JobQueue<S>>,
    since: DateTime<Utc>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match queue.stop_requested_since(since).await {
            Ok(true) => {
                info!("stop requested, finishing in-flight jobs");
                cancel.cancel();
                break;
            }
            Ok(false) => {}
            Err(err) => warn!(error = %err, "failed to check for stop requests"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use async_trait::async_trait;
    use queuectl_core::{Decision, Job};

    use crate::jobs::in_memory::InMemoryJobStore;
    use crate::jobs::runner::ScriptedRunner;
    use crate::jobs::store::{JobStoreError, JobSummary};

    type MemQueue = JobQueue<Arc<InMemoryJobStore>>;

    async fn queue() -> Arc<MemQueue> {
        Arc::new(JobQueue::open(InMemoryJobStore::arc()).await.unwrap())
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_stop_check_interval(Duration::from_millis(20))
    }

    /// In-memory store whose claims and outcome writes fail a set number of times.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryJobStore,
        failing_claims: AtomicUsize,
        failing_updates: AtomicUsize,
    }

    impl FlakyStore {
        fn failing(claims: usize, updates: usize) -> Self {
            Self {
                failing_claims: AtomicUsize::new(claims),
                failing_updates: AtomicUsize::new(updates),
                ..Self::default()
            }
        }

        fn trip(counter: &AtomicUsize) -> Result<(), JobStoreError> {
            let tripped = counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if tripped {
                Err(JobStoreError::Unavailable("database is locked".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn init(&self, defaults: &[(&str, String)]) -> Result<(), JobStoreError> {
            self.inner.init(defaults).await
        }

        async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
            self.inner.insert(job).await
        }

        async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get(id).await
        }

        async fn claim_next(
            &self,
            worker: &WorkerId,
            now: DateTime<Utc>,
        ) -> Result<Option<Job>, JobStoreError> {
            Self::trip(&self.failing_claims)?;
            self.inner.claim_next(worker, now).await
        }

        async fn update_if_claimed(
            &self,
            id: JobId,
            worker: &WorkerId,
            decision: &Decision,
            now: DateTime<Utc>,
        ) -> Result<Job, JobStoreError> {
            Self::trip(&self.failing_updates)?;
            self.inner.update_if_claimed(id, worker, decision, now).await
        }

        async fn list_by_state(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list_by_state(state).await
        }

        async fn summary(&self) -> Result<JobSummary, JobStoreError> {
            self.inner.summary().await
        }

        async fn requeue_dead(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
            self.inner.requeue_dead(id, now).await
        }

        async fn reclaim_expired(
            &self,
            locked_before: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<Vec<Job>, JobStoreError> {
            self.inner.reclaim_expired(locked_before, now).await
        }

        async fn get_config(&self, key: &str) -> Result<Option<String>, JobStoreError> {
            self.inner.get_config(key).await
        }

        async fn set_config(&self, key: &str, value: &str) -> Result<(), JobStoreError> {
            self.inner.set_config(key, value).await
        }
    }

    async fn wait_for_state<S: JobStore>(queue: &JobQueue<S>, id: JobId, state: JobState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if queue.get_job(id).await.unwrap().state == state {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job {id} never reached {state}"));
    }

    #[test]
    fn defaults_follow_documented_values() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(2000));
        assert_eq!(config.error_backoff, Duration::from_secs(5));
        assert_eq!(config.lease_timeout, None);
        assert_eq!(config.with_count(0).count, 1);
    }

    #[test]
    fn zero_lease_means_no_lease() {
        let config = WorkerConfig::default().with_lease_timeout(Some(Duration::ZERO));
        assert_eq!(config.lease_timeout, None);

        let config = WorkerConfig::default().with_lease_timeout(Some(Duration::from_secs(30)));
        assert_eq!(config.lease_timeout, Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn failed_outcome_write_is_retried_without_rerunning_the_job() {
        let queue = Arc::new(JobQueue::open(FlakyStore::failing(0, 1)).await.unwrap());
        let id = queue.enqueue("ok", None).await.unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let worker = Worker::new(WorkerId::new("w"), Arc::clone(&queue), Arc::clone(&runner), fast_config());

        let err = worker.run_once().await.unwrap_err();
        assert!(err.is_store_unavailable());
        let stuck = queue.get_job(id).await.unwrap();
        assert_eq!(stuck.state, JobState::Processing);
        assert_eq!(stuck.locked_by, Some(WorkerId::new("w")));

        assert!(worker.run_once().await.unwrap());
        let job = queue.get_job(id).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.locked_by, None);
        assert_eq!(runner.calls(), 1);

        assert!(!worker.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn store_errors_back_off_and_the_job_still_completes() {
        let queue = Arc::new(JobQueue::open(FlakyStore::failing(2, 1)).await.unwrap());
        let id = queue.enqueue("ok", None).await.unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let backoff = Duration::from_millis(50);

        let started = Instant::now();
        let handle = WorkerPool::spawn(
            Arc::clone(&queue),
            Arc::clone(&runner),
            fast_config().with_error_backoff(backoff),
        );
        wait_for_state(&queue, id, JobState::Completed).await;
        assert!(started.elapsed() >= backoff * 3);

        let stats = handle.stop().await;
        assert_eq!(stats.store_errors, 3);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn run_once_reports_idle() {
        let queue = queue().await;
        let worker = Worker::new(
            WorkerId::new("w"),
            queue,
            Arc::new(ScriptedRunner::default()),
            fast_config(),
        );
        assert!(!worker.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn pool_completes_and_dead_letters() {
        let queue = queue().await;
        let ok = queue.enqueue("ok", None).await.unwrap();
        let bad = queue.enqueue("boom", Some(1)).await.unwrap();

        let runner = Arc::new(ScriptedRunner::default());
        let handle = WorkerPool::spawn(Arc::clone(&queue), Arc::clone(&runner), fast_config().with_count(2));
        assert_eq!(handle.worker_ids().len(), 2);

        wait_for_state(&queue, ok, JobState::Completed).await;
        wait_for_state(&queue, bad, JobState::Dead).await;

        let stats = handle.stop().await;
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(runner.calls(), 2);
        assert_eq!(queue.get_job(ok).await.unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn stop_waits_for_the_in_flight_job() {
        let queue = queue().await;
        let id = queue.enqueue("ok slow", None).await.unwrap();
        let runner = Arc::new(ScriptedRunner::with_delay(Duration::from_millis(300)));

        let handle = WorkerPool::spawn(Arc::clone(&queue), Arc::clone(&runner), fast_config());
        runner.started().await;
        handle.stop().await;

        assert_eq!(queue.get_job(id).await.unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn cross_process_stop_request_ends_the_pool() {
        let queue = queue().await;
        let handle = WorkerPool::spawn(
            Arc::clone(&queue),
            Arc::new(ScriptedRunner::default()),
            fast_config(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.request_worker_stop().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("pool did not observe the stop request");
    }

    #[tokio::test]
    async fn stale_stop_request_is_ignored() {
        let queue = queue().await;
        queue.request_worker_stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let handle = WorkerPool::spawn(
            Arc::clone(&queue),
            Arc::new(ScriptedRunner::default()),
            fast_config(),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.cancel_token().is_cancelled());
        handle.stop().await;
    }
}
