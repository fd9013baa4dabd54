//! Job record and its lifecycle state machine.
//!
//! ```text
//!              claim                 success
//!   pending ───────────► processing ─────────► completed
//!      ▲  ▲                 │   │
//!      │  │  lease expired  │   │ failure, attempts+1 >= max_retries
//!      │  └─────────────────┘   └──────────────────────────────► dead
//!      │                        │                                  │
//!      │   scheduled_at passed  │ failure, attempts+1 < max_retries│
//!      └────────── failed ◄─────┘                                  │
//!      ▲                                                           │
//!      └──────────────────────── retry from DLQ ───────────────────┘
//! ```
//!
//! Every mutation goes through a method on [`Job`] that checks the source state, so
//! stores only have to make the check-and-write atomic.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, WorkerId};
use crate::retry::Decision;

/// `last_error` recorded when a job is moved to the dead-letter queue.
pub const MAX_RETRIES_REACHED: &str = "Max retries reached";

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by exactly one worker and executing.
    Processing,
    /// Terminal success.
    Completed,
    /// Last attempt failed; returns to `pending` once `scheduled_at` passes.
    Failed,
    /// Retries exhausted; parked in the dead-letter queue.
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// `completed` and `dead` only change through an explicit operator action.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }

    /// Whether `self -> next` is one of the legal lifecycle edges.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Dead)
                | (Processing, Pending)
                | (Failed, Pending)
                | (Dead, Pending)
        )
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(DomainError::validation(format!(
                "unknown job state '{other}' (expected one of pending, processing, completed, failed, dead)"
            ))),
        }
    }
}

/// A shell-command job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Opaque command line handed to the runner.
    pub command: String,
    pub state: JobState,
    /// Number of failed execution outcomes recorded so far.
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the job may be claimed again.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub locked_by: Option<WorkerId>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new `pending` job.
    pub fn new(command: impl Into<String>, max_retries: u32) -> DomainResult<Self> {
        Self::new_at(command, max_retries, crate::clock::now())
    }

    /// Create a new `pending` job with an explicit creation time.
    pub fn new_at(
        command: impl Into<String>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(DomainError::validation("command must not be empty"));
        }
        if max_retries == 0 {
            return Err(DomainError::validation("max_retries must be at least 1"));
        }

        Ok(Self {
            id: JobId::new(),
            command,
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            last_error: None,
            locked_by: None,
            locked_at: None,
        })
    }

    /// Whether the claim protocol may pick this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Whether this `failed` job has waited out its backoff.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Failed && self.scheduled_at.is_none_or(|at| at <= now)
    }

    pub fn is_claimed_by(&self, worker: &WorkerId) -> bool {
        self.state == JobState::Processing && self.locked_by.as_ref() == Some(worker)
    }

    /// Ordering key used by the claim protocol: oldest first, id breaks ties.
    pub fn claim_order(&self) -> (DateTime<Utc>, JobId) {
        (self.created_at, self.id)
    }

    /// `pending -> processing`.
    pub fn claim(&mut self, worker: &WorkerId, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_transition(JobState::Processing)?;
        self.state = JobState::Processing;
        self.locked_by = Some(worker.clone());
        self.locked_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Persist the outcome of the attempt held by `worker`.
    ///
    /// Rejected unless the job is `processing` under `worker`'s claim.
    pub fn apply(
        &mut self,
        worker: &WorkerId,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if !self.is_claimed_by(worker) {
            return Err(DomainError::NotClaimed {
                job_id: self.id,
                worker: worker.to_string(),
            });
        }
        self.ensure_transition(decision.target_state())?;

        match decision {
            Decision::Complete => {
                self.scheduled_at = None;
            }
            Decision::Retry {
                attempts,
                scheduled_at,
                last_error,
            } => {
                self.attempts = *attempts;
                self.scheduled_at = Some(*scheduled_at);
                self.last_error = Some(last_error.clone());
            }
            Decision::Dead {
                attempts,
                last_error,
            } => {
                self.attempts = *attempts;
                self.scheduled_at = None;
                self.last_error = Some(last_error.clone());
            }
        }

        self.state = decision.target_state();
        self.locked_by = None;
        self.locked_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// `failed -> pending` once the backoff delay has elapsed.
    pub fn promote_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_due(now) {
            return false;
        }
        self.state = JobState::Pending;
        self.updated_at = now;
        true
    }

    /// `dead -> pending`, operator initiated. Keeps `attempts` and `last_error`.
    pub fn retry_from_dlq(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.state != JobState::Dead {
            return Err(DomainError::InvalidTransition {
                job_id: self.id,
                from: self.state,
                to: JobState::Pending,
            });
        }
        self.state = JobState::Pending;
        self.scheduled_at = None;
        self.locked_by = None;
        self.locked_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// `processing -> pending` when the holder's lease ran out.
    pub fn reclaim_expired(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.state != JobState::Processing {
            return Err(DomainError::InvalidTransition {
                job_id: self.id,
                from: self.state,
                to: JobState::Pending,
            });
        }
        let holder = self
            .locked_by
            .take()
            .map(|w| w.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        self.state = JobState::Pending;
        self.locked_at = None;
        self.scheduled_at = None;
        self.last_error = Some(lease_expired_message(&holder));
        self.updated_at = now;
        Ok(())
    }

    fn ensure_transition(&self, to: JobState) -> DomainResult<()> {
        if self.state.can_transition_to(to) {
            Ok(())
        } else {
            Err(DomainError::InvalidTransition {
                job_id: self.id,
                from: self.state,
                to,
            })
        }
    }
}

/// `last_error` written when a stale claim is reclaimed.
pub fn lease_expired_message(holder: &str) -> String {
    format!("Lease expired (held by {holder})")
}
