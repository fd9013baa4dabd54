//! Retry policy: exponential backoff and the dead-letter boundary.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::job::{Job, JobState, MAX_RETRIES_REACHED};

/// Default exponential base when the config table has no usable value.
pub const DEFAULT_BACKOFF_BASE: u32 = 2;

/// Result of running a job's command once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Outcome {
    /// The command exited with status zero.
    Succeeded,
    /// Non-zero exit, killed by a signal, timed out, or could not be started.
    Failed { reason: String },
}

impl Outcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

/// The transition the policy chose for a finished attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum Decision {
    /// `processing -> completed`.
    Complete,
    /// `processing -> failed`, eligible again at `scheduled_at`.
    Retry {
        attempts: u32,
        scheduled_at: DateTime<Utc>,
        last_error: String,
    },
    /// `processing -> dead`.
    Dead { attempts: u32, last_error: String },
}

impl Decision {
    pub fn target_state(&self) -> JobState {
        match self {
            Decision::Complete => JobState::Completed,
            Decision::Retry { .. } => JobState::Failed,
            Decision::Dead { .. } => JobState::Dead,
        }
    }
}

/// Exponential backoff: `delay = backoff_base ^ attempts` seconds.
///
/// A base of 1 gives a constant one-second delay. Overflow saturates: the delay is
/// capped at `u64::MAX` seconds and the resulting `scheduled_at` at
/// [`clock::horizon`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub backoff_base: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl RetryPolicy {
    pub fn new(backoff_base: u32) -> Self {
        Self { backoff_base }
    }

    /// Delay before the job becomes claimable again after its `attempt`-th failure.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_secs(u64::from(self.backoff_base).saturating_pow(attempt))
    }

    /// Whether a job that has now failed `attempts` times gets another run.
    pub fn should_retry(attempts: u32, max_retries: u32) -> bool {
        attempts < max_retries
    }

    /// Decide the transition for `job` given the outcome of its current attempt.
    pub fn decide(&self, job: &Job, outcome: &Outcome, now: DateTime<Utc>) -> Decision {
        let reason = match outcome {
            Outcome::Succeeded => return Decision::Complete,
            Outcome::Failed { reason } => reason,
        };

        let attempts = job.attempts.saturating_add(1);
        if !Self::should_retry(attempts, job.max_retries) {
            return Decision::Dead {
                attempts,
                last_error: MAX_RETRIES_REACHED.to_string(),
            };
        }

        let delay = self.delay_for_attempt(attempts);
        let horizon = clock::horizon();
        let scheduled_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .map_or(horizon, |at| at.min(horizon));

        Decision::Retry {
            attempts,
            scheduled_at,
            last_error: format!("Retry in {}s: {reason}", delay.as_secs()),
        }
    }
}
