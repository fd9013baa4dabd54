//! Persistent shell-command job queue.
//!
//! ## Design
//!
//! - Jobs and config live in a [`JobStore`] (SQLite on disk, or in memory)
//! - Claims are atomic: one job, one worker
//! - Failed attempts back off exponentially; exhausted jobs go to the DLQ
//! - Deferred retries are durable (`scheduled_at`), not in-process timers
//!
//! ## Components
//!
//! - `JobStore`: persistence contract, with `InMemoryJobStore` and `SqliteJobStore`
//! - `JobQueue`: enqueue / claim / record outcome / DLQ / config operations
//! - `CommandRunner`: runs a job's command (`ShellRunner`)
//! - `WorkerPool`: concurrent worker loops with cooperative stop

pub mod in_memory;
pub mod queue;
pub mod runner;
pub mod sqlite;
pub mod store;
pub mod worker;

pub use in_memory::InMemoryJobStore;
pub use queue::{JobQueue, QueueError};
pub use runner::{CommandRunner, ExecutionOutput, ShellRunner};
pub use sqlite::SqliteJobStore;
pub use store::{JobStore, JobStoreError, JobSummary};
pub use worker::{Worker, WorkerConfig, WorkerPool, WorkerPoolHandle, WorkerStats};
