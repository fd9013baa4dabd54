//! Infrastructure layer: job stores, command execution, worker pool.

pub mod jobs;
