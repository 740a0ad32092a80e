//! Persistent job queue with retries, backoff and repeating jobs.

pub mod config;
pub mod jobs;

pub use config::{ConfigError, WorkerConfig};
