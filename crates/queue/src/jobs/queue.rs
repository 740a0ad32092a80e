//! Producer and admin side of a named queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use deferq_core::{Clock, JobId, QueueError, SystemClock};

use super::guard::call_guarded;
use super::registry::JobTypeRegistry;
use super::store::{JobStore, JobStoreError};
use super::types::{BackOff, Deadline, Job, JobFailure, JobStatus, RepeatCount};
use super::worker::{DelayNotifier, NoopNotifier};

/// Error returned by queue operations.
#[derive(Debug, thiserror::Error)]
pub enum JobQueueError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Per-job overrides applied at push time.
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub delay_until: Option<DateTime<Utc>>,
    pub max_failures: Option<i64>,
    pub back_off: Option<BackOff>,
    pub repeat_times: Option<RepeatCount>,
    pub repeat_until: Option<Deadline>,
    pub repeat_delay: Option<Duration>,
}

impl PushOptions {
    pub fn delay_until(mut self, at: DateTime<Utc>) -> Self {
        self.delay_until = Some(at);
        self
    }

    pub fn max_failures(mut self, max_failures: i64) -> Self {
        self.max_failures = Some(max_failures);
        self
    }

    pub fn back_off(mut self, back_off: BackOff) -> Self {
        self.back_off = Some(back_off);
        self
    }

    pub fn repeat(mut self, times: RepeatCount, delay: Duration) -> Self {
        self.repeat_times = Some(times);
        self.repeat_delay = Some(delay);
        self
    }

    pub fn repeat_until(mut self, until: Deadline) -> Self {
        self.repeat_until = Some(until);
        self
    }
}

/// A named queue over a job store.
pub struct Queue<S: JobStore> {
    name: String,
    store: S,
    registry: Arc<JobTypeRegistry>,
    notifier: Arc<dyn DelayNotifier>,
    clock: Arc<dyn Clock>,
}

impl<S: JobStore> Queue<S> {
    pub fn new(name: impl Into<String>, store: S, registry: Arc<JobTypeRegistry>) -> Self {
        Self {
            name: name.into(),
            store,
            registry,
            notifier: Arc::new(NoopNotifier),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn DelayNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create a pending job of a registered type.
    pub fn push(
        &self,
        job_type: &str,
        data: serde_json::Value,
        options: PushOptions,
    ) -> Result<JobId, JobQueueError> {
        let registered = self
            .registry
            .get(job_type)
            .ok_or_else(|| QueueError::not_found(format!("job type {job_type}")))?;

        if let Some(validator) = registered.validator() {
            call_guarded(|| validator(&data))
                .map_err(|e| QueueError::validation(format!("{job_type}: {e:#}")))?;
        }

        let now = self.clock.now();
        let mut job = Job::new_at(self.name.clone(), job_type, data, now);
        job.delay_until = options.delay_until.unwrap_or(now);
        job.max_failures = options.max_failures;
        job.back_off = options.back_off;
        job.repeat_times = options.repeat_times;
        job.repeat_until = options.repeat_until;
        job.repeat_delay = options.repeat_delay;

        let id = self.store.insert(job)?;
        info!(queue = %self.name, job_id = %id, job_type, "job pushed");
        self.notifier.recompute_delay(&self.name);
        Ok(id)
    }

    /// Get a job of this queue.
    pub fn get(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        Ok(self
            .store
            .get(job_id)?
            .filter(|job| job.queue == self.name))
    }

    /// Delete a job of this queue. Returns whether it existed.
    pub fn delete(&self, job_id: JobId) -> Result<bool, JobQueueError> {
        if self.get(job_id)?.is_none() {
            return Ok(false);
        }
        Ok(self.store.delete(job_id)?)
    }

    pub fn pending(&self, job_type: Option<&str>) -> Result<Vec<JobId>, JobQueueError> {
        self.ids(Some(JobStatus::Pending), job_type)
    }

    pub fn progress(&self, job_type: Option<&str>) -> Result<Vec<JobId>, JobQueueError> {
        self.ids(Some(JobStatus::Progress), job_type)
    }

    pub fn complete(&self, job_type: Option<&str>) -> Result<Vec<JobId>, JobQueueError> {
        self.ids(Some(JobStatus::Complete), job_type)
    }

    pub fn failed(&self, job_type: Option<&str>) -> Result<Vec<JobId>, JobQueueError> {
        self.ids(Some(JobStatus::Failed), job_type)
    }

    pub fn all(&self, job_type: Option<&str>) -> Result<Vec<JobId>, JobQueueError> {
        self.ids(None, job_type)
    }

    /// Mark a non-terminal job as failed.
    ///
    /// A job aborted while in `progress` keeps running, but its worker's
    /// commit is rejected.
    pub fn abort(&self, job_id: JobId) -> Result<Job, JobQueueError> {
        let mut job = self.require(job_id)?;
        if job.status.is_terminal() {
            return Err(QueueError::conflict(format!("job {job_id} is already {}", job.status)).into());
        }

        let expected = job.status;
        let now = self.clock.now();
        job.status = JobStatus::Failed;
        job.failures.push(JobFailure {
            run: job.run_failures,
            message: "aborted".to_string(),
            at: now,
        });
        job.updated_at = now;

        self.store.compare_and_replace(&job, expected)?;
        info!(queue = %self.name, job_id = %job_id, "job aborted");
        Ok(job)
    }

    /// Put a job back to `pending` with its counters and failures cleared.
    pub fn reset(&self, job_id: JobId) -> Result<Job, JobQueueError> {
        let mut job = self.require(job_id)?;
        if job.status == JobStatus::Progress {
            return Err(QueueError::conflict(format!("job {job_id} is in progress")).into());
        }

        let expected = job.status;
        let now = self.clock.now();
        job.status = JobStatus::Pending;
        job.runs = 0;
        job.run_failures = 0;
        job.failures.clear();
        job.delay_until = now;
        job.updated_at = now;

        self.store.compare_and_replace(&job, expected)?;
        info!(queue = %self.name, job_id = %job_id, "job reset");
        self.notifier.recompute_delay(&self.name);
        Ok(job)
    }

    fn require(&self, job_id: JobId) -> Result<Job, JobQueueError> {
        self.get(job_id)?
            .ok_or_else(|| QueueError::not_found(format!("job {job_id}")).into())
    }

    fn ids(
        &self,
        status: Option<JobStatus>,
        job_type: Option<&str>,
    ) -> Result<Vec<JobId>, JobQueueError> {
        Ok(self
            .store
            .list(&self.name, status, job_type)?
            .into_iter()
            .map(|job| job.id)
            .collect())
    }
}
