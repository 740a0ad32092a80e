//! Job storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use deferq_core::JobId;

use super::types::{Job, JobStatus, JobTransition};

/// Job store abstraction.
///
/// Every mutating call is atomic with respect to the others: the claim flips
/// exactly one job from `pending` to `progress`, and a commit rewrites the
/// complete post-execution state of one job or nothing at all.
pub trait JobStore: Send + Sync {
    /// Insert a new job.
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Overwrite a stored job if its status is still `expected` and it has
    /// not been claimed since `job` was read.
    fn compare_and_replace(&self, job: &Job, expected: JobStatus) -> Result<(), JobStoreError>;

    /// Remove a job. Returns whether it existed.
    fn delete(&self, job_id: JobId) -> Result<bool, JobStoreError>;

    /// Claim the next due pending job of `queue`, marking it `progress` and
    /// bumping its claim counter.
    fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    /// Commit a post-execution transition for a job currently in `progress`
    /// under the same claim the transition was planned for.
    fn commit(
        &self,
        job_id: JobId,
        transition: &JobTransition,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// List jobs of a queue, optionally filtered by status and job type.
    fn list(
        &self,
        queue: &str,
        status: Option<JobStatus>,
        job_type: Option<&str>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Earliest `delay_until` among pending jobs of `queue`.
    fn next_due(&self, queue: &str) -> Result<Option<DateTime<Utc>>, JobStoreError>;

    /// Job counts per status.
    fn stats(&self, queue: &str) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {id} is {actual}, expected {expected}")]
    Conflict {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error("job {id} was claimed again (claim {actual}, expected {expected})")]
    StaleClaim { id: JobId, expected: u64, actual: u64 },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job counts for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub progress: usize,
    pub complete: usize,
    pub failed: usize,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".to_string()))
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    fn compare_and_replace(&self, job: &Job, expected: JobStatus) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let stored = jobs.get_mut(&job.id).ok_or(JobStoreError::NotFound(job.id))?;
        if stored.status != expected {
            return Err(JobStoreError::Conflict {
                id: job.id,
                expected,
                actual: stored.status,
            });
        }
        if stored.claim != job.claim {
            return Err(JobStoreError::StaleClaim {
                id: job.id,
                expected: job.claim,
                actual: stored.claim,
            });
        }
        *stored = job.clone();
        Ok(())
    }

    fn delete(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        Ok(self.write()?.remove(&job_id).is_some())
    }

    fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.write()?;

        // Earliest due first, creation order breaks ties
        let next = jobs
            .values()
            .filter(|j| j.queue == queue && j.is_due(now))
            .min_by_key(|j| (j.delay_until, j.created_at, j.id))
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };

        match jobs.get_mut(&job_id) {
            Some(job) => {
                job.status = JobStatus::Progress;
                job.claim = job.claim.wrapping_add(1);
                job.updated_at = now;
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    fn commit(
        &self,
        job_id: JobId,
        transition: &JobTransition,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        if job.status != JobStatus::Progress {
            return Err(JobStoreError::Conflict {
                id: job_id,
                expected: JobStatus::Progress,
                actual: job.status,
            });
        }
        if job.claim != transition.claim {
            return Err(JobStoreError::StaleClaim {
                id: job_id,
                expected: transition.claim,
                actual: job.claim,
            });
        }

        job.apply(transition, now);
        Ok(job.clone())
    }

    fn list(
        &self,
        queue: &str,
        status: Option<JobStatus>,
        job_type: Option<&str>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| {
                j.queue == queue
                    && status.is_none_or(|s| j.status == s)
                    && job_type.is_none_or(|t| j.job_type == t)
            })
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        Ok(result)
    }

    fn next_due(&self, queue: &str) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        let jobs = self.read()?;
        Ok(jobs
            .values()
            .filter(|j| j.queue == queue && j.status == JobStatus::Pending)
            .map(|j| j.delay_until)
            .min())
    }

    fn stats(&self, queue: &str) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();

        for job in jobs.values().filter(|j| j.queue == queue) {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Progress => stats.progress += 1,
                JobStatus::Complete => stats.complete += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }

        Ok(stats)
    }
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).insert(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn compare_and_replace(&self, job: &Job, expected: JobStatus) -> Result<(), JobStoreError> {
        (**self).compare_and_replace(job, expected)
    }

    fn delete(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        (**self).delete(job_id)
    }

    fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(queue, now)
    }

    fn commit(
        &self,
        job_id: JobId,
        transition: &JobTransition,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        (**self).commit(job_id, transition, now)
    }

    fn list(
        &self,
        queue: &str,
        status: Option<JobStatus>,
        job_type: Option<&str>,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(queue, status, job_type)
    }

    fn next_due(&self, queue: &str) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        (**self).next_due(queue)
    }

    fn stats(&self, queue: &str) -> Result<JobStats, JobStoreError> {
        (**self).stats(queue)
    }
}
