//! Job record and the value types persisted with it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use deferq_core::JobId;

/// Job lifecycle status.
///
/// `pending -> progress` is performed by the claim, `progress -> *` by the
/// worker after execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `delay_until` to pass and a worker to claim it
    Pending,
    /// Claimed by a worker
    Progress,
    /// Finished successfully with no repeats left
    Complete,
    /// Exceeded its failure budget
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Progress => "progress",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job backoff override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackOff {
    /// Base delay in milliseconds. Negative values are ignored.
    Base(i64),
    /// A custom delay policy registered under this name.
    Named(String),
}

/// How many successful runs a repeating job may accumulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatCount {
    Unlimited,
    Times(u32),
}

impl RepeatCount {
    /// Numeric encoding: negative means unlimited.
    pub fn from_raw(raw: i64) -> Self {
        if raw < 0 {
            RepeatCount::Unlimited
        } else {
            RepeatCount::Times(u32::try_from(raw).unwrap_or(u32::MAX))
        }
    }

    pub fn allows(&self, runs: u32) -> bool {
        match self {
            RepeatCount::Unlimited => true,
            RepeatCount::Times(times) => runs < *times,
        }
    }
}

/// Upper bound on when a repeating job may be rescheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Deadline {
    Never,
    At(DateTime<Utc>),
}

impl Deadline {
    /// Numeric encoding (epoch milliseconds): negative means no bound.
    pub fn from_raw_millis(raw: i64) -> Self {
        if raw < 0 {
            return Deadline::Never;
        }
        match DateTime::<Utc>::from_timestamp_millis(raw) {
            Some(at) => Deadline::At(at),
            None => Deadline::Never,
        }
    }

    pub fn admits(&self, now: DateTime<Utc>) -> bool {
        match self {
            Deadline::Never => true,
            Deadline::At(at) => now <= *at,
        }
    }
}

/// One recorded execution failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Value of `run_failures` after this failure was counted
    pub run: u32,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// A persisted unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Queue the job was pushed to
    pub queue: String,
    /// Registered job type name
    pub job_type: String,
    /// Opaque payload handed to the task
    pub data: serde_json::Value,
    pub status: JobStatus,
    /// Bumped on every claim; a commit must present the claim it ran under
    #[serde(default)]
    pub claim: u64,
    /// Successful executions
    pub runs: u32,
    /// Failed executions since the last successful repeat cycle
    pub run_failures: u32,
    /// Every recorded failure, oldest first
    pub failures: Vec<JobFailure>,
    /// Overrides the job type's failure limit; -1 means unlimited
    pub max_failures: Option<i64>,
    pub back_off: Option<BackOff>,
    pub repeat_times: Option<RepeatCount>,
    pub repeat_until: Option<Deadline>,
    pub repeat_delay: Option<Duration>,
    /// Earliest time the job may be claimed
    pub delay_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a pending job that is due immediately.
    pub fn new(
        queue: impl Into<String>,
        job_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self::new_at(queue, job_type, data, Utc::now())
    }

    /// Create a pending job due at `now`, using the caller's notion of time.
    pub fn new_at(
        queue: impl Into<String>,
        job_type: impl Into<String>,
        data: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            job_type: job_type.into(),
            data,
            status: JobStatus::Pending,
            claim: 0,
            runs: 0,
            run_failures: 0,
            failures: Vec::new(),
            max_failures: None,
            back_off: None,
            repeat_times: None,
            repeat_until: None,
            repeat_delay: None,
            delay_until: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_max_failures(mut self, max_failures: i64) -> Self {
        self.max_failures = Some(max_failures);
        self
    }

    pub fn with_back_off(mut self, back_off: BackOff) -> Self {
        self.back_off = Some(back_off);
        self
    }

    pub fn with_repeat_times(mut self, times: RepeatCount) -> Self {
        self.repeat_times = Some(times);
        self
    }

    pub fn with_repeat_until(mut self, until: Deadline) -> Self {
        self.repeat_until = Some(until);
        self
    }

    pub fn with_repeat_delay(mut self, delay: Duration) -> Self {
        self.repeat_delay = Some(delay);
        self
    }

    /// Do not let the job be claimed before `at`.
    pub fn delayed_until(mut self, at: DateTime<Utc>) -> Self {
        self.delay_until = at;
        self
    }

    /// Whether the job may be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.delay_until <= now
    }

    /// Apply a post-execution transition.
    pub fn apply(&mut self, transition: &JobTransition, now: DateTime<Utc>) {
        self.status = transition.status;
        self.runs = transition.runs;
        self.run_failures = transition.run_failures;
        if let Some(failure) = &transition.failure {
            self.failures.push(failure.clone());
        }
        if let Some(at) = transition.delay_until {
            self.delay_until = at;
        }
        self.updated_at = now;
    }
}

/// Complete post-outcome state of a job, committed as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTransition {
    /// Claim of the execution this transition was planned for
    pub claim: u64,
    pub status: JobStatus,
    pub runs: u32,
    pub run_failures: u32,
    /// Failure to append to the job's history
    pub failure: Option<JobFailure>,
    /// New eligibility time; `None` leaves it unchanged
    pub delay_until: Option<DateTime<Utc>>,
}

/// Outcome of executing a job's task once.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded(serde_json::Value),
    Failed(String),
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_pending_and_due() {
        let now = Utc::now();
        let job = Job::new_at("default", "mail", serde_json::json!({"to": "a@b"}), now);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.runs, 0);
        assert_eq!(job.run_failures, 0);
        assert!(job.is_due(now));
    }

    #[test]
    fn delayed_job_is_not_due_early() {
        let now = Utc::now();
        let job = Job::new_at("default", "mail", serde_json::Value::Null, now)
            .delayed_until(now + chrono::Duration::seconds(5));

        assert!(!job.is_due(now));
        assert!(job.is_due(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn repeat_count_from_raw_treats_negative_as_unlimited() {
        assert_eq!(RepeatCount::from_raw(-1), RepeatCount::Unlimited);
        assert_eq!(RepeatCount::from_raw(3), RepeatCount::Times(3));
        assert!(RepeatCount::Unlimited.allows(u32::MAX - 1));
        assert!(RepeatCount::Times(3).allows(2));
        assert!(!RepeatCount::Times(3).allows(3));
    }

    #[test]
    fn deadline_from_raw_treats_negative_as_unbounded() {
        let now = Utc::now();
        assert_eq!(Deadline::from_raw_millis(-5), Deadline::Never);
        assert!(Deadline::Never.admits(now));

        let at = Deadline::from_raw_millis(now.timestamp_millis());
        assert!(at.admits(now - chrono::Duration::milliseconds(1)));
        assert!(!at.admits(now + chrono::Duration::seconds(1)));
    }

    #[test]
    fn apply_appends_failure_and_keeps_delay_when_unset() {
        let now = Utc::now();
        let mut job = Job::new_at("default", "mail", serde_json::Value::Null, now);
        job.status = JobStatus::Progress;

        let failure = JobFailure {
            run: 1,
            message: "smtp down".to_string(),
            at: now,
        };
        job.apply(
            &JobTransition {
                claim: 0,
                status: JobStatus::Failed,
                runs: 0,
                run_failures: 1,
                failure: Some(failure.clone()),
                delay_until: None,
            },
            now,
        );

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failures, vec![failure]);
        assert_eq!(job.delay_until, now);
    }

    #[test]
    fn job_record_serde_uses_snake_case_status() {
        let job = Job::new("default", "mail", serde_json::Value::Null)
            .with_back_off(BackOff::Base(250));
        let json = serde_json::to_value(&job).unwrap();

        assert_eq!(json["status"], "pending");
        assert_eq!(json["back_off"], serde_json::json!({"base": 250}));

        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }
}
