//! Persistent deferred-job queue.
//!
//! ## Lifecycle
//!
//! A job is pushed `pending`, claimed into `progress` by exactly one worker,
//! then committed to `complete`, `failed`, or back to `pending` when a retry
//! or repeat is scheduled. Admin operations can abort or reset a job.
//!
//! ## Components
//!
//! - `Job`: persisted record with counters, failure log and schedule
//! - `JobTypeRegistry`: task, callbacks and policies per job type
//! - `JobStore`: atomic claim and compare-and-swap commits
//! - `JobWorker`: runs one claimed job and commits its next state
//! - `Queue`: producer and admin operations for one named queue
//! - `Dispatcher`: background threads feeding due jobs to a worker

mod guard;

pub mod dispatcher;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod store;
pub mod types;
pub mod worker;

pub use dispatcher::{DispatchSignal, Dispatcher, DispatcherHandle, DispatcherStats};
pub use policy::{
    CustomDelay, DEFAULT_BACK_OFF_BASE_MS, DelayPolicy, EffectivePolicy, FailureLimit,
    RepeatPolicy, back_off_delay, exponential_back_off, plan_transition,
};
pub use queue::{JobQueueError, PushOptions, Queue};
pub use registry::{JobType, JobTypeRegistry};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    BackOff, Deadline, Job, JobFailure, JobOutcome, JobStatus, JobTransition, RepeatCount,
};
pub use worker::{DelayNotifier, JobRunReport, JobWorker, NoopNotifier, WorkerError};
