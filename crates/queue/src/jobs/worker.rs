//! Job worker: executes one claimed job and commits its next state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, error, info, warn};

use deferq_core::{Clock, JobId, SystemClock};

use super::guard::call_guarded;
use super::policy::{
    DEFAULT_BACK_OFF_BASE_MS, DelayPolicy, EffectivePolicy, FailureLimit, RepeatPolicy,
    back_off_delay, plan_transition,
};
use super::registry::{JobType, JobTypeRegistry};
use super::store::{JobStore, JobStoreError};
use super::types::{BackOff, Job, JobFailure, JobOutcome, JobStatus};

/// Told whenever a job (re)enters `pending`, so dispatchers can recompute
/// when the next job becomes due.
pub trait DelayNotifier: Send + Sync {
    fn recompute_delay(&self, queue: &str);
}

/// Notifier for setups without a dispatcher.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl DelayNotifier for NoopNotifier {
    fn recompute_delay(&self, _queue: &str) {}
}

impl<N: DelayNotifier + ?Sized> DelayNotifier for Arc<N> {
    fn recompute_delay(&self, queue: &str) {
        (**self).recompute_delay(queue)
    }
}

/// Worker error.
///
/// Only storage failures surface; task, backoff and callback failures are
/// absorbed into the job's state or the log.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to commit job {id}: {source}")]
    Commit {
        id: JobId,
        #[source]
        source: JobStoreError,
    },
}

/// Result of one worker invocation.
#[derive(Debug, Clone)]
pub struct JobRunReport {
    /// The job as committed
    pub job: Job,
    pub outcome: JobOutcome,
}

/// Executes claimed jobs against a registry and commits the result.
///
/// Holds no per-job state: one instance can serve any number of jobs and
/// threads, as long as each job was claimed exactly once.
pub struct JobWorker<S: JobStore> {
    registry: Arc<JobTypeRegistry>,
    store: S,
    notifier: Arc<dyn DelayNotifier>,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
}

impl<S: JobStore> JobWorker<S> {
    pub fn new(registry: Arc<JobTypeRegistry>, store: S) -> Self {
        Self {
            registry,
            store,
            notifier: Arc::new(NoopNotifier),
            clock: Arc::new(SystemClock),
            rng: Mutex::new(StdRng::from_os_rng()),
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

    /// Make backoff jitter reproducible.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &Arc<JobTypeRegistry> {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Execute a job already marked `progress` and commit its next state.
    ///
    /// On a commit failure nothing else happens: the job stays claimed and no
    /// callback runs.
    pub fn run(&self, job: Job) -> Result<JobRunReport, WorkerError> {
        let job_type = self.registry.get(&job.job_type);
        let job_type = job_type.as_deref();

        debug!(job_id = %job.id, job_type = %job.job_type, runs = job.runs, "executing job");
        let outcome = self.execute(&job, job_type);

        let now = self.clock.now();
        let policy = effective_policy(&job, job_type);
        let transition = plan_transition(&job, &outcome, &policy, now, |n| {
            self.delay_for_failure(&job, job_type, n)
        });

        let committed = self
            .store
            .commit(job.id, &transition, now)
            .map_err(|source| {
                error!(job_id = %job.id, error = %source, "failed to commit job transition");
                WorkerError::Commit { id: job.id, source }
            })?;

        match committed.status {
            JobStatus::Complete => {
                info!(job_id = %committed.id, runs = committed.runs, "job complete")
            }
            JobStatus::Failed => warn!(
                job_id = %committed.id,
                run_failures = committed.run_failures,
                "job failed permanently"
            ),
            JobStatus::Pending => debug!(
                job_id = %committed.id,
                delay_until = %committed.delay_until,
                "job rescheduled"
            ),
            JobStatus::Progress => {}
        }

        if committed.status == JobStatus::Pending {
            self.notifier.recompute_delay(&committed.queue);
        }

        if let Some(job_type) = job_type {
            notify_callbacks(job_type, &outcome, transition.failure.as_ref(), &committed);
        }

        Ok(JobRunReport {
            job: committed,
            outcome,
        })
    }

    fn execute(&self, job: &Job, job_type: Option<&JobType>) -> JobOutcome {
        let Some(job_type) = job_type else {
            warn!(job_id = %job.id, job_type = %job.job_type, "no registered job type");
            return JobOutcome::Failed(format!("unknown job type: {}", job.job_type));
        };

        let handler = job_type.handler();
        match call_guarded(|| handler(&job.data, &job.id)) {
            Ok(result) => JobOutcome::Succeeded(result),
            Err(error) => {
                warn!(job_id = %job.id, job_type = %job.job_type, error = %error, "job execution failed");
                JobOutcome::Failed(format!("{error:#}"))
            }
        }
    }

    fn delay_for_failure(&self, job: &Job, job_type: Option<&JobType>, n: u32) -> Duration {
        let job_level = match &job.back_off {
            Some(BackOff::Base(base)) => u64::try_from(*base).ok().map(DelayPolicy::FixedBase),
            Some(BackOff::Named(name)) => match self.registry.delay_policy(name) {
                Some(policy) => Some(policy),
                None => {
                    warn!(job_id = %job.id, policy = %name, "unknown delay policy, using default base");
                    Some(DelayPolicy::FixedBase(DEFAULT_BACK_OFF_BASE_MS))
                }
            },
            None => None,
        };

        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        back_off_delay(
            n,
            job_level.as_ref(),
            job_type.and_then(JobType::back_off),
            &mut *rng,
        )
    }
}

fn effective_policy(job: &Job, job_type: Option<&JobType>) -> EffectivePolicy {
    let type_repeat = job_type.map(|t| *t.repeat()).unwrap_or_default();
    EffectivePolicy {
        max_failures: FailureLimit::resolve(
            job.max_failures,
            job_type.and_then(JobType::max_failures),
        ),
        repeat: RepeatPolicy::resolve(job, &type_repeat),
    }
}

fn notify_callbacks(
    job_type: &JobType,
    outcome: &JobOutcome,
    failure: Option<&JobFailure>,
    job: &Job,
) {
    let result = match (outcome, failure) {
        (JobOutcome::Succeeded(value), _) => match job_type.success_callback() {
            Some(callback) => call_guarded(|| callback(value, &job.data, job)),
            None => return,
        },
        (JobOutcome::Failed(_), Some(failure)) => match job_type.failure_callback() {
            Some(callback) => call_guarded(|| callback(failure, &job.data, job)),
            None => return,
        },
        (JobOutcome::Failed(_), None) => return,
    };

    if let Err(error) = result {
        warn!(job_id = %job.id, job_type = %job.job_type, error = %error, "job callback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{DateTime, Utc};
    use deferq_core::ManualClock;

    use crate::jobs::policy::RepeatPolicy;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::RepeatCount;

    #[derive(Default)]
    struct CountingNotifier(AtomicUsize);

    impl DelayNotifier for CountingNotifier {
        fn recompute_delay(&self, _queue: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        clock: Arc<ManualClock>,
        notifier: Arc<CountingNotifier>,
        worker: JobWorker<Arc<InMemoryJobStore>>,
    }

    fn fixture(registry: JobTypeRegistry) -> Fixture {
        let store = InMemoryJobStore::arc();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let notifier = Arc::new(CountingNotifier::default());
        let worker = JobWorker::new(Arc::new(registry), store.clone())
            .with_clock(clock.clone())
            .with_notifier(notifier.clone())
            .with_rng_seed(11);
        Fixture {
            store,
            clock,
            notifier,
            worker,
        }
    }

    fn claim(f: &Fixture, job: Job) -> Job {
        f.store.insert(job).unwrap();
        f.store.claim_next("default", f.clock.now()).unwrap().unwrap()
    }

    fn failing(name: &str) -> JobType {
        JobType::new(name, |_, _| Err(anyhow::anyhow!("task broke")))
    }

    fn succeeding(name: &str) -> JobType {
        JobType::new(name, |data, _| Ok(serde_json::json!({"echo": data})))
    }

    #[test]
    fn success_completes_job() {
        let registry = JobTypeRegistry::new();
        registry.register(succeeding("echo")).unwrap();
        let f = fixture(registry);
        let job = claim(&f, Job::new_at("default", "echo", serde_json::json!(3), f.clock.now()));

        let report = f.worker.run(job).unwrap();

        assert_eq!(report.job.status, JobStatus::Complete);
        assert_eq!(report.job.runs, 1);
        assert_eq!(report.outcome, JobOutcome::Succeeded(serde_json::json!({"echo": 3})));
        assert_eq!(f.notifier.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failure_with_default_limit_is_terminal() {
        let registry = JobTypeRegistry::new();
        registry.register(failing("broken")).unwrap();
        let f = fixture(registry);
        let job = claim(&f, Job::new_at("default", "broken", serde_json::Value::Null, f.clock.now()));

        let report = f.worker.run(job).unwrap();

        assert_eq!(report.job.status, JobStatus::Failed);
        assert_eq!(report.job.run_failures, 1);
        assert_eq!(report.job.failures.len(), 1);
        assert_eq!(report.job.failures[0].message, "task broke");
    }

    #[test]
    fn unlimited_failures_reschedule_and_notify() {
        let registry = JobTypeRegistry::new();
        registry.register(failing("broken").with_max_failures(-1)).unwrap();
        let f = fixture(registry);
        let now = f.clock.now();
        let job = claim(
            &f,
            Job::new_at("default", "broken", serde_json::Value::Null, now)
                .with_back_off(BackOff::Base(0)),
        );

        let report = f.worker.run(job).unwrap();

        assert_eq!(report.job.status, JobStatus::Pending);
        assert_eq!(report.job.delay_until, now);
        assert_eq!(f.notifier.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn job_limit_overrides_type_limit() {
        let registry = JobTypeRegistry::new();
        registry.register(failing("broken").with_max_failures(5)).unwrap();
        let f = fixture(registry);
        let job = claim(
            &f,
            Job::new_at("default", "broken", serde_json::Value::Null, f.clock.now()).with_max_failures(0),
        );

        assert_eq!(f.worker.run(job).unwrap().job.status, JobStatus::Failed);
    }

    #[test]
    fn named_custom_backoff_is_used() {
        let registry = JobTypeRegistry::new();
        registry.register(failing("broken").with_max_failures(3)).unwrap();
        registry
            .register_delay_policy("steady", DelayPolicy::custom(|_| Ok(Duration::from_secs(9))))
            .unwrap();
        let f = fixture(registry);
        let now = f.clock.now();
        let job = claim(
            &f,
            Job::new_at("default", "broken", serde_json::Value::Null, now)
                .with_back_off(BackOff::Named("steady".into())),
        );

        let report = f.worker.run(job).unwrap();

        assert_eq!(report.job.delay_until, now + chrono::Duration::seconds(9));
    }

    #[test]
    fn type_custom_backoff_applies_without_job_override() {
        let registry = JobTypeRegistry::new();
        registry
            .register(
                failing("broken")
                    .with_max_failures(3)
                    .with_back_off(DelayPolicy::custom(|n| Ok(Duration::from_millis(100 + u64::from(n))))),
            )
            .unwrap();
        let f = fixture(registry);
        let now = f.clock.now();
        let mut job = Job::new_at("default", "broken", serde_json::Value::Null, now);
        job.run_failures = 2;
        let job = claim(&f, job);

        let report = f.worker.run(job).unwrap();

        assert_eq!(report.job.run_failures, 3);
        assert_eq!(report.job.delay_until, now + chrono::Duration::milliseconds(102));
    }

    #[test]
    fn negative_job_base_falls_back_to_type_policy() {
        let registry = JobTypeRegistry::new();
        registry
            .register(
                failing("broken")
                    .with_max_failures(3)
                    .with_back_off(DelayPolicy::custom(|_| Ok(Duration::from_secs(4)))),
            )
            .unwrap();
        let f = fixture(registry);
        let now = f.clock.now();
        let job = claim(
            &f,
            Job::new_at("default", "broken", serde_json::Value::Null, now).with_back_off(BackOff::Base(-10)),
        );

        let report = f.worker.run(job).unwrap();

        assert_eq!(report.job.delay_until, now + chrono::Duration::seconds(4));
    }

    #[test]
    fn panicking_task_counts_as_failure() {
        let registry = JobTypeRegistry::new();
        registry
            .register(JobType::new("panics", |_, _| panic!("handler exploded")))
            .unwrap();
        let f = fixture(registry);
        let job = claim(&f, Job::new_at("default", "panics", serde_json::Value::Null, f.clock.now()));

        let report = f.worker.run(job).unwrap();

        assert_eq!(report.job.status, JobStatus::Failed);
        assert!(report.job.failures[0].message.contains("handler exploded"));
    }

    #[test]
    fn unknown_type_fails_the_job() {
        let f = fixture(JobTypeRegistry::new());
        let job = claim(&f, Job::new_at("default", "ghost", serde_json::Value::Null, f.clock.now()));

        let report = f.worker.run(job).unwrap();

        assert_eq!(report.job.status, JobStatus::Failed);
        assert_eq!(report.job.failures[0].message, "unknown job type: ghost");
    }

    #[test]
    fn repeating_job_is_rescheduled_after_success() {
        let registry = JobTypeRegistry::new();
        registry
            .register(succeeding("tick").with_repeat(RepeatPolicy::times(
                RepeatCount::Times(3),
                Duration::from_secs(30),
            )))
            .unwrap();
        let f = fixture(registry);
        let now = f.clock.now();
        let job = claim(&f, Job::new_at("default", "tick", serde_json::Value::Null, now));

        let report = f.worker.run(job).unwrap();

        assert_eq!(report.job.status, JobStatus::Pending);
        assert_eq!(report.job.runs, 1);
        assert_eq!(report.job.run_failures, 0);
        assert_eq!(report.job.delay_until, now + chrono::Duration::seconds(30));
        assert_eq!(f.notifier.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn huge_repeat_delay_reschedules_at_the_latest_instant() {
        let registry = JobTypeRegistry::new();
        registry.register(succeeding("tick")).unwrap();
        let f = fixture(registry);
        let job = Job::new_at("default", "tick", serde_json::Value::Null, f.clock.now())
            .with_repeat_times(RepeatCount::Unlimited)
            .with_repeat_delay(Duration::from_secs(10_000_000_000_000));
        let job = claim(&f, job);

        let report = f.worker.run(job).unwrap();

        assert_eq!(report.job.status, JobStatus::Pending);
        assert_eq!(report.job.delay_until, DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            f.store.get(report.job.id).unwrap().unwrap().status,
            JobStatus::Pending
        );
    }

    #[test]
    fn unbounded_custom_back_off_keeps_the_job_waiting() {
        let registry = JobTypeRegistry::new();
        registry
            .register(
                failing("broken")
                    .with_max_failures(-1)
                    .with_back_off(DelayPolicy::custom(|_| Ok(Duration::MAX))),
            )
            .unwrap();
        let f = fixture(registry);
        let now = f.clock.now();
        let job = claim(&f, Job::new_at("default", "broken", serde_json::Value::Null, now));

        let report = f.worker.run(job).unwrap();

        assert_eq!(report.job.status, JobStatus::Pending);
        assert!(report.job.delay_until > now);
        assert!(f.store.claim_next("default", now).unwrap().is_none());
    }

    #[test]
    fn commit_failure_propagates_and_skips_callbacks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let registry = JobTypeRegistry::new();
        registry
            .register(succeeding("echo").on_success(move |_, _, _| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        let f = fixture(registry);

        // Never claimed, so the store rejects the commit
        let job = Job::new_at("default", "echo", serde_json::Value::Null, f.clock.now());
        f.store.insert(job.clone()).unwrap();

        let err = f.worker.run(job.clone()).unwrap_err();

        assert!(matches!(err, WorkerError::Commit { id, .. } if id == job.id));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.store.get(job.id).unwrap().unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn callbacks_receive_result_data_and_job() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let registry = JobTypeRegistry::new();
        registry
            .register(succeeding("echo").on_success(move |result, data, job| {
                sink.lock().unwrap().push((result.clone(), data.clone(), job.status));
                Ok(())
            }))
            .unwrap();
        let f = fixture(registry);
        let job = claim(&f, Job::new_at("default", "echo", serde_json::json!("hi"), f.clock.now()));

        f.worker.run(job).unwrap();

        let results = results.lock().unwrap();
        assert_eq!(
            *results,
            vec![(
                serde_json::json!({"echo": "hi"}),
                serde_json::json!("hi"),
                JobStatus::Complete
            )]
        );
    }

    #[test]
    fn throwing_callbacks_do_not_touch_committed_state() {
        let job_types = [
            failing("broken")
                .with_max_failures(2)
                .on_failure(|_, _, _| Err(anyhow::anyhow!("callback broke"))),
            succeeding("echo").on_success(|_, _, _| panic!("callback exploded")),
        ];

        for job_type in job_types {
            let name = job_type.name().to_string();
            let registry = JobTypeRegistry::new();
            registry.register(job_type).unwrap();
            let f = fixture(registry);

            let job = claim(&f, Job::new_at("default", name, serde_json::Value::Null, f.clock.now()));
            let report = f.worker.run(job).unwrap();
            let stored = f.store.get(report.job.id).unwrap().unwrap();

            assert_eq!(stored, report.job);
            assert_eq!(stored.status, report.job.status);
            assert_eq!(stored.runs, report.job.runs);
            assert_eq!(stored.run_failures, report.job.run_failures);
            assert_eq!(stored.delay_until, report.job.delay_until);
        }
    }

    #[test]
    fn failure_callback_receives_the_recorded_failure() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let registry = JobTypeRegistry::new();
        registry
            .register(failing("broken").on_failure(move |failure, _, job| {
                *sink.lock().unwrap() = Some((failure.clone(), job.status));
                Ok(())
            }))
            .unwrap();
        let f = fixture(registry);
        let job = claim(&f, Job::new_at("default", "broken", serde_json::Value::Null, f.clock.now()));

        f.worker.run(job).unwrap();

        let (failure, status) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(failure.run, 1);
        assert_eq!(failure.message, "task broke");
        assert_eq!(status, JobStatus::Failed);
    }
}
