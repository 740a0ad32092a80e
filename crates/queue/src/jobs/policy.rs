//! Failure, backoff and repeat policies, and the outcome interpretation that
//! turns one execution into the job's next state.
//!
//! Everything here is pure apart from the injected random source, so the
//! worker can compute a transition before touching storage.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use tracing::warn;

use super::guard::call_guarded;
use super::types::{Deadline, Job, JobFailure, JobOutcome, JobStatus, JobTransition, RepeatCount};

/// Base delay used when neither the job nor its type configures a backoff.
pub const DEFAULT_BACK_OFF_BASE_MS: u64 = 1000;

/// Randomized backoff for the `n`th (zero-indexed) consecutive failure, in ms.
///
/// Despite the name the curve is linear jitter, `floor(random * (n + 1)) * base`,
/// not a power of two. Stored queues depend on this exact formula.
pub fn exponential_back_off<R: Rng + ?Sized>(n: u32, base: u64, rng: &mut R) -> u64 {
    if n == 0 || base == 0 {
        return 0;
    }
    if base == 1 {
        return if rng.random_bool(0.5) { 0 } else { 1 };
    }
    let factor = (rng.random::<f64>() * (f64::from(n) + 1.0)).floor() as u64;
    factor.saturating_mul(base)
}

type DelayFn = dyn Fn(u32) -> anyhow::Result<Duration> + Send + Sync;

/// A caller-provided delay function, registered by name or attached to a type.
#[derive(Clone)]
pub struct CustomDelay(Arc<DelayFn>);

impl CustomDelay {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(u32) -> anyhow::Result<Duration> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    fn call(&self, n: u32) -> anyhow::Result<Duration> {
        call_guarded(|| (self.0)(n))
    }
}

impl fmt::Debug for CustomDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomDelay(..)")
    }
}

/// How long a failed job waits before it may be claimed again.
#[derive(Debug, Clone)]
pub enum DelayPolicy {
    /// `exponential_back_off` with this base, in milliseconds
    FixedBase(u64),
    Custom(CustomDelay),
}

impl DelayPolicy {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u32) -> anyhow::Result<Duration> + Send + Sync + 'static,
    {
        Self::Custom(CustomDelay::new(f))
    }

    /// Delay for the zero-indexed failure count `n`.
    pub fn compute<R: Rng + ?Sized>(&self, n: u32, rng: &mut R) -> anyhow::Result<Duration> {
        match self {
            DelayPolicy::FixedBase(base) => {
                Ok(Duration::from_millis(exponential_back_off(n, *base, rng)))
            }
            DelayPolicy::Custom(custom) => custom.call(n),
        }
    }
}

/// Resolve and evaluate the backoff for failure count `n`.
///
/// Job-level policy wins over type-level; with neither, the default base
/// applies. A custom policy that errors or panics also falls back to the
/// default base, never to the type-level policy.
pub fn back_off_delay<R: Rng + ?Sized>(
    n: u32,
    job_level: Option<&DelayPolicy>,
    type_level: Option<&DelayPolicy>,
    rng: &mut R,
) -> Duration {
    let default = |rng: &mut R| {
        Duration::from_millis(exponential_back_off(n, DEFAULT_BACK_OFF_BASE_MS, rng))
    };

    let Some(policy) = job_level.or(type_level) else {
        return default(rng);
    };

    match policy.compute(n, rng) {
        Ok(delay) => delay,
        Err(error) => {
            warn!(failure_count = n, error = %error, "custom backoff failed, using default base");
            default(rng)
        }
    }
}

/// How many failures a job tolerates before it is terminally failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureLimit {
    Unlimited,
    Max(u32),
}

impl Default for FailureLimit {
    fn default() -> Self {
        FailureLimit::Max(0)
    }
}

impl FailureLimit {
    /// Numeric encoding: `-1` is unlimited. Other negatives tolerate nothing.
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            -1 => FailureLimit::Unlimited,
            r if r < 0 => FailureLimit::Max(0),
            r => FailureLimit::Max(u32::try_from(r).unwrap_or(u32::MAX)),
        }
    }

    /// Job override, then type override, then zero.
    pub fn resolve(job_level: Option<i64>, type_level: Option<i64>) -> Self {
        job_level
            .or(type_level)
            .map(FailureLimit::from_raw)
            .unwrap_or_default()
    }

    pub fn is_exceeded_by(&self, run_failures: u32) -> bool {
        match self {
            FailureLimit::Unlimited => false,
            FailureLimit::Max(max) => run_failures > *max,
        }
    }
}

/// Rescheduling of a job after it leaves `progress` in a non-pending state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatPolicy {
    pub times: RepeatCount,
    pub until: Deadline,
    pub delay: Duration,
}

impl Default for RepeatPolicy {
    fn default() -> Self {
        Self {
            times: RepeatCount::Times(0),
            until: Deadline::Never,
            delay: Duration::ZERO,
        }
    }
}

impl RepeatPolicy {
    /// Repeat up to `times` runs, waiting `delay` between them.
    pub fn times(times: RepeatCount, delay: Duration) -> Self {
        Self {
            times,
            delay,
            ..Self::default()
        }
    }

    pub fn until(mut self, until: Deadline) -> Self {
        self.until = until;
        self
    }

    /// Job fields override the type's, one field at a time.
    pub fn resolve(job: &Job, type_level: &RepeatPolicy) -> Self {
        Self {
            times: job.repeat_times.unwrap_or(type_level.times),
            until: job.repeat_until.unwrap_or(type_level.until),
            delay: job.repeat_delay.unwrap_or(type_level.delay),
        }
    }

    pub fn is_due(&self, runs: u32, now: DateTime<Utc>) -> bool {
        self.times.allows(runs) && self.until.admits(now)
    }
}

/// Policies in effect for one job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EffectivePolicy {
    pub max_failures: FailureLimit,
    pub repeat: RepeatPolicy,
}

/// Interpret one execution outcome.
///
/// `back_off` receives the zero-indexed failure count and is only consulted
/// when a failed job goes back to `pending`.
pub fn plan_transition<F>(
    job: &Job,
    outcome: &JobOutcome,
    policy: &EffectivePolicy,
    now: DateTime<Utc>,
    back_off: F,
) -> JobTransition
where
    F: FnOnce(u32) -> Duration,
{
    let mut next = JobTransition {
        claim: job.claim,
        status: job.status,
        runs: job.runs,
        run_failures: job.run_failures,
        failure: None,
        delay_until: None,
    };

    match outcome {
        JobOutcome::Succeeded(_) => {
            next.runs = next.runs.saturating_add(1);
            next.status = JobStatus::Complete;
        }
        JobOutcome::Failed(message) => {
            next.run_failures = next.run_failures.saturating_add(1);
            next.failure = Some(JobFailure {
                run: next.run_failures,
                message: message.clone(),
                at: now,
            });

            if policy.max_failures.is_exceeded_by(next.run_failures) {
                next.status = JobStatus::Failed;
            } else {
                next.status = JobStatus::Pending;
                next.delay_until = Some(after(now, back_off(next.run_failures - 1)));
            }
        }
    }

    if next.status != JobStatus::Pending && policy.repeat.is_due(next.runs, now) {
        next.status = JobStatus::Pending;
        next.delay_until = Some(after(now, policy.repeat.delay));
        next.run_failures = 0;
    }

    next
}

/// `now + delay`, saturating at the latest representable instant.
fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
    now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
