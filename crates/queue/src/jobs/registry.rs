//! Job type registry.
//!
//! Job types are registered once per hosting process and handed to the
//! worker and queue explicitly. Policies and callbacks are plain callables
//! validated at registration, never source text evaluated at run time.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use deferq_core::{JobId, QueueError, QueueResult};

use super::policy::{DelayPolicy, RepeatPolicy};
use super::types::{Job, JobFailure};

/// Task function: `(data, job id) -> result`.
pub type JobHandler =
    Arc<dyn Fn(&serde_json::Value, &JobId) -> anyhow::Result<serde_json::Value> + Send + Sync>;

/// Called after a successful execution has been committed: `(result, data, job)`.
pub type SuccessCallback = Arc<
    dyn Fn(&serde_json::Value, &serde_json::Value, &Job) -> anyhow::Result<()> + Send + Sync,
>;

/// Called after a failed execution has been committed: `(failure, data, job)`.
pub type FailureCallback =
    Arc<dyn Fn(&JobFailure, &serde_json::Value, &Job) -> anyhow::Result<()> + Send + Sync>;

/// Payload check applied when a job is pushed.
pub type DataValidator = Arc<dyn Fn(&serde_json::Value) -> anyhow::Result<()> + Send + Sync>;

/// A named template describing how jobs of one kind execute.
#[derive(Clone)]
pub struct JobType {
    name: String,
    handler: JobHandler,
    max_failures: Option<i64>,
    back_off: Option<DelayPolicy>,
    repeat: RepeatPolicy,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
    validator: Option<DataValidator>,
}

impl JobType {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&serde_json::Value, &JobId) -> anyhow::Result<serde_json::Value>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            max_failures: None,
            back_off: None,
            repeat: RepeatPolicy::default(),
            on_success: None,
            on_failure: None,
            validator: None,
        }
    }

    /// Failures tolerated before a job is terminally failed; -1 is unlimited.
    pub fn with_max_failures(mut self, max_failures: i64) -> Self {
        self.max_failures = Some(max_failures);
        self
    }

    pub fn with_back_off(mut self, policy: DelayPolicy) -> Self {
        self.back_off = Some(policy);
        self
    }

    pub fn with_repeat(mut self, repeat: RepeatPolicy) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&serde_json::Value, &serde_json::Value, &Job) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&JobFailure, &serde_json::Value, &Job) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(f));
        self
    }

    pub fn with_validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&serde_json::Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &JobHandler {
        &self.handler
    }

    pub fn max_failures(&self) -> Option<i64> {
        self.max_failures
    }

    pub fn back_off(&self) -> Option<&DelayPolicy> {
        self.back_off.as_ref()
    }

    pub fn repeat(&self) -> &RepeatPolicy {
        &self.repeat
    }

    pub fn success_callback(&self) -> Option<&SuccessCallback> {
        self.on_success.as_ref()
    }

    pub fn failure_callback(&self) -> Option<&FailureCallback> {
        self.on_failure.as_ref()
    }

    pub fn validator(&self) -> Option<&DataValidator> {
        self.validator.as_ref()
    }
}

impl fmt::Debug for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobType")
            .field("name", &self.name)
            .field("max_failures", &self.max_failures)
            .field("back_off", &self.back_off)
            .field("repeat", &self.repeat)
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

/// Registry of job types and named delay policies.
#[derive(Default)]
pub struct JobTypeRegistry {
    types: RwLock<HashMap<String, Arc<JobType>>>,
    delay_policies: RwLock<HashMap<String, DelayPolicy>>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a job type. Names are unique.
    pub fn register(&self, job_type: JobType) -> QueueResult<()> {
        if job_type.name.trim().is_empty() {
            return Err(QueueError::validation("job type name must not be empty"));
        }

        let mut types = self.types.write().unwrap_or_else(|e| e.into_inner());
        if types.contains_key(&job_type.name) {
            return Err(QueueError::conflict(format!(
                "job type already registered: {}",
                job_type.name
            )));
        }
        types.insert(job_type.name.clone(), Arc::new(job_type));
        Ok(())
    }

    /// Register a delay policy that jobs can reference with `BackOff::Named`.
    pub fn register_delay_policy(
        &self,
        name: impl Into<String>,
        policy: DelayPolicy,
    ) -> QueueResult<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(QueueError::validation("delay policy name must not be empty"));
        }

        let mut policies = self.delay_policies.write().unwrap_or_else(|e| e.into_inner());
        if policies.contains_key(&name) {
            return Err(QueueError::conflict(format!(
                "delay policy already registered: {name}"
            )));
        }
        policies.insert(name, policy);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<JobType>> {
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        types.get(name).cloned()
    }

    pub fn delay_policy(&self, name: &str) -> Option<DelayPolicy> {
        let policies = self.delay_policies.read().unwrap_or_else(|e| e.into_inner());
        policies.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        types.contains_key(name)
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<_> = types.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for JobTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobTypeRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}
