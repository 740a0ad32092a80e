//! Worker configuration.
//!
//! Read from the environment:
//!
//! | key                       | default         |
//! |---------------------------|-----------------|
//! | `DEFERQ_QUEUE`            | `default`       |
//! | `DEFERQ_MAX_WORKERS`      | `1`             |
//! | `DEFERQ_POLL_INTERVAL_MS` | `1000`          |
//! | `DEFERQ_WORKER_NAME`      | `deferq-worker` |

use std::time::Duration;

pub const QUEUE_KEY: &str = "DEFERQ_QUEUE";
pub const MAX_WORKERS_KEY: &str = "DEFERQ_MAX_WORKERS";
pub const POLL_INTERVAL_KEY: &str = "DEFERQ_POLL_INTERVAL_MS";
pub const WORKER_NAME_KEY: &str = "DEFERQ_WORKER_NAME";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Name for logging and worker threads
    pub name: String,
    /// Queue to consume
    pub queue: String,
    /// Worker threads
    pub max_workers: usize,
    /// Longest idle wait between store polls
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "deferq-worker".to_string(),
            queue: "default".to_string(),
            max_workers: 1,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; missing or blank keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(name) = get(WORKER_NAME_KEY) {
            config.name = name;
        }
        if let Some(queue) = get(QUEUE_KEY) {
            config.queue = queue;
        }
        if let Some(raw) = get(MAX_WORKERS_KEY) {
            let max_workers: usize = parse(MAX_WORKERS_KEY, &raw)?;
            if max_workers == 0 {
                return Err(ConfigError::Invalid {
                    key: MAX_WORKERS_KEY,
                    value: raw,
                    reason: "must be at least 1".to_string(),
                });
            }
            config.max_workers = max_workers;
        }
        if let Some(raw) = get(POLL_INTERVAL_KEY) {
            config.poll_interval = Duration::from_millis(parse(POLL_INTERVAL_KEY, &raw)?);
        }

        Ok(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = WorkerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn reads_every_key() {
        let config = WorkerConfig::from_lookup(lookup(&[
            (QUEUE_KEY, "mail"),
            (MAX_WORKERS_KEY, "4"),
            (POLL_INTERVAL_KEY, " 250 "),
            (WORKER_NAME_KEY, "mailer"),
        ]))
        .unwrap();

        assert_eq!(config.queue, "mail");
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.name, "mailer");
    }

    #[test]
    fn blank_values_keep_defaults() {
        let config = WorkerConfig::from_lookup(lookup(&[(QUEUE_KEY, "  ")])).unwrap();
        assert_eq!(config.queue, "default");
    }

    #[test]
    fn rejects_zero_workers() {
        let err = WorkerConfig::from_lookup(lookup(&[(MAX_WORKERS_KEY, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: MAX_WORKERS_KEY, .. }));
    }

    #[test]
    fn rejects_malformed_interval() {
        let err = WorkerConfig::from_lookup(lookup(&[(POLL_INTERVAL_KEY, "soon")])).unwrap_err();
        assert!(err.to_string().starts_with("invalid DEFERQ_POLL_INTERVAL_MS=\"soon\""));
    }
}
