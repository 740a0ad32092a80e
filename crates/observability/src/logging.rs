//! Tracing subscriber initialization.
//!
//! `DEFERQ_LOG_FORMAT` selects `json` (default) or `pretty` output and
//! `RUST_LOG` filters, defaulting to `info`.

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

pub const LOG_FORMAT_KEY: &str = "DEFERQ_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log format {0:?}, expected \"json\" or \"pretty\"")]
pub struct UnknownLogFormat(pub String);

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            _ => Err(UnknownLogFormat(s.to_string())),
        }
    }
}

impl LogFormat {
    /// Format for a `DEFERQ_LOG_FORMAT` value; unset means JSON.
    pub fn from_setting(raw: Option<&str>) -> Result<Self, UnknownLogFormat> {
        raw.map_or(Ok(LogFormat::Json), str::parse)
    }
}

/// Initialize tracing with the format from the environment.
///
/// An unknown format falls back to JSON and is reported once the
/// subscriber is installed.
pub fn init() {
    let setting = std::env::var(LOG_FORMAT_KEY).ok();
    match LogFormat::from_setting(setting.as_deref()) {
        Ok(format) => init_with(format),
        Err(unknown) => {
            init_with(LogFormat::Json);
            tracing::warn!(error = %unknown, "falling back to json logs");
        }
    }
}

/// Initialize tracing with an explicit format.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_with(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true);

    let _ = match format {
        LogFormat::Json => builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}
