//! Configuration loading and representation.
//!
//! Everything comes from environment variables (a `.env` file is loaded by
//! the binaries before calling `AppConfig::from_env`). Unset keys fall back to
//! defaults; set-but-invalid keys are errors rather than silently ignored.

use std::path::PathBuf;
use std::time::Duration;

use crate::export::ExportLayout;
use crate::jobs::pool::WorkerPoolConfig;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub bind_address: String,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub batch_size: u64,
    pub export_dir: PathBuf,
    pub download_prefix: String,
    /// `None` when `JOB_TIMEOUT_SECS=0`
    pub job_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
    pub database_max_connections: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            bind_address: "0.0.0.0:8080".to_string(),
            worker_count: 4,
            queue_capacity: 100,
            batch_size: 5_000,
            export_dir: PathBuf::from("public/downloads"),
            download_prefix: "/jobs/downloads".to_string(),
            job_timeout: Some(Duration::from_secs(3600)),
            shutdown_grace: Duration::from_secs(30),
            database_max_connections: 10,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let timeout_secs: u64 = parse_or(&get, "JOB_TIMEOUT_SECS", 3600)?;
        let grace_secs: u64 = parse_or(&get, "SHUTDOWN_GRACE_SECS", defaults.shutdown_grace.as_secs())?;

        Ok(Self {
            database_url: get("DATABASE_URL"),
            bind_address: get("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            worker_count: positive(
                "WORKER_COUNT",
                parse_or(&get, "WORKER_COUNT", defaults.worker_count)?,
            )?,
            queue_capacity: positive(
                "QUEUE_CAPACITY",
                parse_or(&get, "QUEUE_CAPACITY", defaults.queue_capacity)?,
            )?,
            batch_size: positive("BATCH_SIZE", parse_or(&get, "BATCH_SIZE", defaults.batch_size)?)?,
            export_dir: get("EXPORT_DIR").map(PathBuf::from).unwrap_or(defaults.export_dir),
            download_prefix: get("DOWNLOAD_PREFIX").unwrap_or(defaults.download_prefix),
            job_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            shutdown_grace: Duration::from_secs(grace_secs),
            database_max_connections: positive(
                "DATABASE_MAX_CONNECTIONS",
                parse_or(&get, "DATABASE_MAX_CONNECTIONS", defaults.database_max_connections)?,
            )?,
        })
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn export_layout(&self) -> ExportLayout {
        ExportLayout::new(self.export_dir.clone(), self.download_prefix.clone())
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_worker_count(self.worker_count)
            .with_queue_capacity(self.queue_capacity)
            .with_job_timeout(self.job_timeout)
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn positive<T>(key: &'static str, value: T) -> Result<T, ConfigError>
where
    T: PartialOrd + Default + std::fmt::Display,
{
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        })
    }
}
