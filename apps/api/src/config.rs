use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

const DEFAULT_MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;
/// Slack on top of the step timeouts before a silent attempt is presumed lost.
const LEASE_GRACE: Duration = Duration::from_secs(60);

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,
    pub rust_log: String,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub worker_enabled: bool,
    pub worker_concurrency: usize,
    pub broker_probe_interval: Duration,
    pub timeouts: PipelineTimeouts,
    /// How long a queued attempt may run before its job is redelivered.
    pub job_lease: Duration,
    pub anthropic_api_key: Option<String>,
    /// `None` when the S3 variables are absent or incomplete.
    pub remote_storage: Option<RemoteStorageConfig>,
}

/// Upper bounds for every suspension point of the processing routine.
#[derive(Debug, Clone, Copy)]
pub struct PipelineTimeouts {
    pub extract: Duration,
    pub analyze: Duration,
    pub storage: Duration,
}

impl PipelineTimeouts {
    /// Longest a single attempt can spend waiting on its collaborators.
    pub fn attempt_budget(&self) -> Duration {
        self.extract + self.analyze + self.storage
    }
}

impl Default for PipelineTimeouts {
    fn default() -> Self {
        Self {
            extract: Duration::from_secs(30),
            analyze: Duration::from_secs(120),
            storage: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStorageConfig {
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub force_path_style: bool,
}

impl RemoteStorageConfig {
    /// Builds the remote storage settings from a variable lookup.
    /// Returns `None` unless bucket and both credentials are all present.
    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bucket = non_empty("S3_BUCKET")?;
        let access_key_id = non_empty("S3_ACCESS_KEY_ID")?;
        let secret_access_key = non_empty("S3_SECRET_ACCESS_KEY")?;

        Some(Self {
            bucket,
            access_key_id,
            secret_access_key,
            region: non_empty("S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            endpoint: non_empty("S3_ENDPOINT"),
            force_path_style: non_empty("S3_FORCE_PATH_STYLE")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let defaults = PipelineTimeouts::default();
        let timeouts = PipelineTimeouts {
            extract: secs_env("EXTRACT_TIMEOUT_SECS", defaults.extract)?,
            analyze: secs_env("ANALYZE_TIMEOUT_SECS", defaults.analyze)?,
            storage: secs_env("STORAGE_TIMEOUT_SECS", defaults.storage)?,
        };
        let job_lease = secs_env("JOB_LEASE_SECS", timeouts.attempt_budget() + LEASE_GRACE)?;

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            port: parse_env("PORT", 5000)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            upload_dir: std::env::var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("uploads")),
            max_upload_bytes: parse_env("MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
            worker_enabled: parse_env("WORKER_ENABLED", true)?,
            worker_concurrency: parse_env("WORKER_CONCURRENCY", 2)?,
            broker_probe_interval: Duration::from_secs(parse_env("BROKER_PROBE_INTERVAL_SECS", 5)?),
            timeouts,
            job_lease,
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            remote_storage: RemoteStorageConfig::from_lookup(|key| std::env::var(key).ok()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} has an invalid value: '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn secs_env(key: &str, default: Duration) -> Result<Duration> {
    parse_env(key, default.as_secs()).map(Duration::from_secs)
}
