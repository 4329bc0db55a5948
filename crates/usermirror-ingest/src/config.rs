//! Daemon configuration loaded from environment variables.

use crate::apply::HandlerFailurePolicy;
use crate::error::{Error, Result};
use crate::feed::HttpFeedConfig;
use crate::log::LogLevel;
use crate::sync::{BackfillOptions, IngestOptions};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use usermirror_core::{DEFAULT_INITIAL_RANGE_HOURS, DEFAULT_PAGE_LIMIT};

/// Application configuration.
#[derive(Clone)]
pub struct Config {
    /// Upstream API key (bearer token).
    pub api_key: String,

    /// Upstream API root, without trailing slash.
    pub api_base_url: String,

    /// RocksDB directory for the mirror.
    pub db_path: PathBuf,

    /// Extra event types requested on top of the user lifecycle types.
    pub event_types: Vec<String>,

    pub log_level: LogLevel,

    /// Lookback for the very first live sync run.
    pub initial_range_hours: u64,

    pub create_user_on_update: bool,

    pub handler_failure_policy: HandlerFailurePolicy,

    /// How often the daemon triggers a live sync run.
    pub poll_interval: Duration,

    /// How often the daemon runs a reconciliation pass.
    pub backfill_interval: Duration,

    /// Prometheus port; 0 disables the exporter.
    pub metrics_port: u16,

    pub page_limit: usize,

    pub request_timeout: Duration,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_key", &"<redacted>")
            .field("api_base_url", &self.api_base_url)
            .field("db_path", &self.db_path)
            .field("event_types", &self.event_types)
            .field("log_level", &self.log_level)
            .field("initial_range_hours", &self.initial_range_hours)
            .field("create_user_on_update", &self.create_user_on_update)
            .field("handler_failure_policy", &self.handler_failure_policy)
            .field("poll_interval", &self.poll_interval)
            .field("backfill_interval", &self.backfill_interval)
            .field("metrics_port", &self.metrics_port)
            .field("page_limit", &self.page_limit)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `USERMIRROR_API_KEY`: Upstream API key
    ///
    /// Optional:
    /// - `USERMIRROR_API_BASE_URL`: API root (default: "https://api.workos.com")
    /// - `USERMIRROR_DB_PATH`: Mirror database directory (default: "./data/mirror")
    /// - `USERMIRROR_EVENT_TYPES`: Comma-separated extra event types
    /// - `USERMIRROR_LOG_LEVEL`: Per-event report level (default: "info")
    /// - `USERMIRROR_INITIAL_RANGE_HOURS`: First-run lookback (default: 168)
    /// - `USERMIRROR_CREATE_USER_ON_UPDATE`: Create users from updates (default: false)
    /// - `USERMIRROR_HANDLER_FAILURE_POLICY`: "keep-recorded" or "retry" (default: "keep-recorded")
    /// - `USERMIRROR_POLL_INTERVAL_SECS`: Live sync trigger interval (default: 60)
    /// - `USERMIRROR_BACKFILL_INTERVAL_SECS`: Reconciliation interval (default: 3600)
    /// - `USERMIRROR_METRICS_PORT`: Prometheus port, 0 disables (default: 9090)
    /// - `USERMIRROR_PAGE_LIMIT`: Events per feed page (default: 100)
    /// - `USERMIRROR_REQUEST_TIMEOUT_SECS`: Feed request timeout (default: 30)
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("USERMIRROR_API_KEY")
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("USERMIRROR_API_KEY is not set".to_string()))?;

        let api_base_url = std::env::var("USERMIRROR_API_BASE_URL")
            .unwrap_or_else(|_| HttpFeedConfig::default().base_url)
            .trim_end_matches('/')
            .to_string();

        let db_path = std::env::var("USERMIRROR_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/mirror"));

        let event_types: Vec<String> = std::env::var("USERMIRROR_EVENT_TYPES")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let config = Self {
            api_key,
            api_base_url,
            db_path,
            event_types,
            log_level: parse_var("USERMIRROR_LOG_LEVEL", LogLevel::Info)?,
            initial_range_hours: parse_var(
                "USERMIRROR_INITIAL_RANGE_HOURS",
                DEFAULT_INITIAL_RANGE_HOURS,
            )?,
            create_user_on_update: parse_var("USERMIRROR_CREATE_USER_ON_UPDATE", false)?,
            handler_failure_policy: parse_var(
                "USERMIRROR_HANDLER_FAILURE_POLICY",
                HandlerFailurePolicy::KeepRecorded,
            )?,
            poll_interval: Duration::from_secs(parse_var("USERMIRROR_POLL_INTERVAL_SECS", 60)?),
            backfill_interval: Duration::from_secs(parse_var(
                "USERMIRROR_BACKFILL_INTERVAL_SECS",
                3600,
            )?),
            metrics_port: parse_var("USERMIRROR_METRICS_PORT", 9090)?,
            page_limit: parse_var("USERMIRROR_PAGE_LIMIT", DEFAULT_PAGE_LIMIT)?,
            request_timeout: Duration::from_secs(parse_var(
                "USERMIRROR_REQUEST_TIMEOUT_SECS",
                30,
            )?),
        };

        if config.page_limit == 0 {
            return Err(Error::Config(
                "USERMIRROR_PAGE_LIMIT must be at least 1".to_string(),
            ));
        }

        tracing::info!(
            api_base_url = %config.api_base_url,
            db_path = %config.db_path.display(),
            extra_event_types = config.event_types.len(),
            log_level = %config.log_level,
            poll_interval_secs = config.poll_interval.as_secs(),
            backfill_interval_secs = config.backfill_interval.as_secs(),
            "usermirror configuration loaded"
        );

        Ok(config)
    }

    pub fn feed_config(&self) -> HttpFeedConfig {
        HttpFeedConfig {
            base_url: self.api_base_url.clone(),
            api_key: self.api_key.clone(),
            page_limit: self.page_limit,
            timeout: self.request_timeout,
        }
    }

    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            event_types: self.event_types.clone(),
            log_level: self.log_level,
            initial_range_hours: self.initial_range_hours,
            create_user_on_update: self.create_user_on_update,
        }
    }

    pub fn backfill_options(&self) -> BackfillOptions {
        BackfillOptions {
            event_types: self.event_types.clone(),
            log_level: self.log_level,
            create_user_on_update: self.create_user_on_update,
        }
    }
}

/// Read and parse an optional variable, falling back to `default` when unset
/// or blank.
fn parse_var<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {key} '{raw}': {e}"))),
        _ => Ok(default),
    }
}
