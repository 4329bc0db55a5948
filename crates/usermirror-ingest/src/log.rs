//! Per-run report verbosity.
//!
//! Each ingest or backfill call carries its own [`LogLevel`]. Reports about
//! individual events (skips, gaps, stale updates) go through a [`RunLog`] so
//! a noisy backfill can be run quietly without touching the global filter.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Verbosity threshold for per-event reports. Ordered from quietest to
/// noisiest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" | "trace" => Ok(Self::Debug),
            other => Err(Error::Config(format!("unknown log level '{other}'"))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        };
        f.write_str(s)
    }
}

/// Emits tracing events at or below the run's threshold.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunLog {
    level: LogLevel,
}

impl RunLog {
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.level
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Error) {
            tracing::error!("{}", args);
        }
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Warn) {
            tracing::warn!("{}", args);
        }
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Info) {
            tracing::info!("{}", args);
        }
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Debug) {
            tracing::debug!("{}", args);
        }
    }
}
