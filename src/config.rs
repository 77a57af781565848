//! Configuration types, read from the environment.
//!
//! Each service reads only the settings it needs. `from_env()` delegates to
//! `from_lookup()` so the parsing can be exercised without touching the
//! process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::queue::DEFAULT_QUEUE_NAME;

/// Read an optional variable, parsing it when present.
fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

/// Read a required, non-empty variable.
fn required<F>(lookup: &F, key: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Task store location.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let path = lookup("URZA_DB_PATH")
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| "./data/urza.db".to_string());
        Self {
            path: PathBuf::from(path),
        }
    }
}

/// Work queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let name = lookup("URZA_QUEUE_NAME")
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string());
        Self { name }
    }
}

/// Orchestrator polling intervals.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often due cron schedules are evaluated.
    pub cron_check_interval: Duration,
    /// How often in-flight executions are checked against their deadline.
    pub timeout_check_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cron_check_interval: Duration::from_secs(60),
            timeout_check_interval: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let cron_secs: u64 = parse_or(&lookup, "URZA_CRON_CHECK_INTERVAL_SECS", 60)?;
        let timeout_secs: u64 = parse_or(&lookup, "URZA_TIMEOUT_CHECK_INTERVAL_SECS", 300)?;

        for (key, secs) in [
            ("URZA_CRON_CHECK_INTERVAL_SECS", cron_secs),
            ("URZA_TIMEOUT_CHECK_INTERVAL_SECS", timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "interval must be at least 1 second".to_string(),
                });
            }
        }

        Ok(Self {
            cron_check_interval: Duration::from_secs(cron_secs),
            timeout_check_interval: Duration::from_secs(timeout_secs),
        })
    }
}

/// Publisher settings.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Bounded wait on each blocking pop.
    pub poll_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(5),
        }
    }
}

impl PublisherConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let secs: u64 = parse_or(&lookup, "URZA_PUBLISHER_POLL_TIMEOUT_SECS", 5)?;
        Ok(Self {
            poll_timeout: Duration::from_secs(secs),
        })
    }
}

/// Telegram transport credentials and the monitored channel.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    /// Numeric chat id or `@channelname`.
    pub channel_id: String,
}

impl TelegramConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bot_token = SecretString::from(required(&lookup, "TELEGRAM_BOT_TOKEN")?);
        let channel_id = required(&lookup, "TELEGRAM_CHANNEL_ID")?;
        Ok(Self {
            bot_token,
            channel_id,
        })
    }
}

/// Reconciliation of PENDING executions that never reached the queue.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Only executions older than this are re-queued.
    pub stale_after: Duration,
}

impl ReconcileConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let secs: u64 = parse_or(&lookup, "URZA_RECONCILE_AFTER_SECS", 300)?;
        Ok(Self {
            stale_after: Duration::from_secs(secs),
        })
    }
}

/// Log output settings.
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Directory for daily rolling log files; stdout only when unset.
    pub log_dir: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            log_dir: lookup("URZA_LOG_DIR")
                .filter(|d| !d.trim().is_empty())
                .map(PathBuf::from),
        }
    }
}
