//! Worker configuration loaded from the environment.
//!
//! | variable                      | default |
//! |-------------------------------|---------|
//! | `DATABASE_URL`                | none    |
//! | `DATABASE_MAX_CONNECTIONS`    | 10      |
//! | `OUTBOX_BATCH_SIZE`           | 100     |
//! | `OUTBOX_MAX_ATTEMPTS`         | 10      |
//! | `OUTBOX_PUBLISH_TIMEOUT_SECS` | 15      |
//! | `OUTBOX_SINK`                 | `log`   |
//! | `REDIS_URL`                   | `redis://localhost:6379` |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use outpost_events::RetryPolicy;
use outpost_events::retry::DEFAULT_MAX_ATTEMPTS;

use crate::dispatcher::{DEFAULT_BATCH_SIZE, DEFAULT_PUBLISH_TIMEOUT, DispatcherConfig};

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is not set")]
    Missing { name: &'static str },

    #[error("{name}={value:?} is invalid: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Where published events go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkKind {
    #[default]
    Log,
    Redis,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkKind::Log => "log",
            SinkKind::Redis => "redis",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(SinkKind::Log),
            "redis" => Ok(SinkKind::Redis),
            other => Err(format!("unknown sink '{other}' (expected log or redis)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub publish_timeout: Duration,
    pub sink: SinkKind,
    pub redis_url: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            sink: SinkKind::Log,
            redis_url: DEFAULT_REDIS_URL.to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset or blank variables keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            database_url: get("DATABASE_URL"),
            max_connections: parse_or(
                "DATABASE_MAX_CONNECTIONS",
                get("DATABASE_MAX_CONNECTIONS"),
                defaults.max_connections,
            )?,
            batch_size: parse_or("OUTBOX_BATCH_SIZE", get("OUTBOX_BATCH_SIZE"), defaults.batch_size)?,
            max_attempts: parse_or(
                "OUTBOX_MAX_ATTEMPTS",
                get("OUTBOX_MAX_ATTEMPTS"),
                defaults.max_attempts,
            )?,
            publish_timeout: parse_or(
                "OUTBOX_PUBLISH_TIMEOUT_SECS",
                get("OUTBOX_PUBLISH_TIMEOUT_SECS"),
                defaults.publish_timeout.as_secs(),
            )
            .map(Duration::from_secs)?,
            sink: parse_or("OUTBOX_SINK", get("OUTBOX_SINK"), defaults.sink)?,
            redis_url: get("REDIS_URL").unwrap_or(defaults.redis_url),
        }
        .validated()?)
    }

    /// Reject values that parse but make no sense.
    pub fn validated(self) -> Result<Self, ConfigError> {
        if self.max_connections == 0 {
            return Err(invalid("DATABASE_MAX_CONNECTIONS", "0", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(invalid("OUTBOX_BATCH_SIZE", "0", "must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("OUTBOX_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        if self.publish_timeout.is_zero() {
            return Err(invalid("OUTBOX_PUBLISH_TIMEOUT_SECS", "0", "must be at least 1"));
        }
        Ok(self)
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing { name: "DATABASE_URL" })
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_batch_size(self.batch_size)
            .with_publish_timeout(self.publish_timeout)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_attempts(self.max_attempts)
    }
}

fn parse_or<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(name, &value, e.to_string())),
    }
}

fn invalid(name: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.into(),
    }
}
