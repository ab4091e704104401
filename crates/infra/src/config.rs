//! Environment-driven configuration.
//!
//! Every setting has a default except the backend URLs; an absent
//! `DATABASE_URL` / `REDIS_URL` selects the in-memory backends (dev only).
//! A present but malformed value is an error, never silently defaulted.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use conduit_observability::LogFormat;

use crate::outbox::{OutboxProcessorConfig, RetryPolicy};
use crate::workers::RetentionPolicy;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str, reason: impl ToString) -> Self {
        ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Process configuration for the orchestration service.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub bind_addr: SocketAddr,
    pub outbox: OutboxProcessorConfig,
    pub idempotency_ttl: Duration,
    pub retention: RetentionPolicy,
    pub log_format: LogFormat,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            outbox: OutboxProcessorConfig::default(),
            idempotency_ttl: crate::command_handler::DEFAULT_IDEMPOTENCY_TTL,
            retention: RetentionPolicy::default(),
            log_format: LogFormat::Json,
        }
    }
}

impl OrchestratorConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = Self::default();

        let retry = RetryPolicy::exponential(
            env.parse("OUTBOX_MAX_ATTEMPTS", defaults.outbox.retry.max_attempts)?,
            env.millis("OUTBOX_BACKOFF_BASE_MS", defaults.outbox.retry.base_delay)?,
            env.millis("OUTBOX_BACKOFF_MAX_MS", defaults.outbox.retry.max_delay)?,
        );

        let outbox = OutboxProcessorConfig {
            batch_size: env.positive("OUTBOX_BATCH_SIZE", defaults.outbox.batch_size)?,
            max_concurrency: env.positive("OUTBOX_MAX_CONCURRENCY", defaults.outbox.max_concurrency)?,
            poll_min: env.millis("OUTBOX_POLL_MIN_MS", defaults.outbox.poll_min)?,
            poll_max: env.millis("OUTBOX_POLL_MAX_MS", defaults.outbox.poll_max)?,
            retry,
            shutdown_grace: env.millis("SHUTDOWN_GRACE_MS", defaults.outbox.shutdown_grace)?,
        };
        if outbox.poll_min > outbox.poll_max {
            return Err(ConfigError::invalid(
                "OUTBOX_POLL_MIN_MS",
                &outbox.poll_min.as_millis().to_string(),
                "must not exceed OUTBOX_POLL_MAX_MS",
            ));
        }

        let retention = RetentionPolicy {
            processed_outbox: env.secs("OUTBOX_RETENTION_SECS", defaults.retention.processed_outbox)?,
            transition_events: env.secs("EVENT_RETENTION_SECS", defaults.retention.transition_events)?,
            interval: defaults.retention.interval,
        };

        Ok(Self {
            database_url: env.string("DATABASE_URL"),
            redis_url: env.string("REDIS_URL"),
            bind_addr: env.parse("CONDUIT_BIND_ADDR", defaults.bind_addr)?,
            outbox,
            idempotency_ttl: env.secs("IDEMPOTENCY_TTL_SECS", defaults.idempotency_ttl)?,
            retention,
            log_format: env.parse("LOG_FORMAT", defaults.log_format)?,
        })
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-blank value, trimmed.
    fn string(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(var) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e| ConfigError::invalid(var, &raw, e)),
        }
    }

    fn positive(&self, var: &'static str, default: usize) -> Result<usize, ConfigError> {
        let value = self.parse(var, default)?;
        if value == 0 {
            return Err(ConfigError::invalid(var, "0", "must be greater than zero"));
        }
        Ok(value)
    }

    fn millis(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        match self.string(var) {
            None => Ok(default),
            Some(raw) => raw
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| ConfigError::invalid(var, &raw, e)),
        }
    }

    fn secs(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        match self.string(var) {
            None => Ok(default),
            Some(raw) => raw
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| ConfigError::invalid(var, &raw, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<OrchestratorConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OrchestratorConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[]).unwrap();
        assert!(cfg.database_url.is_none());
        assert!(cfg.redis_url.is_none());
        assert_eq!(cfg.bind_addr.port(), 8080);
        assert_eq!(cfg.outbox.batch_size, 50);
        assert_eq!(cfg.outbox.max_concurrency, 8);
        assert_eq!(cfg.outbox.poll_min, Duration::from_millis(100));
        assert_eq!(cfg.outbox.poll_max, Duration::from_millis(5000));
        assert_eq!(cfg.outbox.retry.max_attempts, 5);
        assert_eq!(cfg.idempotency_ttl, Duration::from_secs(86_400));
        assert_eq!(cfg.retention.processed_outbox, Duration::from_secs(604_800));
        assert_eq!(cfg.retention.transition_events, Duration::from_secs(7_776_000));
        assert_eq!(cfg.outbox.shutdown_grace, Duration::from_secs(10));
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn overrides_are_read() {
        let cfg = config(&[
            ("DATABASE_URL", "postgres://localhost/conduit"),
            ("REDIS_URL", " "),
            ("CONDUIT_BIND_ADDR", "127.0.0.1:9000"),
            ("OUTBOX_BATCH_SIZE", "10"),
            ("OUTBOX_MAX_ATTEMPTS", "2"),
            ("IDEMPOTENCY_TTL_SECS", "60"),
            ("LOG_FORMAT", "pretty"),
        ])
        .unwrap();

        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/conduit"));
        assert!(cfg.redis_url.is_none());
        assert_eq!(cfg.bind_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(cfg.outbox.batch_size, 10);
        assert_eq!(cfg.outbox.retry.max_attempts, 2);
        assert_eq!(cfg.idempotency_ttl, Duration::from_secs(60));
        assert_eq!(cfg.log_format, LogFormat::Pretty);
    }

    #[test]
    fn malformed_values_are_errors() {
        let err = config(&[("OUTBOX_BATCH_SIZE", "lots")]).unwrap_err();
        assert!(err.to_string().contains("OUTBOX_BATCH_SIZE"));

        assert!(config(&[("OUTBOX_MAX_CONCURRENCY", "0")]).is_err());
        assert!(config(&[("LOG_FORMAT", "xml")]).is_err());
        assert!(config(&[("OUTBOX_POLL_MIN_MS", "9000")]).is_err());
    }
}
