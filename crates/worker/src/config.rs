//! Worker configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use outbox::DispatcherConfig;
use saga::{CompensationPolicy, OrchestratorConfig, RecoveryConfig};

const DAY_SECS: u64 = 24 * 60 * 60;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Worker configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` / `PORT`: HTTP bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json`
/// - `DATABASE_URL`: PostgreSQL URL; the in-memory store is used when unset
/// - `OUTBOX_*`, `INBOX_*`, `SAGA_*`, `RETENTION_INTERVAL_SECS`: task tuning
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    pub outbox_poll_interval: Duration,
    pub outbox_batch_size: usize,
    pub outbox_publish_timeout: Duration,
    pub outbox_alert_attempts: i32,
    pub outbox_alert_age: Duration,
    pub outbox_retention: Duration,

    pub inbox_cleanup_interval: Duration,
    pub inbox_retention: Duration,

    pub saga_recovery_interval: Duration,
    pub saga_stale_timeout: Duration,
    pub saga_recovery_batch_size: usize,
    pub saga_retention: Duration,
    pub saga_retention_batch_size: usize,
    pub saga_step_timeout: Duration,
    pub saga_compensation_policy: CompensationPolicy,
    pub saga_stats_interval: Duration,

    pub retention_interval: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str, default: Duration| {
            parse(key).map(Duration::from_millis).unwrap_or(default)
        };
        let secs = |key: &str, default: Duration| {
            parse(key).map(Duration::from_secs).unwrap_or(default)
        };
        let days = |key: &str, default: Duration| {
            parse(key)
                .map(|d| Duration::from_secs(d * DAY_SECS))
                .unwrap_or(default)
        };
        let count = |key: &str, default: usize| {
            parse(key)
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(default)
        };

        Self {
            host: lookup("HOST").unwrap_or(d.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(d.port),
            log_level: lookup("RUST_LOG").unwrap_or(d.log_level),
            log_format: lookup("LOG_FORMAT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.log_format),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            database_max_connections: lookup("DATABASE_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.database_max_connections),

            outbox_poll_interval: millis("OUTBOX_POLL_INTERVAL_MS", d.outbox_poll_interval),
            outbox_batch_size: count("OUTBOX_BATCH_SIZE", d.outbox_batch_size),
            outbox_publish_timeout: millis("OUTBOX_PUBLISH_TIMEOUT_MS", d.outbox_publish_timeout),
            outbox_alert_attempts: lookup("OUTBOX_ALERT_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.outbox_alert_attempts),
            outbox_alert_age: secs("OUTBOX_ALERT_AGE_SECS", d.outbox_alert_age),
            outbox_retention: days("OUTBOX_RETENTION_DAYS", d.outbox_retention),

            inbox_cleanup_interval: secs("INBOX_CLEANUP_INTERVAL_SECS", d.inbox_cleanup_interval),
            inbox_retention: days("INBOX_RETENTION_DAYS", d.inbox_retention),

            saga_recovery_interval: secs("SAGA_RECOVERY_INTERVAL_SECS", d.saga_recovery_interval),
            saga_stale_timeout: secs("SAGA_STALE_TIMEOUT_SECS", d.saga_stale_timeout),
            saga_recovery_batch_size: count("SAGA_RECOVERY_BATCH_SIZE", d.saga_recovery_batch_size),
            saga_retention: days("SAGA_RETENTION_DAYS", d.saga_retention),
            saga_retention_batch_size: count(
                "SAGA_RETENTION_BATCH_SIZE",
                d.saga_retention_batch_size,
            ),
            saga_step_timeout: millis("SAGA_STEP_TIMEOUT_MS", d.saga_step_timeout),
            saga_compensation_policy: lookup("SAGA_COMPENSATION_POLICY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.saga_compensation_policy),
            saga_stats_interval: secs("SAGA_STATS_INTERVAL_SECS", d.saga_stats_interval),

            retention_interval: secs("RETENTION_INTERVAL_SECS", d.retention_interval),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            batch_size: self.outbox_batch_size,
            publish_timeout: self.outbox_publish_timeout,
            alert_attempts: self.outbox_alert_attempts,
            alert_age: self.outbox_alert_age,
            retention: self.outbox_retention,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            step_timeout: self.saga_step_timeout,
            compensation_policy: self.saga_compensation_policy,
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            stale_timeout: self.saga_stale_timeout,
            batch_size: self.saga_recovery_batch_size,
            retention: self.saga_retention,
            retention_batch_size: self.saga_retention_batch_size,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            database_max_connections: 10,

            outbox_poll_interval: Duration::from_millis(5000),
            outbox_batch_size: 50,
            outbox_publish_timeout: Duration::from_millis(5000),
            outbox_alert_attempts: 3,
            outbox_alert_age: Duration::from_secs(300),
            outbox_retention: Duration::from_secs(7 * DAY_SECS),

            inbox_cleanup_interval: Duration::from_secs(3600),
            inbox_retention: Duration::from_secs(7 * DAY_SECS),

            saga_recovery_interval: Duration::from_secs(30),
            saga_stale_timeout: Duration::from_secs(300),
            saga_recovery_batch_size: 100,
            saga_retention: Duration::from_secs(7 * DAY_SECS),
            saga_retention_batch_size: 1000,
            saga_step_timeout: Duration::from_millis(30_000),
            saga_compensation_policy: CompensationPolicy::BestEffort,
            saga_stats_interval: Duration::from_secs(60),

            retention_interval: Duration::from_secs(3600),
        }
    }
}
