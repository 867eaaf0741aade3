//! Orchestrator and recovery configuration.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// What to do when a compensating action fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompensationPolicy {
    /// Log the failure and keep compensating the remaining steps.
    #[default]
    BestEffort,
    /// Stop at the first failed compensation.
    FailFast,
}

impl CompensationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationPolicy::BestEffort => "best_effort",
            CompensationPolicy::FailFast => "fail_fast",
        }
    }
}

impl std::fmt::Display for CompensationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown compensation policy: {0}")]
pub struct ParsePolicyError(pub String);

impl FromStr for CompensationPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "best_effort" => Ok(CompensationPolicy::BestEffort),
            "fail_fast" => Ok(CompensationPolicy::FailFast),
            _ => Err(ParsePolicyError(s.to_string())),
        }
    }
}

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// A step that runs longer than this is treated as failed.
    pub step_timeout: Duration,
    pub compensation_policy: CompensationPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            compensation_policy: CompensationPolicy::BestEffort,
        }
    }
}

/// Stale saga recovery and retention tuning.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Sagas not updated for this long are considered abandoned.
    pub stale_timeout: Duration,
    /// Maximum sagas resumed per sweep.
    pub batch_size: usize,
    /// Terminal sagas older than this are deleted.
    pub retention: Duration,
    pub retention_batch_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_timeout: Duration::from_secs(5 * 60),
            batch_size: 100,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            retention_batch_size: 1000,
        }
    }
}
