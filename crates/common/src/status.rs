//! Persisted status enums and the saga state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returned when a stored status string is not a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} status: {value}")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

/// The lifecycle status of a saga transaction.
///
/// State transitions:
/// ```text
/// Started ──► Executing ──┬──► Completed
///                         └──► Compensating ──┬──► Compensated
///                                             └──► Failed
/// ```
///
/// `Executing` and `Compensating` may be re-entered by a resume after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Row created, no step has run yet.
    #[default]
    Started,

    /// Steps are being executed forward.
    Executing,

    /// A step failed and completed steps are being undone in reverse.
    Compensating,

    /// All steps completed successfully (terminal).
    Completed,

    /// Compensation finished after a failure (terminal).
    Compensated,

    /// Compensation could not be completed cleanly (terminal).
    Failed,
}

impl SagaStatus {
    /// Statuses a stale-saga sweep will try to resume.
    pub const RECOVERABLE: [SagaStatus; 3] = [
        SagaStatus::Started,
        SagaStatus::Executing,
        SagaStatus::Compensating,
    ];

    /// Statuses the retention sweep may delete once old enough.
    pub const RETAINABLE: [SagaStatus; 2] = [SagaStatus::Completed, SagaStatus::Compensated];

    /// All statuses, in lifecycle order.
    pub const ALL: [SagaStatus; 6] = [
        SagaStatus::Started,
        SagaStatus::Executing,
        SagaStatus::Compensating,
        SagaStatus::Completed,
        SagaStatus::Compensated,
        SagaStatus::Failed,
    ];

    /// Returns true if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        matches!(
            (self, next),
            (Started, Executing)
                | (Executing, Executing)
                | (Executing, Completed)
                | (Executing, Compensating)
                | (Compensating, Compensating)
                | (Compensating, Compensated)
                | (Compensating, Failed)
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed
        )
    }

    /// Returns the status name as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Started => "STARTED",
            SagaStatus::Executing => "EXECUTING",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Compensated => "COMPENSATED",
            SagaStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SagaStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError {
                kind: "saga",
                value: s.to_string(),
            })
    }
}

/// Delivery status of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Recorded, not yet confirmed by the transport.
    #[default]
    New,

    /// Published and confirmed by the transport.
    Sent,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::New => "NEW",
            OutboxStatus::Sent => "SENT",
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(OutboxStatus::New),
            "SENT" => Ok(OutboxStatus::Sent),
            other => Err(ParseStatusError {
                kind: "outbox",
                value: other.to_string(),
            }),
        }
    }
}
