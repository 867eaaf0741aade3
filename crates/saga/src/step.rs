//! The step capability implemented by business actions.

use async_trait::async_trait;

use crate::data::SagaData;
use crate::error::Result;

/// Outcome of executing or compensating a step.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaStepResult {
    pub success: bool,
    pub message: Option<String>,
    /// Entries to merge into the saga context.
    pub updated_data: Option<SagaData>,
}

impl SagaStepResult {
    pub fn success() -> Self {
        Self {
            success: true,
            message: None,
            updated_data: None,
        }
    }

    /// Success that writes `data` back into the saga context.
    pub fn success_with(data: SagaData) -> Self {
        Self {
            success: true,
            message: None,
            updated_data: Some(data),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            updated_data: None,
        }
    }

    pub fn failure_with(message: impl Into<String>, data: SagaData) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            updated_data: Some(data),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}

/// A single forward action of a saga and its compensating action.
///
/// `step_name` must be stable across deploys: it is persisted with every saga
/// and used to find the live implementation again on resume.
///
/// Returning `Err` from either action is treated like returning a failure
/// result.
#[async_trait]
pub trait SagaStep: Send + Sync {
    fn step_name(&self) -> &str;

    async fn execute(&self, data: &SagaData) -> Result<SagaStepResult>;

    async fn compensate(&self, data: &SagaData) -> Result<SagaStepResult>;

    /// Steps with nothing to undo return false and are skipped on compensation.
    fn is_compensable(&self) -> bool {
        true
    }
}
