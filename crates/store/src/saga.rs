use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{SagaId, SagaStatus, Version};

/// Durable record of a saga's progress.
///
/// `steps` is fixed when the saga starts. `current_step` counts the steps
/// whose forward action has durably completed (during compensation it counts
/// the steps still awaiting their compensating action), so it always lies in
/// `0..=steps.len()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaTransaction {
    pub id: SagaId,

    /// The kind of saga (e.g., "CREATE_ORDER").
    pub saga_type: String,

    /// External correlation key supplied by the caller.
    pub business_id: String,

    pub status: SagaStatus,

    /// Ordered step names, matched against live implementations on resume.
    pub steps: Vec<String>,

    pub current_step: usize,

    /// Versioned snapshot of the saga context.
    pub context: serde_json::Value,

    pub error_message: Option<String>,

    /// Names of steps whose compensation failed.
    pub failed_compensations: Vec<String>,

    /// Row version for conditional updates.
    pub version: Version,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SagaTransaction {
    /// Creates a new transaction at step 0 with status `Started`.
    pub fn new(
        saga_type: impl Into<String>,
        business_id: impl Into<String>,
        steps: Vec<String>,
        context: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SagaId::new(),
            saga_type: saga_type.into(),
            business_id: business_id.into(),
            status: SagaStatus::Started,
            steps,
            current_step: 0,
            context,
            error_message: None,
            failed_compensations: Vec::new(),
            version: Version::initial(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Returns true once every step has been executed.
    pub fn all_steps_done(&self) -> bool {
        self.current_step >= self.steps.len()
    }

    /// Returns true if the row is in a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_transaction_starts_at_step_zero() {
        let saga = SagaTransaction::new(
            "CREATE_ORDER",
            "order-1",
            vec!["A".to_string(), "B".to_string()],
            serde_json::json!({}),
        );
        assert_eq!(saga.status, SagaStatus::Started);
        assert_eq!(saga.current_step, 0);
        assert_eq!(saga.version, Version::initial());
        assert!(saga.completed_at.is_none());
        assert!(!saga.all_steps_done());
    }
}
