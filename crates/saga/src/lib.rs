//! Saga orchestration with compensating steps.
//!
//! A saga is an ordered list of [`SagaStep`]s. The [`SagaOrchestrator`] runs
//! them one at a time, checkpointing the durable [`store::SagaTransaction`]
//! after each, and on failure compensates the completed steps in reverse.
//! The [`StaleSagaRecoverer`] resumes sagas abandoned by a crash, finding
//! their steps again through the [`StepRegistry`].
//!
//! The [`steps`] module holds the order processing saga:
//! 1. Create order
//! 2. Send confirmation message (through the outbox)
//! 3. Update order status

pub mod config;
pub mod data;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod registry;
pub mod step;
pub mod steps;

pub use config::{CompensationPolicy, OrchestratorConfig, ParsePolicyError, RecoveryConfig};
pub use data::{CONTEXT_SCHEMA_VERSION, SagaData};
pub use error::{Result, SagaError};
pub use orchestrator::SagaOrchestrator;
pub use recovery::{RecoveryReport, SagaStatistics, StaleSagaRecoverer, saga_statistics};
pub use registry::StepRegistry;
pub use step::{SagaStep, SagaStepResult};
