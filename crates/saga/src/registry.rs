//! Explicit mapping from step names to live step implementations.

use std::collections::HashMap;
use std::sync::Arc;

use store::SagaTransaction;

use crate::error::{Result, SagaError};
use crate::step::SagaStep;

/// Registered steps and the saga types built from them.
///
/// Populated at startup and then shared read-only. Recovery only ever finds
/// steps through this registry.
#[derive(Default, Clone)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn SagaStep>>,
    definitions: HashMap<String, Vec<String>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a step under its `step_name`.
    pub fn register(&mut self, step: Arc<dyn SagaStep>) -> Result<()> {
        let name = step.step_name().to_string();
        if self.steps.contains_key(&name) {
            return Err(SagaError::DuplicateStep(name));
        }
        self.steps.insert(name, step);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SagaStep>> {
        self.steps.get(name).cloned()
    }

    /// Looks up every name in order.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn SagaStep>>> {
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| SagaError::UnknownStep(name.clone()))
            })
            .collect()
    }

    /// Declares the ordered steps of a saga type.
    pub fn define<I, N>(&mut self, saga_type: impl Into<String>, step_names: I) -> Result<()>
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let names: Vec<String> = step_names.into_iter().map(Into::into).collect();
        if let Some(missing) = names.iter().find(|n| !self.steps.contains_key(*n)) {
            return Err(SagaError::UnknownStep(missing.clone()));
        }
        self.definitions.insert(saga_type.into(), names);
        Ok(())
    }

    /// Returns the defined steps of a saga type.
    pub fn steps_for(&self, saga_type: &str) -> Result<Vec<Arc<dyn SagaStep>>> {
        let names = self
            .definitions
            .get(saga_type)
            .ok_or_else(|| SagaError::UnknownSagaType(saga_type.to_string()))?;
        self.resolve(names)
    }

    /// Resolves the step list persisted with a saga.
    pub fn resolve_for(&self, saga: &SagaTransaction) -> Result<Vec<Arc<dyn SagaStep>>> {
        self.resolve(&saga.steps)
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("definitions", &self.definitions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SagaData, SagaStepResult};
    use async_trait::async_trait;

    struct Noop(&'static str);

    #[async_trait]
    impl SagaStep for Noop {
        fn step_name(&self) -> &str {
            self.0
        }

        async fn execute(&self, _data: &SagaData) -> Result<SagaStepResult> {
            Ok(SagaStepResult::success())
        }

        async fn compensate(&self, _data: &SagaData) -> Result<SagaStepResult> {
            Ok(SagaStepResult::success())
        }
    }

    fn registry() -> StepRegistry {
        let mut registry = StepRegistry::new();
        registry.register(Arc::new(Noop("A"))).unwrap();
        registry.register(Arc::new(Noop("B"))).unwrap();
        registry
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = registry();
        let result = registry.register(Arc::new(Noop("A")));
        assert!(matches!(result, Err(SagaError::DuplicateStep(name)) if name == "A"));
    }

    #[test]
    fn resolve_keeps_order_and_reports_unknown_names() {
        let registry = registry();
        let steps = registry
            .resolve(&["B".to_string(), "A".to_string()])
            .unwrap();
        let names: Vec<&str> = steps.iter().map(|s| s.step_name()).collect();
        assert_eq!(names, vec!["B", "A"]);

        let result = registry.resolve(&["A".to_string(), "GONE".to_string()]);
        assert!(matches!(result, Err(SagaError::UnknownStep(name)) if name == "GONE"));
    }

    #[test]
    fn definitions_resolve_by_saga_type() {
        let mut registry = registry();
        registry.define("TWO_STEP", ["A", "B"]).unwrap();
        assert_eq!(registry.steps_for("TWO_STEP").unwrap().len(), 2);
        assert!(matches!(
            registry.steps_for("NOPE"),
            Err(SagaError::UnknownSagaType(_))
        ));
        assert!(registry.define("BROKEN", ["A", "C"]).is_err());
    }
}
