//! Name-to-factory registry for step and callback implementations.
//!
//! Model definitions refer to implementations by key (`class="transform"`).
//! Every available plugin registers a factory under its key at startup; the
//! loader asks the registry for a fresh instance per step definition.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::step::{CallbackStep, NopStep, Step};

/// Key of the built-in no-op step.
pub const NOP_STEP: &str = "nop";

/// Factory producing a step instance.
pub type StepFactory = Arc<dyn Fn() -> Arc<dyn Step> + Send + Sync>;

/// Factory producing a callback instance.
pub type CallbackFactory = Arc<dyn Fn() -> Arc<dyn CallbackStep> + Send + Sync>;

#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: BTreeMap<String, StepFactory>,
    callbacks: BTreeMap<String, CallbackFactory>,
}

impl StepRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in steps.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .steps
            .insert(NOP_STEP.to_string(), Arc::new(|| Arc::new(NopStep) as Arc<dyn Step>));
        registry
    }

    /// Register a step factory. Keys are unique.
    pub fn register_step<F>(&mut self, key: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn() -> Arc<dyn Step> + Send + Sync + 'static,
    {
        let key = key.into();
        if self.steps.contains_key(&key) {
            return Err(PipelineError::DuplicateId {
                kind: "step implementation",
                id: key,
                parent: "registry".into(),
            });
        }
        self.steps.insert(key, Arc::new(factory));
        Ok(())
    }

    /// Register a callback factory. Keys are unique.
    pub fn register_callback<F>(&mut self, key: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn() -> Arc<dyn CallbackStep> + Send + Sync + 'static,
    {
        let key = key.into();
        if self.callbacks.contains_key(&key) {
            return Err(PipelineError::DuplicateId {
                kind: "callback implementation",
                id: key,
                parent: "registry".into(),
            });
        }
        self.callbacks.insert(key, Arc::new(factory));
        Ok(())
    }

    pub fn create_step(&self, key: &str) -> Result<Arc<dyn Step>> {
        self.steps
            .get(key)
            .map(|factory| factory())
            .ok_or_else(|| PipelineError::UnknownStep(key.to_string()))
    }

    pub fn create_callback(&self, key: &str) -> Result<Arc<dyn CallbackStep>> {
        self.callbacks
            .get(key)
            .map(|factory| factory())
            .ok_or_else(|| PipelineError::UnknownCallback(key.to_string()))
    }

    pub fn has_step(&self, key: &str) -> bool {
        self.steps.contains_key(key)
    }

    pub fn step_keys(&self) -> Vec<&str> {
        self.steps.keys().map(String::as_str).collect()
    }

    pub fn callback_keys(&self) -> Vec<&str> {
        self.callbacks.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.step_keys())
            .field("callbacks", &self.callback_keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_contain_nop() {
        let registry = StepRegistry::with_builtins();
        assert!(registry.has_step(NOP_STEP));
        assert!(registry.create_step(NOP_STEP).is_ok());
        assert!(registry.callback_keys().is_empty());
    }

    #[test]
    fn test_unknown_keys() {
        let registry = StepRegistry::new();
        assert!(matches!(
            registry.create_step("transform"),
            Err(PipelineError::UnknownStep(k)) if k == "transform"
        ));
        assert!(matches!(
            registry.create_callback("notify"),
            Err(PipelineError::UnknownCallback(_))
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = StepRegistry::with_builtins();
        let err = registry
            .register_step(NOP_STEP, || Arc::new(NopStep) as Arc<dyn Step>)
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_each_create_is_a_new_instance() {
        let mut registry = StepRegistry::new();
        registry
            .register_step("noop", || Arc::new(NopStep) as Arc<dyn Step>)
            .unwrap();
        let a = registry.create_step("noop").unwrap();
        let b = registry.create_step("noop").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
