//! Registry mapping job names to handlers.
//!
//! Populated once at process start and shared read-only afterwards. Looking
//! up an unregistered name is a validation error, raised before any
//! invocation is created.

use std::collections::HashMap;
use std::sync::Arc;

use super::builtin::{IncrementJob, PredictTextJob};
use super::Job;
use crate::error::{CadenceError, Result};

#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<&'static str, Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in jobs.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(IncrementJob::new());
        registry.register(PredictTextJob::default());
        registry
    }

    /// Register a handler under its own name, replacing any previous one.
    pub fn register<J: Job + 'static>(&mut self, job: J) -> &mut Self {
        self.register_arc(Arc::new(job))
    }

    pub fn register_arc(&mut self, job: Arc<dyn Job>) -> &mut Self {
        let name = job.name();
        if self.jobs.insert(name, job).is_some() {
            tracing::warn!(job = name, "Replacing registered job handler");
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.jobs.get(name).cloned()
    }

    /// Resolve a handler or fail with `UnknownJob`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Job>> {
        self.get(name).ok_or_else(|| CadenceError::unknown_job(name))
    }

    pub fn ensure_registered(&self, name: &str) -> Result<()> {
        self.resolve(name).map(|_| ())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.jobs.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, FailureClass};

    #[test]
    fn test_builtins_registered() {
        let registry = JobRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["increment", "predict_text"]);
        assert!(registry.contains("increment"));
    }

    #[test]
    fn test_unknown_job_is_validation_error() {
        let registry = JobRegistry::with_builtins();
        let err = registry.resolve("send_email").err().unwrap();
        assert_eq!(err.code(), ErrorCode::UnknownJob);
        assert_eq!(err.failure_class(), FailureClass::Validation);
    }
}
