//! The `Step` trait — the unit of work a pipeline executes.
//!
//! Steps receive the flattened call params plus a read view of the run's
//! DataStore, and hand back a values envelope. The `context` and `output`
//! tables inside the envelope have merge semantics (see `datastore`); any
//! other top-level key lands in the flat param space visible to later steps.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::datastore::DataStore;
use pipeclaw_core::Result;

/// An invokable pipeline step. Implementations live outside the engine
/// (HTTP calls, content generation, platform posting, …) — the runner only
/// cares about this contract.
#[async_trait]
pub trait Step: Send + Sync {
    /// Identifier used in task pipelines.
    fn name(&self) -> &str;

    /// Run the step. `params` is the flattened parameter space (task params
    /// plus values earlier steps returned outside `context`/`output`);
    /// `store` gives read access to accumulated context and outputs.
    ///
    /// Failures are `PipeclawError::Step`; set `retryable = false` to
    /// override the task's retry policy.
    async fn execute(&self, params: &Map<String, Value>, store: &DataStore) -> Result<StepOutput>;
}

/// Values a step hands back to the runner.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// Returned-values envelope. Recognized keys: `context` (table,
    /// suffix-append merge), `output` (table, overwrite merge),
    /// `delete_context` (key or list of keys to drop). Everything else is
    /// merged into the flat param space.
    pub values: Map<String, Value>,
    /// End the pipeline early, successfully. Remaining steps are skipped.
    pub should_exit: bool,
}

impl StepOutput {
    /// An empty result — the step ran, returned nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a context value (accumulating namespace).
    pub fn context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.namespace_insert("context", key, value.into());
        self
    }

    /// Add an output value (overwriting namespace).
    pub fn output(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.namespace_insert("output", key, value.into());
        self
    }

    /// Add a flat value, visible to later steps as a call param.
    pub fn value(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    /// Request early, successful pipeline exit.
    pub fn exit(mut self) -> Self {
        self.should_exit = true;
        self
    }

    fn namespace_insert(&mut self, ns: &str, key: &str, value: Value) {
        let entry = self
            .values
            .entry(ns.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(table) = entry {
            table.insert(key.to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_shapes_envelope() {
        let out = StepOutput::empty()
            .context("research", "A")
            .output("summary", "done")
            .value("post_id", 42);

        assert_eq!(out.values["context"]["research"], "A");
        assert_eq!(out.values["output"]["summary"], "done");
        assert_eq!(out.values["post_id"], 42);
        assert!(!out.should_exit);
    }

    #[test]
    fn test_exit_flag() {
        assert!(StepOutput::empty().exit().should_exit);
    }
}
