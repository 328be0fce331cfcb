//! Per-run data store — the mutable context pipeline steps share.
//!
//! Three spaces with different merge rules:
//! - **context**: accumulating. A colliding key is appended under the next
//!   integer suffix (`research`, `research_2`, `research_3`, …). Suffixes
//!   are allocated monotonically and never reused, even after deletion.
//! - **output**: overwriting. Repeat writes replace the entry wholesale;
//!   the previous timestamp is discarded.
//! - **flat params**: plain key/value space. Seeded from the task's params,
//!   extended by non-namespaced step return values, handed to every step as
//!   call arguments.
//!
//! One DataStore per pipeline run. It is created when the run starts and
//! discarded after results are persisted — never shared across runs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use pipeclaw_core::{PipeclawError, Result};

/// A stored value plus provenance.
#[derive(Debug, Clone)]
pub struct ValueEntry {
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    pub step_id: String,
}

/// Ephemeral store scoped to one pipeline run.
#[derive(Debug)]
pub struct DataStore {
    /// Read-only snapshot of agent/task config.
    config: Value,
    params: Map<String, Value>,
    context: HashMap<String, ValueEntry>,
    output: HashMap<String, ValueEntry>,
    /// Highest suffix ever allocated per base key. Deletion does not lower
    /// it, so a freed suffix is never handed out twice.
    suffix_high: HashMap<String, u32>,
}

impl DataStore {
    /// Create a store seeded with a config snapshot and the run's params.
    pub fn new(config: Value, params: Map<String, Value>) -> Self {
        Self {
            config,
            params,
            context: HashMap::new(),
            output: HashMap::new(),
            suffix_high: HashMap::new(),
        }
    }

    /// The config snapshot steps may read.
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// The flat parameter space passed to steps as call arguments.
    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// Read a single flat param.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Read a context entry.
    pub fn context_entry(&self, key: &str) -> Option<&ValueEntry> {
        self.context.get(key)
    }

    /// Read a context value.
    pub fn context_value(&self, key: &str) -> Option<&Value> {
        self.context.get(key).map(|e| &e.value)
    }

    /// Read an output value.
    pub fn output_value(&self, key: &str) -> Option<&Value> {
        self.output.get(key).map(|e| &e.value)
    }

    /// Number of context keys currently held.
    pub fn context_len(&self) -> usize {
        self.context.len()
    }

    /// Merge a step's returned values.
    ///
    /// `context`/`output` must be tables when present; anything else is a
    /// contract violation reported as `InvalidStepResult` (non-retryable —
    /// rerunning the step would reproduce the same bug).
    pub fn merge(&mut self, step_id: &str, values: &Map<String, Value>) -> Result<()> {
        // Deletions first, so a step can drop stale context and re-add the
        // key in the same return.
        if let Some(del) = values.get("delete_context") {
            self.delete_context(step_id, del)?;
        }

        if let Some(ctx) = values.get("context") {
            let table = ctx.as_object().ok_or_else(|| invalid(step_id, "context is not a table"))?;
            for (key, value) in table {
                self.insert_context(step_id, key, value.clone());
            }
        }

        if let Some(out) = values.get("output") {
            let table = out.as_object().ok_or_else(|| invalid(step_id, "output is not a table"))?;
            for (key, value) in table {
                self.output.insert(
                    key.clone(),
                    ValueEntry {
                        value: value.clone(),
                        timestamp: Utc::now(),
                        step_id: step_id.to_string(),
                    },
                );
            }
        }

        for (key, value) in values {
            if key != "context" && key != "output" && key != "delete_context" {
                self.params.insert(key.clone(), value.clone());
            }
        }

        Ok(())
    }

    /// Insert into context under the first never-used suffix: bare key on
    /// first write, `key_2`, `key_3`, … afterwards.
    fn insert_context(&mut self, step_id: &str, key: &str, value: Value) {
        let high = self.suffix_high.get(key).copied().unwrap_or(0);
        let (stored_key, next_high) = if high == 0 && !self.context.contains_key(key) {
            (key.to_string(), 1)
        } else {
            let n = high.max(1) + 1;
            (format!("{key}_{n}"), n)
        };
        self.suffix_high.insert(key.to_string(), next_high);
        self.context.insert(
            stored_key,
            ValueEntry {
                value,
                timestamp: Utc::now(),
                step_id: step_id.to_string(),
            },
        );
    }

    /// Remove context keys named by a string or list of strings.
    fn delete_context(&mut self, step_id: &str, keys: &Value) -> Result<()> {
        let keys: Vec<&str> = match keys {
            Value::String(s) => vec![s.as_str()],
            Value::Array(list) => list
                .iter()
                .map(|v| v.as_str().ok_or_else(|| invalid(step_id, "delete_context entries must be strings")))
                .collect::<Result<_>>()?,
            _ => return Err(invalid(step_id, "delete_context must be a key or list of keys")),
        };
        for key in keys {
            if self.context.remove(key).is_some() {
                tracing::debug!("🗑️ Step '{step_id}' deleted context key '{key}'");
            }
        }
        Ok(())
    }

    /// All outputs ordered by creation time.
    pub fn ordered_outputs(&self) -> Vec<(String, ValueEntry)> {
        let mut all: Vec<(String, ValueEntry)> = self
            .output
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by_key(|(_, entry)| entry.timestamp);
        all
    }

    /// Snapshot persisted into the task record once the run ends. Entry
    /// metadata flattens to plain values — records store results, not
    /// provenance.
    pub fn export_results(&self) -> Value {
        let context: Map<String, Value> = self
            .context
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        let output: Map<String, Value> = self
            .output
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        json!({
            "values": Value::Object(self.params.clone()),
            "context": Value::Object(context),
            "output": Value::Object(output),
        })
    }
}

fn invalid(step_id: &str, reason: &str) -> PipeclawError {
    PipeclawError::InvalidStepResult {
        step: step_id.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> DataStore {
        DataStore::new(json!({"agent_id": "test"}), Map::new())
    }

    fn ctx_values(key: &str, value: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("context".into(), json!({ key: value }));
        m
    }

    #[test]
    fn test_context_auto_indexing() {
        let mut ds = store();
        ds.merge("research_step", &ctx_values("research", "A")).unwrap();
        ds.merge("research_step", &ctx_values("research", "B")).unwrap();

        assert_eq!(ds.context_value("research"), Some(&json!("A")));
        assert_eq!(ds.context_value("research_2"), Some(&json!("B")));
    }

    #[test]
    fn test_context_third_write_gets_next_suffix() {
        let mut ds = store();
        for v in ["A", "B", "C"] {
            ds.merge("s", &ctx_values("research", v)).unwrap();
        }
        assert_eq!(ds.context_value("research_3"), Some(&json!("C")));
    }

    #[test]
    fn test_freed_suffix_never_reused() {
        let mut ds = store();
        ds.merge("s", &ctx_values("research", "A")).unwrap();
        ds.merge("s", &ctx_values("research", "B")).unwrap();

        let mut del = Map::new();
        del.insert("delete_context".into(), json!(["research_2"]));
        ds.merge("s", &del).unwrap();
        assert_eq!(ds.context_value("research_2"), None);

        ds.merge("s", &ctx_values("research", "C")).unwrap();
        // research_2 stays dead; the new value lands on the next suffix.
        assert_eq!(ds.context_value("research_2"), None);
        assert_eq!(ds.context_value("research_3"), Some(&json!("C")));
    }

    #[test]
    fn test_output_overwrites() {
        let mut ds = store();
        let mut m = Map::new();
        m.insert("output".into(), json!({"summary": "v1"}));
        ds.merge("a", &m).unwrap();

        let mut m = Map::new();
        m.insert("output".into(), json!({"summary": "v2"}));
        ds.merge("b", &m).unwrap();

        assert_eq!(ds.output_value("summary"), Some(&json!("v2")));
        let (_, entry) = &ds.ordered_outputs()[0];
        assert_eq!(entry.step_id, "b");
    }

    #[test]
    fn test_flat_values_become_params() {
        let mut ds = store();
        let mut m = Map::new();
        m.insert("post_id".into(), json!("123456"));
        ds.merge("publish", &m).unwrap();
        assert_eq!(ds.param("post_id"), Some(&json!("123456")));
    }

    #[test]
    fn test_seed_params_visible() {
        let mut params = Map::new();
        params.insert("topic".into(), json!("news"));
        let ds = DataStore::new(json!({}), params);
        assert_eq!(ds.param("topic"), Some(&json!("news")));
    }

    #[test]
    fn test_malformed_context_rejected() {
        let mut ds = store();
        let mut m = Map::new();
        m.insert("context".into(), json!("not a table"));
        let err = ds.merge("bad", &m).unwrap_err();
        assert!(matches!(err, PipeclawError::InvalidStepResult { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_malformed_output_rejected() {
        let mut ds = store();
        let mut m = Map::new();
        m.insert("output".into(), json!([1, 2, 3]));
        assert!(ds.merge("bad", &m).is_err());
    }

    #[test]
    fn test_delete_context_single_key_string() {
        let mut ds = store();
        ds.merge("s", &ctx_values("draft", "text")).unwrap();

        let mut del = Map::new();
        del.insert("delete_context".into(), json!("draft"));
        ds.merge("s", &del).unwrap();
        assert_eq!(ds.context_value("draft"), None);
    }

    #[test]
    fn test_export_results_flattens_metadata() {
        let mut ds = store();
        ds.merge("s", &ctx_values("research", "A")).unwrap();
        let mut m = Map::new();
        m.insert("output".into(), json!({"summary": "done"}));
        m.insert("post_id".into(), json!(7));
        ds.merge("s", &m).unwrap();

        let exported = ds.export_results();
        assert_eq!(exported["context"]["research"], "A");
        assert_eq!(exported["output"]["summary"], "done");
        assert_eq!(exported["values"]["post_id"], 7);
    }
}
