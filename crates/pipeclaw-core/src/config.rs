//! PipeClaw configuration system.
//!
//! Everything the engine consumes at startup lives here: operational knobs
//! (poll interval, claim batch size, gate capacity, default retry minutes)
//! and the task definitions — name, pipeline, schedule policy, retry policy,
//! default params. Validation failures are `Config` errors and surface at
//! startup; an invalid task is never armed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PipeclawError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeclawConfig {
    /// Owning agent for all task records created by this process.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub retry: RetryDefaults,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

fn default_agent_id() -> String { "main".into() }

impl Default for PipeclawConfig {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            dispatcher: DispatcherConfig::default(),
            gate: GateConfig::default(),
            retry: RetryDefaults::default(),
            store: StoreConfig::default(),
            tasks: Vec::new(),
        }
    }
}

impl PipeclawConfig {
    /// Load config from the default path (~/.pipeclaw/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PipeclawError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| PipeclawError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pipeclaw")
            .join("config.toml")
    }

    /// Get the PipeClaw home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pipeclaw")
    }

    /// Look up a task definition by name.
    pub fn task(&self, name: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Structural validation of every task definition. The cron expression
    /// itself is validated by the scheduler crate when the task is armed.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for task in &self.tasks {
            task.validate()?;
            if !seen.insert(task.name.as_str()) {
                return Err(PipeclawError::Config(format!(
                    "Duplicate task name '{}'",
                    task.name
                )));
            }
        }
        if self.dispatcher.task_limit == 0 {
            return Err(PipeclawError::Config("task_limit must be > 0".into()));
        }
        if self.gate.max_concurrent_calls == 0 {
            return Err(PipeclawError::Config(
                "max_concurrent_calls must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Dispatcher loop knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Seconds between poll sweeps.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Max records claimed (and run concurrently) per sweep.
    #[serde(default = "default_task_limit")]
    pub task_limit: usize,
}

fn default_poll_interval() -> u64 { 5 }
fn default_task_limit() -> usize { 10 }

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            task_limit: default_task_limit(),
        }
    }
}

/// Concurrency gate knobs for the rate-limited external resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Max concurrent calls against the gated resource (process-wide).
    #[serde(default = "default_max_calls")]
    pub max_concurrent_calls: usize,
    /// Max items processed against the gated resource per sweep —
    /// independent from call concurrency.
    #[serde(default = "default_max_items")]
    pub max_items_per_sweep: usize,
}

fn default_max_calls() -> usize { 3 }
fn default_max_items() -> usize { 25 }

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: default_max_calls(),
            max_items_per_sweep: default_max_items(),
        }
    }
}

/// Process-wide retry defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDefaults {
    /// Minutes used when a task has no explicit retry policy.
    #[serde(default = "default_retry_minutes")]
    pub default_minutes: u64,
}

fn default_retry_minutes() -> u64 { 10 }

impl Default for RetryDefaults {
    fn default() -> Self {
        Self { default_minutes: default_retry_minutes() }
    }
}

/// Record store backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "sqlite" (durable) or "memory" (dev/tests).
    #[serde(default = "default_store_backend")]
    pub backend: String,
    /// SQLite database path (tilde-expanded by the binary).
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_backend() -> String { "sqlite".into() }
fn default_store_path() -> String { "~/.pipeclaw/records.db".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
        }
    }
}

/// A named task: an ordered pipeline of steps plus scheduling behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique per agent.
    pub name: String,
    /// Ordered step identifiers. A step id may name another task — that
    /// task's pipeline expands inline, sharing the run's data store.
    pub pipeline: Vec<String>,
    /// When to run. Absent = manual/one-off only (never auto-armed).
    #[serde(default)]
    pub scheduler: Option<SchedulerPolicy>,
    /// Retry behavior on failure. Absent = process default minutes;
    /// `false` = disabled (failures are terminal).
    #[serde(default)]
    pub retry_policy: Option<RetryConfig>,
    /// Default params, merged under caller overrides at arm time.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl TaskDefinition {
    /// Structural validation (the cron expression is checked at arm time).
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PipeclawError::Config("Task name must not be empty".into()));
        }
        if self.pipeline.is_empty() {
            return Err(PipeclawError::Config(format!(
                "Task '{}' has an empty pipeline",
                self.name
            )));
        }
        if let Some(policy) = &self.scheduler {
            policy.validate(&self.name)?;
        }
        if let Some(RetryConfig::Switch(true)) = &self.retry_policy {
            return Err(PipeclawError::Config(format!(
                "Task '{}': retry_policy must be {{ minutes = N }} or false",
                self.name
            )));
        }
        Ok(())
    }

    /// Effective retry minutes, or None when retries are disabled.
    pub fn retry_minutes(&self, default_minutes: u64) -> Option<u64> {
        match &self.retry_policy {
            None => Some(default_minutes),
            Some(RetryConfig::Enabled { minutes }) => Some(*minutes),
            Some(RetryConfig::Switch(_)) => None,
        }
    }
}

/// Schedule policy — when a task becomes due.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerPolicy {
    /// Standard 5-field cron expression (minute hour dom month dow), UTC.
    Cron { expression: String },
    /// Uniformly random delay between min and max minutes after each run.
    RandomInterval { min_minutes: f64, max_minutes: f64 },
    /// Run once at an absolute timestamp, then finalize.
    OneTime { scheduled_time: DateTime<Utc> },
}

impl SchedulerPolicy {
    /// Bounds validation. Cron syntax is validated where the parser lives.
    pub fn validate(&self, task: &str) -> Result<()> {
        match self {
            Self::Cron { expression } => {
                if expression.split_whitespace().count() != 5 {
                    return Err(PipeclawError::Config(format!(
                        "Task '{task}': cron expression '{expression}' must have 5 fields"
                    )));
                }
                Ok(())
            }
            Self::RandomInterval { min_minutes, max_minutes } => {
                if *min_minutes <= 0.0 || *max_minutes <= 0.0 {
                    return Err(PipeclawError::Config(format!(
                        "Task '{task}': random_interval minutes must be positive"
                    )));
                }
                if min_minutes > max_minutes {
                    return Err(PipeclawError::Config(format!(
                        "Task '{task}': min_minutes ({min_minutes}) > max_minutes ({max_minutes})"
                    )));
                }
                Ok(())
            }
            Self::OneTime { .. } => Ok(()),
        }
    }
}

/// Retry policy as written in config: `{ minutes = N }` or `false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryConfig {
    Enabled { minutes: u64 },
    Switch(bool),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipeclawConfig::default();
        assert_eq!(config.agent_id, "main");
        assert_eq!(config.dispatcher.poll_interval_secs, 5);
        assert_eq!(config.dispatcher.task_limit, 10);
        assert_eq!(config.gate.max_concurrent_calls, 3);
        assert_eq!(config.retry.default_minutes, 10);
        assert_eq!(config.store.backend, "sqlite");
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            agent_id = "poster"

            [dispatcher]
            poll_interval_secs = 2
            task_limit = 4

            [[tasks]]
            name = "morning-digest"
            pipeline = ["fetch_updates", "post_webhook"]
            scheduler = { type = "cron", expression = "0 8 * * *" }
            retry_policy = { minutes = 15 }

            [tasks.params]
            feed_url = "https://example.com/feed"
        "#;

        let config: PipeclawConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.agent_id, "poster");
        assert_eq!(config.dispatcher.task_limit, 4);
        assert_eq!(config.tasks.len(), 1);

        let task = &config.tasks[0];
        assert_eq!(task.pipeline, vec!["fetch_updates", "post_webhook"]);
        assert!(matches!(task.scheduler, Some(SchedulerPolicy::Cron { .. })));
        assert_eq!(task.retry_minutes(10), Some(15));
        assert_eq!(
            task.params.get("feed_url").and_then(|v| v.as_str()),
            Some("https://example.com/feed")
        );
    }

    #[test]
    fn test_retry_policy_false_disables() {
        let toml_str = r#"
            [[tasks]]
            name = "one-shot"
            pipeline = ["ping"]
            retry_policy = false
        "#;
        let config: PipeclawConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.tasks[0].retry_minutes(10), None);
    }

    #[test]
    fn test_retry_policy_absent_uses_default() {
        let toml_str = r#"
            [[tasks]]
            name = "defaulted"
            pipeline = ["ping"]
        "#;
        let config: PipeclawConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.tasks[0].retry_minutes(10), Some(10));
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let task = TaskDefinition {
            name: "broken".into(),
            pipeline: vec![],
            scheduler: None,
            retry_policy: None,
            params: serde_json::Map::new(),
        };
        assert!(task.validate().is_err());
    }

    #[test]
    fn test_random_interval_bounds_rejected() {
        let policy = SchedulerPolicy::RandomInterval {
            min_minutes: 30.0,
            max_minutes: 5.0,
        };
        assert!(policy.validate("t").is_err());

        let policy = SchedulerPolicy::RandomInterval {
            min_minutes: 0.0,
            max_minutes: 5.0,
        };
        assert!(policy.validate("t").is_err());
    }

    #[test]
    fn test_one_time_from_toml() {
        let toml_str = r#"
            [[tasks]]
            name = "launch-post"
            pipeline = ["post_webhook"]
            scheduler = { type = "one_time", scheduled_time = "2026-03-01T09:00:00Z" }
        "#;
        let config: PipeclawConfig = toml::from_str(toml_str).unwrap();
        match &config.tasks[0].scheduler {
            Some(SchedulerPolicy::OneTime { scheduled_time }) => {
                assert_eq!(scheduled_time.to_rfc3339(), "2026-03-01T09:00:00+00:00");
            }
            other => panic!("unexpected policy: {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_task_names_rejected() {
        let toml_str = r#"
            [[tasks]]
            name = "dup"
            pipeline = ["a"]

            [[tasks]]
            name = "dup"
            pipeline = ["b"]
        "#;
        let config: PipeclawConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }
}
