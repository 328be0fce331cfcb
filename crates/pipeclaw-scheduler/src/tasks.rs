//! Task records — the durable data model for scheduled runs.
//!
//! A record is one pending/executing/completed run of a task definition.
//! Its lifecycle: Pending → Claimed → Running → Succeeded | Failed.
//! Recurring tasks are reset to Pending by `reschedule`; one-time and
//! retry-disabled records leave the active pool via `finalize`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Record lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Claimed,
    Running,
    Succeeded,
    Failed,
}

impl RecordStatus {
    /// String form used by the SQLite store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "claimed" => Some(Self::Claimed),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Live records block re-arming of the same task name.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Claimed | Self::Running)
    }
}

/// One scheduled run of a task definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub agent_id: String,
    /// References a TaskDefinition by name.
    pub task_name: String,
    pub next_run: DateTime<Utc>,
    pub status: RecordStatus,
    /// Defaults merged with caller overrides at arm time.
    pub params: Map<String, Value>,
    /// Starts at 0, incremented on each failure.
    pub attempt_count: u32,
    /// Set on claim, cleared on terminal state.
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Exported run values, written on success (partial values on failure
    /// live here too, for diagnostics).
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Create a fresh pending record.
    pub fn new(
        agent_id: &str,
        task_name: &str,
        params: Map<String, Value>,
        next_run: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            task_name: task_name.to_string(),
            next_run,
            status: RecordStatus::Pending,
            params,
            attempt_count: 0,
            claimed_by: None,
            claimed_at: None,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a claim attempt may succeed right now.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == RecordStatus::Pending && self.next_run <= now
    }
}
