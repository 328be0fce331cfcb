//! Record store port — the persistence boundary for task records.
//!
//! The engine depends only on this trait and its atomicity guarantees.
//! The pending→claimed transition is the single correctness mechanism
//! keeping multiple workers from running the same record: it must be a
//! conditional update that succeeds only while the record is still
//! Pending and due. Racing callers receive fewer claims, never duplicates.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use pipeclaw_core::{PipeclawError, Result};

use crate::tasks::{RecordStatus, TaskRecord};

/// Persistence port for scheduled task records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Atomically transition up to `limit` due records (Pending and
    /// `next_run <= now`) to Claimed, tagging claimed_by/claimed_at.
    /// No two concurrent callers ever receive the same record.
    async fn claim_due(&self, worker_id: &str, limit: usize) -> Result<Vec<TaskRecord>>;

    async fn mark_running(&self, id: &str) -> Result<()>;

    /// Terminal success for this cycle: stores the exported run values,
    /// resets the attempt counter, clears the claim.
    async fn mark_succeeded(&self, id: &str, result: Value) -> Result<()>;

    /// Failure for this cycle: records the error and partial values,
    /// increments `attempt_count`, clears the claim.
    async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        partial: Option<Value>,
        retryable: bool,
    ) -> Result<()>;

    /// Reset the record to Pending at `next_run`. Used both for recurring
    /// success and for retry.
    async fn reschedule(&self, id: &str, next_run: DateTime<Utc>) -> Result<()>;

    /// Remove the record from the active pool (archived, not mutated
    /// further). Used for one-time/manual completion and retry-disabled
    /// failures.
    async fn finalize(&self, id: &str) -> Result<()>;

    /// Idempotent arming: insert a Pending record for `task_name` unless a
    /// live (pending/claimed/running) one already exists. Returns the new
    /// record id, or None when the task was already armed — a task is
    /// never double-armed.
    async fn arm_if_absent(
        &self,
        agent_id: &str,
        task_name: &str,
        params: Map<String, Value>,
        next_run: DateTime<Utc>,
    ) -> Result<Option<String>>;

    /// Insert a record as-is (manual scheduling, tests).
    async fn insert(&self, record: TaskRecord) -> Result<()>;

    /// Fetch a record from the active pool.
    async fn get(&self, id: &str) -> Result<Option<TaskRecord>>;

    /// Number of live records for a task name.
    async fn live_count(&self, task_name: &str) -> Result<usize>;
}

/// In-memory record store — dev runs and tests. A single mutex makes every
/// operation trivially atomic.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, TaskRecord>>,
    archived: Mutex<Vec<TaskRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that left the active pool, for inspection in tests.
    pub async fn archived(&self) -> Vec<TaskRecord> {
        self.archived.lock().await.clone()
    }
}

fn unknown(id: &str) -> PipeclawError {
    PipeclawError::Store(format!("Unknown record '{id}'"))
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn claim_due(&self, worker_id: &str, limit: usize) -> Result<Vec<TaskRecord>> {
        let now = Utc::now();
        let mut records = self.records.lock().await;

        let mut due: Vec<String> = records
            .values()
            .filter(|r| r.is_due(now))
            .map(|r| r.id.clone())
            .collect();
        due.sort_by_key(|id| records[id].next_run);
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            // Still holding the lock, so the pending check cannot race.
            if let Some(record) = records.get_mut(&id) {
                if record.status != RecordStatus::Pending {
                    continue;
                }
                record.status = RecordStatus::Claimed;
                record.claimed_by = Some(worker_id.to_string());
                record.claimed_at = Some(now);
                record.updated_at = now;
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_running(&self, id: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(id).ok_or_else(|| unknown(id))?;
        record.status = RecordStatus::Running;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_succeeded(&self, id: &str, result: Value) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(id).ok_or_else(|| unknown(id))?;
        record.status = RecordStatus::Succeeded;
        record.result = Some(result);
        record.last_error = None;
        record.attempt_count = 0;
        record.claimed_by = None;
        record.claimed_at = None;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        partial: Option<Value>,
        _retryable: bool,
    ) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(id).ok_or_else(|| unknown(id))?;
        record.status = RecordStatus::Failed;
        record.last_error = Some(error.to_string());
        record.result = partial;
        record.attempt_count += 1;
        record.claimed_by = None;
        record.claimed_at = None;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn reschedule(&self, id: &str, next_run: DateTime<Utc>) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(id).ok_or_else(|| unknown(id))?;
        record.status = RecordStatus::Pending;
        record.next_run = next_run;
        record.claimed_by = None;
        record.claimed_at = None;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn finalize(&self, id: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records.remove(id).ok_or_else(|| unknown(id))?;
        self.archived.lock().await.push(record);
        Ok(())
    }

    async fn arm_if_absent(
        &self,
        agent_id: &str,
        task_name: &str,
        params: Map<String, Value>,
        next_run: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let mut records = self.records.lock().await;
        let already_live = records
            .values()
            .any(|r| r.task_name == task_name && r.agent_id == agent_id && r.status.is_live());
        if already_live {
            return Ok(None);
        }
        let record = TaskRecord::new(agent_id, task_name, params, next_run);
        let id = record.id.clone();
        records.insert(id.clone(), record);
        Ok(Some(id))
    }

    async fn insert(&self, record: TaskRecord) -> Result<()> {
        self.records.lock().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn live_count(&self, task_name: &str) -> Result<usize> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.task_name == task_name && r.status.is_live())
            .count())
    }
}
