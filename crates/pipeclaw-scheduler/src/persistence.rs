//! SQLite-backed record store — survives restarts, supports concurrent
//! workers.
//!
//! The claim is a per-record conditional UPDATE that only succeeds while
//! the row is still 'pending'; a worker that loses the race sees zero
//! affected rows and simply skips the record. That conditional write is
//! the entire cross-process story — no extra locks.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use pipeclaw_core::{PipeclawError, Result};

use crate::store::RecordStore;
use crate::tasks::{RecordStatus, TaskRecord};

/// Durable record store over SQLite.
pub struct SqliteRecordStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteRecordStore {
    /// Open or create the record database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| PipeclawError::Store(format!("DB open: {e}")))?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database — tests and throwaway runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| PipeclawError::Store(format!("DB open: {e}")))?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS task_records (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                task_name TEXT NOT NULL,
                next_run TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                params TEXT NOT NULL DEFAULT '{}',
                attempt_count INTEGER NOT NULL DEFAULT 0,
                claimed_by TEXT,
                claimed_at TEXT,
                last_error TEXT,
                result TEXT,
                archived INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_task_records_due
                ON task_records(status, next_run);
            CREATE INDEX IF NOT EXISTS idx_task_records_name
                ON task_records(task_name, agent_id);
         ",
            )
            .map_err(|e| PipeclawError::Store(format!("Migration: {e}")))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipeclawError::Store("Connection mutex poisoned".into()))
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let status_str: String = row.get(4)?;
    let params_str: String = row.get(5)?;
    let claimed_at_str: Option<String> = row.get(8)?;
    let result_str: Option<String> = row.get(10)?;
    let created_at_str: String = row.get(11)?;
    let updated_at_str: String = row.get(12)?;
    let next_run_str: String = row.get(3)?;

    Ok(TaskRecord {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        task_name: row.get(2)?,
        next_run: parse_ts(&next_run_str),
        status: RecordStatus::parse(&status_str).unwrap_or(RecordStatus::Pending),
        params: serde_json::from_str(&params_str).unwrap_or_default(),
        attempt_count: row.get(6)?,
        claimed_by: row.get(7)?,
        claimed_at: claimed_at_str.map(|s| parse_ts(&s)),
        last_error: row.get(9)?,
        result: result_str.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_ts(&created_at_str),
        updated_at: parse_ts(&updated_at_str),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

const RECORD_COLUMNS: &str = "id, agent_id, task_name, next_run, status, params, attempt_count, \
     claimed_by, claimed_at, last_error, result, created_at, updated_at";

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn claim_due(&self, worker_id: &str, limit: usize) -> Result<Vec<TaskRecord>> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let conn = self.lock()?;

        let candidate_ids: Vec<String> = {
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM task_records
                     WHERE archived = 0 AND status = 'pending' AND next_run <= ?1
                     ORDER BY next_run LIMIT ?2",
                )
                .map_err(|e| PipeclawError::Store(format!("Claim select: {e}")))?;
            let ids = stmt
                .query_map(rusqlite::params![now_str, limit as i64], |row| row.get(0))
                .map_err(|e| PipeclawError::Store(format!("Claim select: {e}")))?
                .filter_map(|r| r.ok())
                .collect();
            ids
        };

        let mut claimed = Vec::with_capacity(candidate_ids.len());
        for id in candidate_ids {
            // Conditional update: only wins while the row is still pending.
            let changed = conn
                .execute(
                    "UPDATE task_records
                     SET status = 'claimed', claimed_by = ?1, claimed_at = ?2, updated_at = ?2
                     WHERE id = ?3 AND status = 'pending' AND archived = 0",
                    rusqlite::params![worker_id, now_str, id],
                )
                .map_err(|e| PipeclawError::Store(format!("Claim update: {e}")))?;
            if changed == 0 {
                // Another worker won the race. Benign: swallowed here,
                // never surfaced past the claim routine.
                let conflict =
                    PipeclawError::ClaimConflict(format!("Record {id} no longer pending"));
                tracing::debug!("{conflict}, skipping");
                continue;
            }

            let record = conn
                .query_row(
                    &format!("SELECT {RECORD_COLUMNS} FROM task_records WHERE id = ?1"),
                    rusqlite::params![id],
                    record_from_row,
                )
                .map_err(|e| PipeclawError::Store(format!("Claim fetch: {e}")))?;
            claimed.push(record);
        }
        Ok(claimed)
    }

    async fn mark_running(&self, id: &str) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE task_records SET status = 'running', updated_at = ?1 WHERE id = ?2",
                rusqlite::params![Utc::now().to_rfc3339(), id],
            )
            .map_err(|e| PipeclawError::Store(format!("Mark running: {e}")))?;
        Ok(())
    }

    async fn mark_succeeded(&self, id: &str, result: Value) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE task_records
                 SET status = 'succeeded', result = ?1, last_error = NULL,
                     attempt_count = 0, claimed_by = NULL, claimed_at = NULL, updated_at = ?2
                 WHERE id = ?3",
                rusqlite::params![result.to_string(), Utc::now().to_rfc3339(), id],
            )
            .map_err(|e| PipeclawError::Store(format!("Mark succeeded: {e}")))?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        partial: Option<Value>,
        _retryable: bool,
    ) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE task_records
                 SET status = 'failed', last_error = ?1, result = ?2,
                     attempt_count = attempt_count + 1,
                     claimed_by = NULL, claimed_at = NULL, updated_at = ?3
                 WHERE id = ?4",
                rusqlite::params![
                    error,
                    partial.map(|v| v.to_string()),
                    Utc::now().to_rfc3339(),
                    id
                ],
            )
            .map_err(|e| PipeclawError::Store(format!("Mark failed: {e}")))?;
        Ok(())
    }

    async fn reschedule(&self, id: &str, next_run: DateTime<Utc>) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE task_records
                 SET status = 'pending', next_run = ?1,
                     claimed_by = NULL, claimed_at = NULL, updated_at = ?2
                 WHERE id = ?3 AND archived = 0",
                rusqlite::params![next_run.to_rfc3339(), Utc::now().to_rfc3339(), id],
            )
            .map_err(|e| PipeclawError::Store(format!("Reschedule: {e}")))?;
        Ok(())
    }

    async fn finalize(&self, id: &str) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE task_records SET archived = 1, updated_at = ?1 WHERE id = ?2",
                rusqlite::params![Utc::now().to_rfc3339(), id],
            )
            .map_err(|e| PipeclawError::Store(format!("Finalize: {e}")))?;
        Ok(())
    }

    async fn arm_if_absent(
        &self,
        agent_id: &str,
        task_name: &str,
        params: Map<String, Value>,
        next_run: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let id = uuid::Uuid::new_v4().to_string();
        let now_str = Utc::now().to_rfc3339();
        // Insert-unless-live in one statement, so re-running initialization
        // can never double-arm a task.
        let changed = self
            .lock()?
            .execute(
                "INSERT INTO task_records
                     (id, agent_id, task_name, next_run, status, params,
                      attempt_count, archived, created_at, updated_at)
                 SELECT ?1, ?2, ?3, ?4, 'pending', ?5, 0, 0, ?6, ?6
                 WHERE NOT EXISTS (
                     SELECT 1 FROM task_records
                     WHERE task_name = ?3 AND agent_id = ?2 AND archived = 0
                       AND status IN ('pending', 'claimed', 'running')
                 )",
                rusqlite::params![
                    id,
                    agent_id,
                    task_name,
                    next_run.to_rfc3339(),
                    Value::Object(params).to_string(),
                    now_str
                ],
            )
            .map_err(|e| PipeclawError::Store(format!("Arm: {e}")))?;
        Ok(if changed == 1 { Some(id) } else { None })
    }

    async fn insert(&self, record: TaskRecord) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO task_records
                     (id, agent_id, task_name, next_run, status, params, attempt_count,
                      claimed_by, claimed_at, last_error, result, archived, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12, ?13)",
                rusqlite::params![
                    record.id,
                    record.agent_id,
                    record.task_name,
                    record.next_run.to_rfc3339(),
                    record.status.as_str(),
                    Value::Object(record.params).to_string(),
                    record.attempt_count,
                    record.claimed_by,
                    record.claimed_at.map(|t| t.to_rfc3339()),
                    record.last_error,
                    record.result.map(|v| v.to_string()),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| PipeclawError::Store(format!("Insert: {e}")))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<TaskRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM task_records WHERE id = ?1 AND archived = 0"),
                rusqlite::params![id],
                record_from_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(PipeclawError::Store(format!("Get: {other}"))),
            })?;
        Ok(record)
    }

    async fn live_count(&self, task_name: &str) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM task_records
                 WHERE task_name = ?1 AND archived = 0
                   AND status IN ('pending', 'claimed', 'running')",
                rusqlite::params![task_name],
                |row| row.get(0),
            )
            .map_err(|e| PipeclawError::Store(format!("Count: {e}")))?;
        Ok(count as usize)
    }
}
