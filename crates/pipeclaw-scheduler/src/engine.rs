//! Dispatcher engine — the poll → claim → run → reschedule loop.
//!
//! Record lifecycle: Pending → Claimed → Running → Succeeded | Failed.
//! Succeeded/Failed end that record's cycle; recurring tasks are reset to
//! Pending at the next policy time (computed from completion time, not the
//! previous slot), retryable failures are reset to Pending at the retry
//! time, everything else is finalized.
//!
//! Multiple engines (threads, processes, replicas) may share one record
//! store; the store's conditional claim keeps them from colliding.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value, json};
use tokio::task::JoinSet;

use pipeclaw_core::config::{PipeclawConfig, TaskDefinition};
use pipeclaw_core::{PipeclawError, Result};
use pipeclaw_pipeline::{DataStore, PipelineRunner, StepRegistry};

use crate::gate::SweepBudget;
use crate::policy;
use crate::store::RecordStore;
use crate::tasks::TaskRecord;

/// The dispatcher — claims due records and runs their pipelines.
pub struct DispatcherEngine {
    agent_id: String,
    task_limit: usize,
    poll_interval_secs: u64,
    default_retry_minutes: u64,
    definitions: HashMap<String, TaskDefinition>,
    registry: Arc<StepRegistry>,
    runner: PipelineRunner,
    store: Arc<dyn RecordStore>,
    budget: Arc<SweepBudget>,
    worker_id: String,
}

impl DispatcherEngine {
    pub fn new(
        config: &PipeclawConfig,
        registry: Arc<StepRegistry>,
        store: Arc<dyn RecordStore>,
        budget: Arc<SweepBudget>,
    ) -> Self {
        let definitions = config
            .tasks
            .iter()
            .map(|t| (t.name.clone(), t.clone()))
            .collect();
        Self {
            agent_id: config.agent_id.clone(),
            task_limit: config.dispatcher.task_limit,
            poll_interval_secs: config.dispatcher.poll_interval_secs,
            default_retry_minutes: config.retry.default_minutes,
            definitions,
            runner: PipelineRunner::new(registry.clone()),
            registry,
            store,
            budget,
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Validate every definition and arm the scheduled ones. Idempotent:
    /// re-running never creates a second live record for a task name.
    /// A Config error here is fatal — the offending task is not armed.
    pub async fn initialize(&self) -> Result<()> {
        for def in self.definitions.values() {
            self.registry.validate_pipeline(def)?;
            let Some(sched) = &def.scheduler else {
                tracing::debug!("Task '{}' is manual-only, not arming", def.name);
                continue;
            };
            policy::validate(&def.name, sched)?;

            let first = policy::first_run(sched, Utc::now())?;
            match self
                .store
                .arm_if_absent(&self.agent_id, &def.name, def.params.clone(), first)
                .await?
            {
                Some(id) => {
                    tracing::info!("📅 Armed task '{}' (record {id}, next run {first})", def.name);
                }
                None => {
                    tracing::debug!("Task '{}' already armed", def.name);
                }
            }
        }
        Ok(())
    }

    /// Explicit external scheduling: arm a one-off record for `task_name`,
    /// due immediately, with caller overrides merged over the definition's
    /// params. This is the only way manual-only tasks get records.
    pub async fn schedule_now(
        &self,
        task_name: &str,
        overrides: Map<String, Value>,
    ) -> Result<String> {
        let def = self.definitions.get(task_name).ok_or_else(|| {
            PipeclawError::Config(format!("Unknown task '{task_name}'"))
        })?;
        let mut params = def.params.clone();
        params.extend(overrides);

        let record = TaskRecord::new(&self.agent_id, task_name, params, Utc::now());
        let id = record.id.clone();
        self.store.insert(record).await?;
        tracing::info!("📌 Scheduled one-off run of '{task_name}' (record {id})");
        Ok(id)
    }

    /// One poll sweep: claim up to `task_limit` due records and run them
    /// concurrently, one spawned execution per record. Returns how many
    /// records were claimed.
    pub async fn sweep(self: Arc<Self>) -> Result<usize> {
        self.budget.reset();
        let claimed = self.store.claim_due(&self.worker_id, self.task_limit).await?;
        if claimed.is_empty() {
            return Ok(0);
        }
        let count = claimed.len();
        tracing::info!("🔔 Claimed {count} due record(s)");

        let mut running = JoinSet::new();
        for record in claimed {
            let engine = Arc::clone(&self);
            running.spawn(async move { engine.run_record(record).await });
        }
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Record task panicked: {e}");
            }
        }
        Ok(count)
    }

    /// Execute one claimed record end to end. Store errors are logged, not
    /// propagated — the sweep must not die because one record misbehaved.
    async fn run_record(&self, record: TaskRecord) {
        let Some(def) = self.definitions.get(&record.task_name) else {
            tracing::warn!(
                "⚠️ Record {} references unknown task '{}', finalizing",
                record.id,
                record.task_name
            );
            self.try_store(
                self.store
                    .mark_failed(&record.id, "unknown task definition", None, false),
            )
            .await;
            self.try_store(self.store.finalize(&record.id)).await;
            return;
        };

        self.try_store(self.store.mark_running(&record.id)).await;
        tracing::info!("▶️ Running task '{}' (record {})", def.name, record.id);

        // Fresh store per run: config snapshot + merged params.
        let snapshot = json!({
            "agent_id": self.agent_id,
            "task": serde_json::to_value(def).unwrap_or(Value::Null),
        });
        let mut params = def.params.clone();
        params.extend(record.params.clone());
        let mut data_store = DataStore::new(snapshot, params);

        let outcome = self.runner.run(def, &mut data_store).await;

        if outcome.succeeded() {
            self.try_store(self.store.mark_succeeded(&record.id, outcome.values)).await;
            match &def.scheduler {
                Some(sched) => match policy::next_run(sched, Utc::now()) {
                    Ok(Some(next)) => {
                        self.try_store(self.store.reschedule(&record.id, next)).await;
                        tracing::info!("🔁 Task '{}' rescheduled for {next}", def.name);
                    }
                    Ok(None) => {
                        self.try_store(self.store.finalize(&record.id)).await;
                        tracing::info!("🏁 One-time task '{}' finalized", def.name);
                    }
                    Err(e) => {
                        tracing::error!("Policy failure rescheduling '{}': {e}", def.name);
                        self.try_store(self.store.finalize(&record.id)).await;
                    }
                },
                None => {
                    self.try_store(self.store.finalize(&record.id)).await;
                    tracing::info!("🏁 Manual task '{}' finalized", def.name);
                }
            }
            return;
        }

        let error = outcome.error.unwrap_or_else(|| "unknown error".into());
        let failed_step = outcome.failed_step.as_deref().unwrap_or("?");
        tracing::warn!(
            "⚠️ Task '{}' failed at step '{}': {} (attempt {})",
            def.name,
            failed_step,
            error,
            record.attempt_count + 1
        );
        self.try_store(self.store.mark_failed(
            &record.id,
            &error,
            Some(outcome.values),
            outcome.retryable,
        ))
        .await;

        // A step's no-retry verdict wins over the task's retry policy.
        let retry_minutes = def.retry_minutes(self.default_retry_minutes);
        match (outcome.retryable, policy::retry_run(retry_minutes, Utc::now())) {
            (true, Some(at)) => {
                self.try_store(self.store.reschedule(&record.id, at)).await;
                tracing::info!("🔁 Task '{}' retry armed for {at}", def.name);
            }
            _ => {
                self.try_store(self.store.finalize(&record.id)).await;
                tracing::warn!("⛔ Task '{}' failed terminally", def.name);
            }
        }
    }

    async fn try_store(&self, op: impl std::future::Future<Output = Result<()>>) {
        if let Err(e) = op.await {
            tracing::error!("Record store operation failed: {e}");
        }
    }
}

/// Spawn the dispatcher loop. Ticks on the configured poll interval until
/// the task is aborted.
pub async fn spawn_dispatcher(engine: Arc<DispatcherEngine>) {
    tracing::info!(
        "⏰ Dispatcher started ({}; poll every {}s, task limit {})",
        engine.worker_id,
        engine.poll_interval_secs,
        engine.task_limit
    );
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(engine.poll_interval_secs));
    loop {
        interval.tick().await;
        if let Err(e) = engine.clone().sweep().await {
            tracing::warn!("⚠️ Sweep failed: {e}");
        }
    }
}
