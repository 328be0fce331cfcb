//! Pipeline runner — executes a task's steps strictly in declared order.
//!
//! Per step: resolve through the registry, invoke with the flattened param
//! space, merge returned values into the DataStore, move on. A failing step
//! stops the run immediately — later steps never execute — but everything
//! merged so far is kept in the outcome for diagnostics and for retry
//! attempts to inspect. Nested task references expand recursively over the
//! same DataStore.

use std::sync::Arc;

use serde_json::Value;

use pipeclaw_core::config::TaskDefinition;
use pipeclaw_core::{PipeclawError, Result};

use crate::datastore::DataStore;
use crate::registry::{StepKind, StepRegistry};

/// Nesting guard for pipelines that slipped past startup validation.
const MAX_NESTING: usize = 16;

/// Terminal status of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// What a pipeline run produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Error text when failed.
    pub error: Option<String>,
    /// Identifier of the step that failed.
    pub failed_step: Option<String>,
    /// Whether the dispatcher may schedule a retry. A step that opted out
    /// (`retryable = false`) wins over the task's retry policy.
    pub retryable: bool,
    /// Exported DataStore snapshot — partial when the run failed.
    pub values: Value,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

enum Flow {
    Continue,
    Exit,
}

/// Executes pipelines against a shared registry.
pub struct PipelineRunner {
    registry: Arc<StepRegistry>,
}

impl PipelineRunner {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self { registry }
    }

    /// Run every step of `definition` against `store`.
    pub async fn run(&self, definition: &TaskDefinition, store: &mut DataStore) -> RunOutcome {
        match self
            .run_steps(&definition.name, &definition.pipeline, store, 0)
            .await
        {
            Ok(_) => RunOutcome {
                status: RunStatus::Succeeded,
                error: None,
                failed_step: None,
                retryable: false,
                values: store.export_results(),
            },
            Err(err) => RunOutcome {
                status: RunStatus::Failed,
                error: Some(err.to_string()),
                failed_step: failing_step(&err),
                retryable: err.is_retryable(),
                values: store.export_results(),
            },
        }
    }

    async fn run_steps(
        &self,
        task: &str,
        pipeline: &[String],
        store: &mut DataStore,
        depth: usize,
    ) -> Result<Flow> {
        if depth > MAX_NESTING {
            return Err(PipeclawError::Config(format!(
                "Task '{task}': pipeline nesting exceeds {MAX_NESTING}"
            )));
        }

        for id in pipeline {
            let kind = self.registry.resolve(id).ok_or_else(|| PipeclawError::Step {
                step: id.clone(),
                message: "unknown step id".into(),
                retryable: false,
            })?;

            match kind {
                StepKind::Leaf(step) => {
                    tracing::info!("▶️ [{task}] step '{id}' starting");
                    let params = store.params().clone();
                    match step.execute(&params, store).await {
                        Ok(output) => {
                            store.merge(id, &output.values)?;
                            tracing::info!("✅ [{task}] step '{id}' completed");
                            if output.should_exit {
                                tracing::info!("🛑 [{task}] step '{id}' requested early exit");
                                return Ok(Flow::Exit);
                            }
                        }
                        Err(err) => {
                            tracing::warn!("⚠️ [{task}] step '{id}' failed: {err}");
                            return Err(attach_step(id, err));
                        }
                    }
                }
                StepKind::Nested(def) => {
                    tracing::info!("🔗 [{task}] expanding nested task '{id}'");
                    let flow =
                        Box::pin(self.run_steps(&def.name, &def.pipeline, store, depth + 1))
                            .await?;
                    if matches!(flow, Flow::Exit) {
                        return Ok(Flow::Exit);
                    }
                }
            }
        }

        Ok(Flow::Continue)
    }
}

/// Keep errors that already name their step; wrap everything else so the
/// record always knows where the run died.
fn attach_step(id: &str, err: PipeclawError) -> PipeclawError {
    match err {
        e @ (PipeclawError::Step { .. } | PipeclawError::InvalidStepResult { .. }) => e,
        other => PipeclawError::Step {
            step: id.to_string(),
            message: other.to_string(),
            retryable: other.is_retryable(),
        },
    }
}

fn failing_step(err: &PipeclawError) -> Option<String> {
    match err {
        PipeclawError::Step { step, .. } | PipeclawError::InvalidStepResult { step, .. } => {
            Some(step.clone())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{Step, StepOutput};
    use async_trait::async_trait;
    use serde_json::{Map, json};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counting test step: records invocations, optionally fails or exits.
    struct ProbeStep {
        id: &'static str,
        calls: Arc<AtomicUsize>,
        fail: bool,
        retryable: bool,
        exit: bool,
    }

    impl ProbeStep {
        fn ok(id: &'static str, calls: &Arc<AtomicUsize>) -> Arc<Self> {
            Arc::new(Self {
                id,
                calls: calls.clone(),
                fail: false,
                retryable: true,
                exit: false,
            })
        }

        fn failing(id: &'static str, calls: &Arc<AtomicUsize>, retryable: bool) -> Arc<Self> {
            Arc::new(Self {
                id,
                calls: calls.clone(),
                fail: true,
                retryable,
                exit: false,
            })
        }

        fn exiting(id: &'static str, calls: &Arc<AtomicUsize>) -> Arc<Self> {
            Arc::new(Self {
                id,
                calls: calls.clone(),
                fail: false,
                retryable: true,
                exit: true,
            })
        }
    }

    #[async_trait]
    impl Step for ProbeStep {
        fn name(&self) -> &str {
            self.id
        }

        async fn execute(&self, _: &Map<String, Value>, _: &DataStore) -> Result<StepOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(if self.retryable {
                    PipeclawError::step(self.id, "boom")
                } else {
                    PipeclawError::step_fatal(self.id, "boom")
                });
            }
            let out = StepOutput::empty().context(&format!("{}_done", self.id), true);
            Ok(if self.exit { out.exit() } else { out })
        }
    }

    fn definition(name: &str, pipeline: &[&str]) -> TaskDefinition {
        TaskDefinition {
            name: name.into(),
            pipeline: pipeline.iter().map(|s| s.to_string()).collect(),
            scheduler: None,
            retry_policy: None,
            params: Map::new(),
        }
    }

    fn fresh_store() -> DataStore {
        DataStore::new(json!({}), Map::new())
    }

    #[tokio::test]
    async fn test_all_steps_run_in_order() {
        let calls: Vec<Arc<AtomicUsize>> =
            (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let mut reg = StepRegistry::new();
        reg.register(ProbeStep::ok("s1", &calls[0])).unwrap();
        reg.register(ProbeStep::ok("s2", &calls[1])).unwrap();
        reg.register(ProbeStep::ok("s3", &calls[2])).unwrap();

        let runner = PipelineRunner::new(Arc::new(reg));
        let mut store = fresh_store();
        let outcome = runner
            .run(&definition("t", &["s1", "s2", "s3"]), &mut store)
            .await;

        assert!(outcome.succeeded());
        for c in &calls {
            assert_eq!(c.load(Ordering::SeqCst), 1);
        }
        assert_eq!(outcome.values["context"]["s3_done"], true);
    }

    #[tokio::test]
    async fn test_partial_failure_retention() {
        // 5-step pipeline, step 3 fails: steps 1-2 values retained,
        // steps 4-5 never invoked.
        let calls: Vec<Arc<AtomicUsize>> =
            (0..5).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let mut reg = StepRegistry::new();
        reg.register(ProbeStep::ok("s1", &calls[0])).unwrap();
        reg.register(ProbeStep::ok("s2", &calls[1])).unwrap();
        reg.register(ProbeStep::failing("s3", &calls[2], true)).unwrap();
        reg.register(ProbeStep::ok("s4", &calls[3])).unwrap();
        reg.register(ProbeStep::ok("s5", &calls[4])).unwrap();

        let runner = PipelineRunner::new(Arc::new(reg));
        let mut store = fresh_store();
        let outcome = runner
            .run(&definition("t", &["s1", "s2", "s3", "s4", "s5"]), &mut store)
            .await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.failed_step.as_deref(), Some("s3"));
        assert!(outcome.retryable);
        assert_eq!(outcome.values["context"]["s1_done"], true);
        assert_eq!(outcome.values["context"]["s2_done"], true);
        assert_eq!(calls[3].load(Ordering::SeqCst), 0);
        assert_eq!(calls[4].load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_retry_flag_surfaces() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut reg = StepRegistry::new();
        reg.register(ProbeStep::failing("fatal", &calls, false)).unwrap();

        let runner = PipelineRunner::new(Arc::new(reg));
        let mut store = fresh_store();
        let outcome = runner.run(&definition("t", &["fatal"]), &mut store).await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(!outcome.retryable);
    }

    #[tokio::test]
    async fn test_early_exit_skips_rest() {
        let exit_calls = Arc::new(AtomicUsize::new(0));
        let after_calls = Arc::new(AtomicUsize::new(0));
        let mut reg = StepRegistry::new();
        reg.register(ProbeStep::exiting("gate", &exit_calls)).unwrap();
        reg.register(ProbeStep::ok("after", &after_calls)).unwrap();

        let runner = PipelineRunner::new(Arc::new(reg));
        let mut store = fresh_store();
        let outcome = runner
            .run(&definition("t", &["gate", "after"]), &mut store)
            .await;

        assert!(outcome.succeeded());
        assert_eq!(after_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_nested_task_shares_store() {
        let inner_calls = Arc::new(AtomicUsize::new(0));
        let outer_calls = Arc::new(AtomicUsize::new(0));
        let mut reg = StepRegistry::new();
        reg.register(ProbeStep::ok("inner_step", &inner_calls)).unwrap();
        reg.register(ProbeStep::ok("outer_step", &outer_calls)).unwrap();
        reg.register_nested(definition("sub", &["inner_step"])).unwrap();

        let runner = PipelineRunner::new(Arc::new(reg));
        let mut store = fresh_store();
        let outcome = runner
            .run(&definition("t", &["sub", "outer_step"]), &mut store)
            .await;

        assert!(outcome.succeeded());
        // Nested step values landed in the same store.
        assert_eq!(outcome.values["context"]["inner_step_done"], true);
        assert_eq!(outcome.values["context"]["outer_step_done"], true);
    }

    #[tokio::test]
    async fn test_unknown_step_fails_without_retry() {
        let reg = StepRegistry::new();
        let runner = PipelineRunner::new(Arc::new(reg));
        let mut store = fresh_store();
        let outcome = runner.run(&definition("t", &["ghost"]), &mut store).await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(!outcome.retryable);
        assert_eq!(outcome.failed_step.as_deref(), Some("ghost"));
    }
}
