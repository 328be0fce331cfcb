//! Webhook delivery step — POST item batches to a configured URL.
//!
//! Consumes the per-sweep budget one item at a time: once the budget for
//! the current dispatcher sweep is spent, remaining items are deferred to
//! the next cycle rather than hammering the receiver. Delivery is
//! at-least-once; receivers are expected to deduplicate.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use pipeclaw_core::{PipeclawError, Result};
use pipeclaw_pipeline::{DataStore, Step, StepOutput};
use pipeclaw_scheduler::{ResourceGate, SweepBudget};

pub struct WebhookStep {
    gate: Arc<ResourceGate>,
    budget: Arc<SweepBudget>,
}

impl WebhookStep {
    pub fn new(gate: Arc<ResourceGate>, budget: Arc<SweepBudget>) -> Self {
        Self { gate, budget }
    }

    /// Items to deliver: an explicit `items` array, or a single `payload`
    /// object, or (fallback) the run's accumulated outputs.
    fn collect_items(params: &Map<String, Value>, store: &DataStore) -> Result<Vec<Value>> {
        if let Some(items) = params.get("items") {
            return items
                .as_array()
                .cloned()
                .ok_or_else(|| PipeclawError::step_fatal("post_webhook", "'items' must be a list"));
        }
        if let Some(payload) = params.get("payload") {
            return Ok(vec![payload.clone()]);
        }
        let outputs = store.export_results()["output"].clone();
        if outputs.as_object().is_some_and(|o| !o.is_empty()) {
            return Ok(vec![outputs]);
        }
        Err(PipeclawError::step_fatal(
            "post_webhook",
            "Nothing to deliver: no 'items', 'payload', or run outputs",
        ))
    }
}

#[async_trait]
impl Step for WebhookStep {
    fn name(&self) -> &str {
        "post_webhook"
    }

    async fn execute(&self, params: &Map<String, Value>, store: &DataStore) -> Result<StepOutput> {
        let url = params
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PipeclawError::step_fatal("post_webhook", "Missing 'url' param"))?;
        let items = Self::collect_items(params, store)?;

        let client = reqwest::Client::builder()
            .user_agent("PipeClaw/0.2")
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| PipeclawError::step_fatal("post_webhook", format!("Client error: {e}")))?;

        let mut delivered = 0usize;
        let mut deferred = 0usize;
        for item in &items {
            if !self.budget.try_take() {
                // Sweep budget spent — leave the rest for the next cycle.
                deferred = items.len() - delivered;
                tracing::info!(
                    "⏸️ post_webhook budget spent: {delivered} delivered, {deferred} deferred"
                );
                break;
            }

            let _permit = self.gate.acquire().await?;
            let response = client
                .post(url)
                .json(item)
                .send()
                .await
                .map_err(|e| PipeclawError::step("post_webhook", format!("Send failed: {e}")))?;

            if !response.status().is_success() {
                return Err(PipeclawError::step(
                    "post_webhook",
                    format!("Webhook error {} after {delivered} item(s)", response.status()),
                ));
            }
            delivered += 1;
        }

        tracing::info!("📤 post_webhook delivered {delivered} item(s) to {url}");
        Ok(StepOutput::empty()
            .output("webhook_delivered", delivered)
            .value("webhook_deferred", json!(deferred)))
    }
}
