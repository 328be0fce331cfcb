//! # PipeClaw Steps
//!
//! Builtin leaf steps. The engine treats steps as opaque collaborators
//! behind the `Step` trait — these are the stock implementations a default
//! deployment ships with:
//! - **http_request**: fetch/call an external API through the resource gate
//! - **post_webhook**: deliver item batches to a webhook, bounded by the
//!   per-sweep budget
//!
//! Both acquire the shared `ResourceGate` around every network call, so
//! process-wide call concurrency stays within the configured cap no matter
//! how many pipelines run at once.

pub mod http_request;
pub mod webhook;

use std::sync::Arc;

use pipeclaw_core::Result;
use pipeclaw_pipeline::StepRegistry;
use pipeclaw_scheduler::{ResourceGate, SweepBudget};

pub use http_request::HttpRequestStep;
pub use webhook::WebhookStep;

/// Register every builtin step against the shared gate and budget.
pub fn register_builtins(
    registry: &mut StepRegistry,
    gate: Arc<ResourceGate>,
    budget: Arc<SweepBudget>,
) -> Result<()> {
    registry.register(Arc::new(HttpRequestStep::new(gate.clone())))?;
    registry.register(Arc::new(WebhookStep::new(gate, budget)))?;
    Ok(())
}
