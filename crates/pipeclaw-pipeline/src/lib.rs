//! # PipeClaw Pipeline
//!
//! Ordered step execution over a shared per-run data store.
//!
//! ## Architecture
//! ```text
//! PipelineRunner
//!   ├── StepRegistry: id → Leaf(step) | Nested(task definition)
//!   ├── DataStore: config + flat params + context (append) + output (overwrite)
//!   └── per step: resolve → invoke → merge values → next
//!                  └── on failure: stop, keep partial values
//! ```
//!
//! The registry is built once at startup and passed by `Arc` — there is no
//! global step table. Nested task entries expand inline over the same
//! DataStore, so context and output keep accumulating across task
//! boundaries.

pub mod datastore;
pub mod registry;
pub mod runner;
pub mod step;

pub use datastore::{DataStore, ValueEntry};
pub use registry::{StepKind, StepRegistry};
pub use runner::{PipelineRunner, RunOutcome, RunStatus};
pub use step::{Step, StepOutput};
