//! # PipeClaw Scheduler
//!
//! Scheduling and dispatch for agent task pipelines: next-run computation,
//! durable task records with atomic claiming, and the poll → claim → run →
//! reschedule loop.
//!
//! ## Architecture
//! ```text
//! DispatcherEngine (tokio interval)
//!   ├── claim_due(limit) — atomic, multi-worker safe
//!   ├── per record: PipelineRunner over a fresh DataStore
//!   │     └── gated steps acquire the ResourceGate (semaphore)
//!   ├── success → policy::next_run(completion time) → reschedule
//!   └── failure → policy::retry_run → reschedule | finalize
//!
//! Schedule policies
//!   ├── cron:            "0 8 * * *"  (5-field, UTC)
//!   ├── random_interval: uniform(min_minutes, max_minutes)
//!   └── one_time:        absolute timestamp, finalized after the run
//! ```
//!
//! The record store's conditional pending→claimed update is the sole
//! cross-worker correctness mechanism; no distributed lock exists.

pub mod cron;
pub mod engine;
pub mod gate;
pub mod persistence;
pub mod policy;
pub mod store;
pub mod tasks;

pub use cron::CronSchedule;
pub use engine::{DispatcherEngine, spawn_dispatcher};
pub use gate::{GatePermit, ResourceGate, SweepBudget};
pub use persistence::SqliteRecordStore;
pub use store::{MemoryRecordStore, RecordStore};
pub use tasks::{RecordStatus, TaskRecord};
