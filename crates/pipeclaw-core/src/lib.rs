//! # PipeClaw Core
//!
//! Shared building blocks for the PipeClaw engine:
//! - **config**: TOML configuration — operational knobs + task definitions
//! - **error**: the `PipeclawError` taxonomy and crate-wide `Result`
//!
//! Engine logic lives in `pipeclaw-pipeline` and `pipeclaw-scheduler`;
//! this crate stays dependency-light so every member can use it.

pub mod config;
pub mod error;

pub use config::{
    DispatcherConfig, GateConfig, PipeclawConfig, RetryConfig, RetryDefaults, SchedulerPolicy,
    StoreConfig, TaskDefinition,
};
pub use error::{PipeclawError, Result};
