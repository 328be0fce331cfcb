//! # PipeClaw — Agent Task Scheduler & Pipeline Runner
//!
//! Loads task definitions from TOML, arms their schedules, and runs the
//! dispatcher loop: claim due records, execute pipelines, reschedule.
//!
//! Usage:
//!   pipeclaw                        # Dispatcher with ~/.pipeclaw/config.toml
//!   pipeclaw --config tasks.toml    # Custom config path
//!   pipeclaw --once                 # Single sweep, then exit
//!   pipeclaw --run <task>           # Arm a one-off run of <task> right now

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use pipeclaw_core::PipeclawConfig;
use pipeclaw_pipeline::StepRegistry;
use pipeclaw_scheduler::{
    DispatcherEngine, MemoryRecordStore, RecordStore, ResourceGate, SqliteRecordStore,
    SweepBudget, spawn_dispatcher,
};

#[derive(Parser)]
#[command(
    name = "pipeclaw",
    version,
    about = "⏰ PipeClaw — agent task scheduling & pipeline execution"
)]
struct Cli {
    /// Config file path (default: ~/.pipeclaw/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Run a single sweep and exit
    #[arg(long)]
    once: bool,

    /// Arm a one-off run of the named task, due immediately
    #[arg(long)]
    run: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "pipeclaw=debug,pipeclaw_scheduler=debug,pipeclaw_pipeline=debug,pipeclaw_steps=debug"
    } else {
        "pipeclaw=info,pipeclaw_scheduler=info,pipeclaw_pipeline=info,pipeclaw_steps=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    // Load and validate configuration. A malformed task definition is fatal
    // here — it must never be silently dropped.
    let config = match &cli.config {
        Some(path) => PipeclawConfig::load_from(std::path::Path::new(&expand_path(path)))?,
        None => PipeclawConfig::load()?,
    };
    config.validate()?;

    // Process-wide gate + per-sweep budget, shared by all pipelines.
    let gate = Arc::new(ResourceGate::new(config.gate.max_concurrent_calls));
    let budget = Arc::new(SweepBudget::new(config.gate.max_items_per_sweep));

    // Step registry: builtin steps plus every task definition, so pipelines
    // can reference other tasks as nested steps.
    let mut registry = StepRegistry::new();
    pipeclaw_steps::register_builtins(&mut registry, gate.clone(), budget.clone())?;
    for task in &config.tasks {
        registry.register_nested(task.clone())?;
    }
    let registry = Arc::new(registry);

    // Record store backend.
    let store: Arc<dyn RecordStore> = match config.store.backend.as_str() {
        "memory" => Arc::new(MemoryRecordStore::new()),
        "sqlite" => {
            let path = expand_path(&config.store.path);
            if let Some(parent) = std::path::Path::new(&path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            Arc::new(SqliteRecordStore::open(std::path::Path::new(&path))?)
        }
        other => anyhow::bail!("Unknown store backend '{other}' (expected 'sqlite' or 'memory')"),
    };

    let engine = Arc::new(DispatcherEngine::new(&config, registry, store, budget));
    engine.initialize().await?;

    println!("⏰ PipeClaw v{}", env!("CARGO_PKG_VERSION"));
    println!("   🤖 Agent:  {}", config.agent_id);
    println!("   📋 Tasks:  {} defined", config.tasks.len());
    println!(
        "   🔄 Poll:   every {}s, up to {} records per sweep",
        config.dispatcher.poll_interval_secs, config.dispatcher.task_limit
    );
    println!(
        "   🚪 Gate:   {} concurrent calls, {} items per sweep",
        config.gate.max_concurrent_calls, config.gate.max_items_per_sweep
    );
    println!("   🗄️  Store:  {}", config.store.backend);
    println!();

    if let Some(task) = &cli.run {
        let id = engine.schedule_now(task, serde_json::Map::new()).await?;
        println!("📌 One-off record {id} armed for '{task}'");
    }

    if cli.once {
        let processed = engine.clone().sweep().await?;
        println!("✅ Sweep complete: {processed} record(s) processed");
        return Ok(());
    }

    spawn_dispatcher(engine).await;
    Ok(())
}
