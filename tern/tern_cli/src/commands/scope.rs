//! Resource scope commands

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tern_core::types::MemoryBudget;
use tern_isolation::ResourceScope;
use tern_runtime::system::bootstrap::build_controller;
use tern_runtime::RuntimeConfig;
use tracing::info;

/// Arguments for the bench-scope command
#[derive(Args)]
pub struct BenchScopeArgs {
    /// Scope budget in MiB
    #[clap(long)]
    pub size: u64,

    /// Number of scale-up/scale-down rounds
    #[clap(long, default_value_t = 10)]
    pub rounds: u32,
}

/// Average latencies of one benchmark run
#[derive(Debug, Serialize)]
pub struct BenchResult {
    pub scope: String,
    pub size_mib: u64,
    pub rounds: u32,
    pub scale_up_ms: f64,
    pub scale_down_ms: f64,
}

/// Create one scope, resize and reclaim it repeatedly, then tear it down
pub fn execute(args: &BenchScopeArgs, config: &RuntimeConfig) -> Result<i32> {
    let budget = MemoryBudget::from_mib(args.size).context("--size must be positive")?;
    let rounds = args.rounds.max(1);

    let controller = build_controller(&config.scope)?;
    let mut scope = ResourceScope::create(controller, budget, config.scope.retry_policy())?;
    info!(scope = %scope.name(), %budget, rounds, "Benchmarking scope");

    let mut scale_up = Duration::ZERO;
    let mut scale_down = Duration::ZERO;
    for _ in 0..rounds {
        let started = Instant::now();
        scope.controller().set_budget(scope.name(), budget)?;
        scale_up += started.elapsed();

        let started = Instant::now();
        scope.reclaim()?;
        scale_down += started.elapsed();
    }

    let result = BenchResult {
        scope: scope.name().to_string(),
        size_mib: budget.mib(),
        rounds,
        scale_up_ms: millis(scale_up) / f64::from(rounds),
        scale_down_ms: millis(scale_down) / f64::from(rounds),
    };

    scope.teardown()?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(0)
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
