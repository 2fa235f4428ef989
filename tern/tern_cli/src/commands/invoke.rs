//! Invocation command

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;
use tern_core::types::{HandlerOutcome, InvocationContext, MemoryBudget, StoreEndpoint};
use tern_runtime::functions::timestamp;
use tern_runtime::{InvocationReport, Runtime, RuntimeConfig};
use tracing::{debug, warn};

/// Exit code when the handler ran and failed.
pub const EXIT_HANDLER_FAILED: i32 = 2;

/// Arguments for the invoke command
#[derive(Args)]
pub struct InvokeArgs {
    /// Function name, optionally ending in -balloon or -faascale
    #[clap(long)]
    pub function: String,

    /// Payload store host
    #[clap(long)]
    pub store_host: String,

    /// Payload store password
    #[clap(long)]
    pub store_password: String,

    /// Memory budget in MiB
    #[clap(long)]
    pub memory: u64,

    /// Function arguments as JSON
    #[clap(long, default_value = "null")]
    pub args: String,
}

/// Invoke a function and print its report
pub fn execute(args: &InvokeArgs, config: RuntimeConfig) -> Result<i32> {
    let arguments: Value =
        serde_json::from_str(&args.args).context("--args is not valid JSON")?;
    let budget = MemoryBudget::from_mib(args.memory).context("--memory must be positive")?;
    let context = InvocationContext::new(StoreEndpoint::new(&args.store_host, &args.store_password));

    let runtime = Runtime::with_builtins(config)?;

    let start = timestamp();
    let outcome = runtime.invoke_with_budget(&args.function, arguments, budget, context);
    let finish = timestamp();

    let stats = runtime.shutdown()?;
    debug!(?stats, "Runtime stopped");

    match outcome? {
        HandlerOutcome::Ok { result } => {
            match InvocationReport::from_timestamps(start, &result, finish) {
                Ok(report) => println!("{}", report),
                Err(e) => {
                    warn!(error = %e, "No timing report for this result");
                    println!("{}", result);
                }
            }
            Ok(0)
        }
        HandlerOutcome::Failed { error } => {
            println!("{}", error);
            Ok(EXIT_HANDLER_FAILED)
        }
    }
}
