use std::env;
use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tern_core::utils::logging::LogLevel;
use tern_runtime::RuntimeConfig;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::config::ShowConfigArgs;
use commands::invoke::InvokeArgs;
use commands::scope::BenchScopeArgs;

/// Tern function invocation dispatcher
///
/// Runs functions directly, in a fresh worker process (`-balloon` suffix)
/// or in a forked child inside its own memory scope (`-faascale` suffix).
#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Configuration file [env: TERN_CONFIG]
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn or error [env: TERN_LOG]
    #[clap(long, global = true)]
    log_level: Option<LogLevel>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke a function and print its timing report
    Invoke(InvokeArgs),

    /// Measure scale-up and scale-down latency of one resource scope
    #[clap(name = "bench-scope")]
    BenchScope(BenchScopeArgs),

    /// Print the effective configuration as TOML
    #[clap(name = "show-config")]
    ShowConfig(ShowConfigArgs),
}

fn main() {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let config_path = cli
        .config
        .or_else(|| env::var_os("TERN_CONFIG").map(PathBuf::from));
    let env_level = match env::var("TERN_LOG") {
        Ok(raw) => Some(raw.parse::<LogLevel>().map_err(anyhow::Error::msg)?),
        Err(_) => None,
    };

    // Read the file before logging is up so its level can apply.
    let mut config = RuntimeConfig::load(config_path.as_deref())?;
    if let Some(level) = cli.log_level.or(env_level) {
        config.logging.level = level;
    }
    init_logging(config.logging.level);

    match cli.command {
        Commands::Invoke(args) => commands::invoke::execute(&args, config),
        Commands::BenchScope(args) => commands::scope::execute(&args, &config),
        Commands::ShowConfig(args) => commands::config::execute(&args, &config),
    }
}

/// Install the stderr subscriber. `RUST_LOG` overrides `level`.
fn init_logging(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
