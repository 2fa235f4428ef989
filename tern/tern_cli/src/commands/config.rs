//! Configuration commands

use anyhow::Result;
use clap::Args;
use tern_runtime::RuntimeConfig;

/// Arguments for the show-config command
#[derive(Args)]
pub struct ShowConfigArgs {}

/// Print the effective configuration
pub fn execute(_args: &ShowConfigArgs, config: &RuntimeConfig) -> Result<i32> {
    print!("{}", config.to_toml()?);
    Ok(0)
}
