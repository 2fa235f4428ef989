//! Subcommand implementations
//!
//! Each subcommand returns the process exit code on success; errors are
//! reported by `main` with exit code 1.

pub mod config;
pub mod invoke;
pub mod scope;
