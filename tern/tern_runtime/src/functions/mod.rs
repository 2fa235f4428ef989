//! Built-in functions.
//!
//! Small handlers used to exercise the dispatch paths end to end. Each one
//! returns a pair of wall-clock timestamps (seconds since the epoch) so the
//! caller can render an invocation report.

mod basic;
mod memory;

use serde_json::Value;
use tern_core::registry::HandlerRegistryBuilder;
use tern_core::types::HandlerError;
use tern_core::HandlerRegistry;

pub use basic::{fail, hello, sleep};
pub use memory::{alloc, scope_info};

/// Names of the built-in functions.
pub const BUILTIN_NAMES: [&str; 5] = ["hello", "alloc", "sleep", "fail", "scope-info"];

/// A registry holding every built-in function.
pub fn builtin_registry() -> HandlerRegistry {
    register_builtins(HandlerRegistry::builder()).build()
}

/// Add the built-in functions to `builder`.
pub fn register_builtins(builder: HandlerRegistryBuilder) -> HandlerRegistryBuilder {
    builder
        .register_fn("hello", hello)
        .register_fn("alloc", alloc)
        .register_fn("sleep", sleep)
        .register_fn("fail", fail)
        .register_fn("scope-info", scope_info)
}

/// Current wall-clock time in seconds, with microsecond resolution.
pub fn timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

fn number_arg(args: &Value, key: &str) -> Result<f64, HandlerError> {
    args.get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| HandlerError::invalid_arguments(format!("missing numeric argument {:?}", key)))
}
