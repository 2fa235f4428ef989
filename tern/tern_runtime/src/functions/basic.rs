use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use tern_core::types::HandlerError;
use tern_core::HandlerContext;

use super::{number_arg, timestamp};

/// Returns the same timestamp twice.
pub fn hello(_args: &Value, _ctx: &HandlerContext) -> Result<Value, HandlerError> {
    let t = timestamp();
    Ok(json!([t, t]))
}

/// Sleeps for `seconds` and returns the start and end timestamps.
pub fn sleep(args: &Value, _ctx: &HandlerContext) -> Result<Value, HandlerError> {
    let seconds = number_arg(args, "seconds")?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(HandlerError::invalid_arguments(format!(
            "seconds must be a non-negative number, got {}",
            seconds
        )));
    }

    let t1 = timestamp();
    thread::sleep(Duration::from_secs_f64(seconds));
    Ok(json!([t1, timestamp()]))
}

/// Always fails with `message`.
pub fn fail(args: &Value, _ctx: &HandlerContext) -> Result<Value, HandlerError> {
    let message = args
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("function failed");
    Err(HandlerError::failed(message))
}
