use std::fs;
use std::hint::black_box;

use serde_json::{json, Value};
use tern_core::types::{HandlerError, MemoryBudget};
use tern_core::HandlerContext;

use super::{number_arg, timestamp};

const PAGE_SIZE: usize = 4096;
const MIB: usize = 1024 * 1024;

/// Largest allocation `alloc` accepts, in MiB.
pub const MAX_ALLOC_MIB: u64 = 64 * 1024;

/// Touches `size` MiB of freshly allocated memory.
///
/// Every page is written so the memory is actually charged to the process,
/// and to its scope when one is attached.
pub fn alloc(args: &Value, _ctx: &HandlerContext) -> Result<Value, HandlerError> {
    let size = number_arg(args, "size")?;
    if size.fract() != 0.0 || size < 1.0 || size > MAX_ALLOC_MIB as f64 {
        return Err(HandlerError::invalid_arguments(format!(
            "size must be a whole number of MiB between 1 and {}, got {}",
            MAX_ALLOC_MIB, size
        )));
    }
    let bytes = size as usize * MIB;

    let t1 = timestamp();
    let mut buffer: Vec<u8> = Vec::new();
    buffer
        .try_reserve_exact(bytes)
        .map_err(|e| HandlerError::failed(format!("allocating {} MiB failed: {}", size, e)))?;
    buffer.resize(bytes, 0);
    for offset in (0..bytes).step_by(PAGE_SIZE) {
        buffer[offset] = 1;
    }
    black_box(&buffer);
    drop(buffer);

    Ok(json!([t1, timestamp()]))
}

/// Reports the scope the handler runs in and the budget read back from it.
pub fn scope_info(_args: &Value, ctx: &HandlerContext) -> Result<Value, HandlerError> {
    let scope = ctx
        .scope
        .as_ref()
        .ok_or_else(|| HandlerError::failed("not running inside a resource scope"))?;

    let raw = fs::read_to_string(&scope.size_control).map_err(|e| {
        HandlerError::failed(format!(
            "reading {} failed: {}",
            scope.size_control.display(),
            e
        ))
    })?;
    let budget: MemoryBudget = raw
        .trim()
        .parse()
        .map_err(|e| HandlerError::failed(format!("unexpected size entry {:?}: {}", raw, e)))?;

    Ok(json!({
        "scope": scope.name,
        "path": scope.path,
        "size": budget.to_control_string(),
        "mib": budget.mib(),
    }))
}
