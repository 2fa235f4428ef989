//! Utility modules.

pub mod deadline;
pub mod logging;

pub use deadline::{CancellationToken, Deadline};
pub use logging::LogLevel;
