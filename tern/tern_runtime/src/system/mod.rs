//! System management for the tern runtime
//!
//! This module provides configuration loading and the bootstrap sequence
//! that wires controllers, workers, the supervisor and the dispatcher.

pub mod bootstrap;
pub mod config;

pub use bootstrap::System;
pub use config::RuntimeConfig;
