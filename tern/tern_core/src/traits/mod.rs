//! Traits implemented at the seams of the dispatcher.

pub mod handler;

pub use handler::{FunctionHandler, HandlerContext};
