//! Error types for the tern dispatcher.
//!
//! The errors are organized by subsystem, with each subsystem having its own
//! error type. The root error type, `Error`, wraps the subsystem errors so
//! callers can handle infrastructure failures uniformly.
//!
//! Handler failures are deliberately absent from this hierarchy: a handler
//! that fails produces a `HandlerOutcome::Failed` value that travels through
//! the normal response path.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::WorkerFailure;

/// Result type used throughout tern.
pub type Result<T> = std::result::Result<T, Error>;

/// Root error type for tern.
#[derive(Debug, Error)]
pub enum Error {
    /// A channel, scope or pipe could not be set up
    #[error("Setup error: {0}")]
    Setup(#[from] SetupError),

    /// Process creation failed after setup
    #[error("Fork error: {0}")]
    Fork(String),

    /// SyncChannel protocol errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Resource scope errors
    #[error("Scope error: {0}")]
    Scope(#[from] ScopeError),

    /// Errors reported by or about a worker
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// A bounded wait expired
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A wait was abandoned because its cancellation token fired
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General runtime errors
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Errors raised while preparing an invocation, before any worker runs it.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The generated channel path already exists
    #[error("Channel path already exists: {}", .0.display())]
    ChannelCollision(PathBuf),

    /// The channel could not be created
    #[error("Failed to create channel at {}: {source}", path.display())]
    Channel {
        /// Path of the channel.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// The scope directory could not be created
    #[error("Failed to create scope at {}: {source}", path.display())]
    ScopeCreate {
        /// Path of the scope directory.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// A scope control entry could not be written
    #[error("Failed to write {entry} for scope {}: {source}", path.display())]
    ScopeConfigure {
        /// Path of the scope directory.
        path: PathBuf,
        /// Name of the control entry.
        entry: String,
        /// Underlying error.
        source: io::Error,
    },

    /// The internal result pipe could not be created
    #[error("Failed to create result pipe: {0}")]
    Pipe(String),

    /// The dispatch queue no longer has a consumer
    #[error("Dispatch queue is closed")]
    QueueClosed,

    /// The dispatch queue is full
    #[error("Dispatch queue is full")]
    QueueFull,
}

/// Errors in the SyncChannel exchange.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The peer closed its side before a complete frame arrived
    #[error("Peer closed channel {} before a complete frame", .0.display())]
    Closed(PathBuf),

    /// The channel file no longer exists
    #[error("Channel {} no longer exists", .0.display())]
    Gone(PathBuf),

    /// The frame exceeds the maximum size
    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    /// The frame body could not be decoded
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Errors related to resource scopes.
#[derive(Debug, Error)]
pub enum ScopeError {
    /// The scope still has live members
    #[error("Scope {name} still has {members} live member(s)")]
    Busy {
        /// Scope name.
        name: String,
        /// Number of live members.
        members: usize,
    },

    /// Teardown did not succeed within the retry budget
    #[error("Scope {name} could not be removed after {attempts} attempt(s): {reason}")]
    Teardown {
        /// Scope name.
        name: String,
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        reason: String,
    },

    /// A process could not join the scope
    #[error("Process {pid} failed to join scope {name}: {source}")]
    Join {
        /// Scope name.
        name: String,
        /// Joining process id.
        pid: i32,
        /// Underlying error.
        source: io::Error,
    },

    /// A control entry could not be read or written
    #[error("Control entry {entry} of scope {name} failed: {source}")]
    Control {
        /// Scope name.
        name: String,
        /// Name of the control entry.
        entry: String,
        /// Underlying error.
        source: io::Error,
    },

    /// A scope name is not a single safe path component
    #[error("Invalid scope name: {0:?}")]
    InvalidName(String),

    /// A memory budget could not be parsed or is zero
    #[error("Invalid memory budget: {0:?}")]
    InvalidBudget(String),
}

/// Errors related to worker execution.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker reported an infrastructure failure through the channel
    #[error("{class} failure reported by worker: {message}")]
    Reported {
        /// Classification of the failure.
        class: ErrorClass,
        /// Failure description.
        message: String,
    },

    /// A forked child exited without producing a result
    #[error("Child {pid} exited without a result: {status}")]
    ChildExited {
        /// Child process id.
        pid: i32,
        /// Exit status description.
        status: String,
    },

    /// A process could not be signalled or reaped
    #[error("Failed to signal or reap process {pid}: {reason}")]
    Signal {
        /// Target process id.
        pid: i32,
        /// Failure description.
        reason: String,
    },
}

/// Failure classes of the dispatcher's error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Channel or scope creation failed; nothing to clean up.
    Setup,
    /// Process creation failed after scope setup.
    Fork,
    /// The invoked function failed; carried as data.
    Handler,
    /// A scope could not be removed.
    Teardown,
    /// A worker did not answer within its deadline.
    Timeout,
    /// The wait was cancelled.
    Cancelled,
    /// Anything else.
    Internal,
}

impl ErrorClass {
    /// Get the name of this class.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Fork => "fork",
            Self::Handler => "handler",
            Self::Teardown => "teardown",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Setup(_) => ErrorClass::Setup,
            Self::Fork(_) => ErrorClass::Fork,
            Self::Scope(ScopeError::Busy { .. } | ScopeError::Teardown { .. }) => {
                ErrorClass::Teardown
            }
            Self::Scope(ScopeError::InvalidName(_) | ScopeError::InvalidBudget(_)) => {
                ErrorClass::Setup
            }
            Self::Worker(WorkerError::Reported { class, .. }) => *class,
            Self::Timeout(_) => ErrorClass::Timeout,
            Self::Cancelled(_) => ErrorClass::Cancelled,
            _ => ErrorClass::Internal,
        }
    }

    /// Whether the caller may retry the invocation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Setup | ErrorClass::Fork | ErrorClass::Timeout
        )
    }

    /// Rebuild an error from a failure a worker wrote into the channel.
    pub fn from_failure(failure: WorkerFailure) -> Self {
        match failure.class {
            ErrorClass::Timeout => Self::Timeout(failure.message),
            ErrorClass::Cancelled => Self::Cancelled(failure.message),
            class => Self::Worker(WorkerError::Reported {
                class,
                message: failure.message,
            }),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
