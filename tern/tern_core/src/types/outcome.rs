//! Handler outcomes and worker responses.
//!
//! A handler failure is data: it is serialized into the response exactly
//! like a successful result, so a caller can always tell "the function
//! failed" apart from "the infrastructure failed".

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorClass};

/// Why a handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorKind {
    /// No handler is registered under the requested name.
    UnknownFunction,
    /// The arguments were missing or malformed.
    InvalidArguments,
    /// The handler returned an error.
    Failed,
    /// The handler panicked.
    Panicked,
}

/// A handler-level failure, carried as data inside the response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerError {
    /// Failure kind.
    pub kind: HandlerErrorKind,

    /// Human-readable message.
    pub message: String,
}

impl HandlerError {
    /// Create a new handler error.
    pub fn new(kind: HandlerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The function is not registered.
    pub fn unknown_function(name: &str) -> Self {
        Self::new(
            HandlerErrorKind::UnknownFunction,
            format!("unknown function: {}", name),
        )
    }

    /// The arguments were rejected.
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::InvalidArguments, message)
    }

    /// The handler itself failed.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Failed, message)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            HandlerErrorKind::UnknownFunction => "unknown function",
            HandlerErrorKind::InvalidArguments => "invalid arguments",
            HandlerErrorKind::Failed => "failed",
            HandlerErrorKind::Panicked => "panicked",
        };
        write!(f, "handler {}: {}", kind, self.message)
    }
}

impl std::error::Error for HandlerError {}

/// The outcome of running a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandlerOutcome {
    /// The handler returned a result.
    Ok {
        /// The result payload.
        result: serde_json::Value,
    },

    /// The handler failed.
    Failed {
        /// The failure.
        error: HandlerError,
    },
}

impl HandlerOutcome {
    /// A successful outcome.
    pub fn ok(result: serde_json::Value) -> Self {
        Self::Ok { result }
    }

    /// A failed outcome.
    pub fn failed(error: HandlerError) -> Self {
        Self::Failed { error }
    }

    /// Whether the handler succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// The result, if the handler succeeded.
    pub fn result(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Ok { result } => Some(result),
            Self::Failed { .. } => None,
        }
    }

    /// The error, if the handler failed.
    pub fn error(&self) -> Option<&HandlerError> {
        match self {
            Self::Ok { .. } => None,
            Self::Failed { error } => Some(error),
        }
    }

    /// Convert into a standard result.
    pub fn into_result(self) -> Result<serde_json::Value, HandlerError> {
        match self {
            Self::Ok { result } => Ok(result),
            Self::Failed { error } => Err(error),
        }
    }
}

impl From<Result<serde_json::Value, HandlerError>> for HandlerOutcome {
    fn from(result: Result<serde_json::Value, HandlerError>) -> Self {
        match result {
            Ok(result) => Self::Ok { result },
            Err(error) => Self::Failed { error },
        }
    }
}

/// An infrastructure failure a worker reports through the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFailure {
    /// Failure class.
    pub class: ErrorClass,

    /// Failure description.
    pub message: String,
}

impl WorkerFailure {
    /// Create a new worker failure.
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

impl From<&Error> for WorkerFailure {
    fn from(error: &Error) -> Self {
        Self::new(error.class(), error.to_string())
    }
}

/// The response frame a worker writes into the SyncChannel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// The handler ran; its outcome may still be a handler failure.
    Completed {
        /// Handler outcome.
        outcome: HandlerOutcome,
    },

    /// The worker could not run the handler to completion.
    Failed {
        /// Infrastructure failure.
        failure: WorkerFailure,
    },
}

impl WorkerResponse {
    /// Convert into the caller-facing result.
    pub fn into_outcome(self) -> crate::error::Result<HandlerOutcome> {
        match self {
            Self::Completed { outcome } => Ok(outcome),
            Self::Failed { failure } => Err(Error::from_failure(failure)),
        }
    }
}
