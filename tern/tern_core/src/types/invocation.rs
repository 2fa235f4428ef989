//! Invocation requests and the isolation-kind selection protocol.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::memory::MemoryBudget;
use crate::id::InvocationId;

/// How an invocation is isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationKind {
    /// Run the handler directly in the caller's context.
    None,

    /// Run the handler in a fresh process without a memory ceiling; elasticity
    /// is left to the host's balloon device.
    Balloon,

    /// Run the handler in a forked child bounded by a dedicated resource scope.
    Scale,
}

impl IsolationKind {
    /// The function-name suffix selecting balloon isolation.
    pub const BALLOON_SUFFIX: &'static str = "-balloon";

    /// The function-name suffix selecting scale isolation.
    pub const SCALE_SUFFIX: &'static str = "-faascale";

    /// Split a function name into its isolation kind and bare name.
    ///
    /// A name without a recognised suffix, or one that would be empty once
    /// the suffix is removed, selects direct invocation and is returned
    /// unchanged.
    ///
    /// ```
    /// use tern_core::IsolationKind;
    ///
    /// assert_eq!(IsolationKind::split("hello-faascale"), (IsolationKind::Scale, "hello"));
    /// assert_eq!(IsolationKind::split("hello-balloon"), (IsolationKind::Balloon, "hello"));
    /// assert_eq!(IsolationKind::split("hello"), (IsolationKind::None, "hello"));
    /// ```
    pub fn split(function_name: &str) -> (IsolationKind, &str) {
        for kind in [IsolationKind::Balloon, IsolationKind::Scale] {
            if let Some(bare) = kind
                .suffix()
                .and_then(|suffix| function_name.strip_suffix(suffix))
            {
                if !bare.is_empty() {
                    return (kind, bare);
                }
            }
        }
        (IsolationKind::None, function_name)
    }

    /// The suffix for this kind, if any.
    pub fn suffix(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Balloon => Some(Self::BALLOON_SUFFIX),
            Self::Scale => Some(Self::SCALE_SUFFIX),
        }
    }

    /// Whether this kind goes through the supervisor.
    pub fn is_isolated(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Get the name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Balloon => "balloon",
            Self::Scale => "scale",
        }
    }
}

impl fmt::Display for IsolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoint and credential of the key/value store handlers use for payloads.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEndpoint {
    /// Store host name or address.
    pub host: String,

    /// Store credential.
    pub credential: String,
}

impl StoreEndpoint {
    /// Create a new store endpoint.
    pub fn new(host: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            credential: credential.into(),
        }
    }
}

impl fmt::Debug for StoreEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreEndpoint")
            .field("host", &self.host)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Caller-supplied context of an invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationContext {
    /// The payload store.
    pub store: StoreEndpoint,
}

impl InvocationContext {
    /// Create a context for the given store.
    pub fn new(store: StoreEndpoint) -> Self {
        Self { store }
    }
}

/// Location of the resource scope a scale invocation runs in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeInfo {
    /// Scope name.
    pub name: String,

    /// Scope directory.
    pub path: PathBuf,

    /// The scope's size-control entry.
    pub size_control: PathBuf,
}

/// One isolated invocation, as written into the SyncChannel.
///
/// Built by the dispatcher per call and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    /// Invocation id.
    pub id: InvocationId,

    /// Bare function name, suffix removed.
    pub function: String,

    /// Opaque argument payload.
    pub arguments: serde_json::Value,

    /// Memory budget for scale invocations.
    pub memory_budget: MemoryBudget,

    /// Isolation kind.
    pub kind: IsolationKind,

    /// Caller context.
    pub context: InvocationContext,
}
