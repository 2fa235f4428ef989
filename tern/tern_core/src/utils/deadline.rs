//! Deadlines and cancellation.
//!
//! Every blocking wait in tern takes a `Deadline` and a `CancellationToken`.
//! Waits are performed in bounded slices so the token is observed promptly
//! even while a system call would otherwise block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Upper bound on a single blocking slice.
pub const WAIT_SLICE: Duration = Duration::from_millis(50);

/// An absolute point in time after which a wait fails with a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(timeout),
        }
    }

    /// A deadline at a specific instant.
    pub fn at(instant: Instant) -> Self {
        Self { at: Some(instant) }
    }

    /// A deadline that never expires.
    pub fn never() -> Self {
        Self { at: None }
    }

    /// The instant of expiry, if bounded.
    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    /// Time left, or `None` if unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        matches!(self.at, Some(at) if Instant::now() >= at)
    }

    /// Length of the next wait slice: at most `max`, never past the deadline.
    pub fn slice(&self, max: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => remaining.min(max),
            None => max,
        }
    }

    /// The earlier of two deadlines.
    pub fn earliest(self, other: Deadline) -> Deadline {
        match (self.at, other.at) {
            (Some(a), Some(b)) => Deadline::at(a.min(b)),
            (Some(_), None) => self,
            (None, _) => other,
        }
    }

    /// Fail if the deadline has passed or the token was cancelled.
    ///
    /// # Arguments
    ///
    /// * `cancel` - The token to observe.
    /// * `what` - Description of the wait, used in the error message.
    pub fn check(&self, cancel: &CancellationToken, what: &str) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(what.to_string()));
        }
        if self.is_expired() {
            return Err(Error::Timeout(what.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    parent: Option<Arc<TokenState>>,
}

impl TokenState {
    fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        self.parent
            .as_ref()
            .is_some_and(|parent| parent.is_cancelled())
    }
}

/// A shared cancellation flag.
///
/// Child tokens observe their parent's cancellation; cancelling a child
/// does not affect the parent.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// Create a new, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested on this token or an ancestor.
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Create a child token.
    pub fn child(&self) -> Self {
        Self {
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                parent: Some(Arc::clone(&self.state)),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_deadline_expiry() {
        let deadline = Deadline::after(Duration::from_millis(20));
        assert!(!deadline.is_expired());
        assert!(deadline.remaining().unwrap() <= Duration::from_millis(20));

        sleep(Duration::from_millis(30));
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));

        let err = deadline
            .check(&CancellationToken::new(), "waiting for test")
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(ref w) if w == "waiting for test"));
    }

    #[test]
    fn test_never_and_earliest() {
        let never = Deadline::never();
        assert!(!never.is_expired());
        assert_eq!(never.remaining(), None);
        assert_eq!(never.slice(WAIT_SLICE), WAIT_SLICE);

        let soon = Deadline::after(Duration::from_millis(5));
        assert_eq!(never.earliest(soon), soon);
        assert_eq!(soon.earliest(never), soon);

        let later = Deadline::after(Duration::from_secs(60));
        assert_eq!(later.earliest(soon), soon);
        assert!(soon.slice(WAIT_SLICE) <= Duration::from_millis(5));
    }

    #[test]
    fn test_cancellation_propagates_to_children() {
        let root = CancellationToken::new();
        let child = root.child();
        let grandchild = child.child();

        assert!(!grandchild.is_cancelled());
        child.cancel();
        assert!(grandchild.is_cancelled());
        assert!(!root.is_cancelled());

        let err = Deadline::never().check(&grandchild, "reading").unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }
}
