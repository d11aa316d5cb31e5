//! Hierarchical cancellation token for async operations.
//!
//! Every suspension point in the agent (accept, handshake read, ack wait,
//! keepalive probe, enqueue-and-wait) selects on a `CancellationToken` so a
//! parent shutdown unblocks all of them promptly. Tokens form a tree:
//! cancelling a token cancels all of its children, while cancelling a child
//! leaves the parent untouched. Each dataplane connection runs under a child
//! of the server token, so closing one connection never stops the listener.

use std::future::Future;
use tokio_util::sync::CancellationToken as Token;

/// A cancellation token for cooperative cancellation of async operations.
///
/// This token can be cloned and shared across tasks. When `cancel()` is called
/// on any clone, all clones (and all child tokens) observe the cancellation.
///
/// # Example
///
/// ```
/// use nodeagent::cancel::CancellationToken;
///
/// let parent = CancellationToken::new();
/// let child = parent.child_token();
///
/// parent.cancel();
/// assert!(child.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Token,
}

impl CancellationToken {
    /// Create a new cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of this token and all of its children.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }

    /// Create a child token.
    ///
    /// Cancelling the parent cancels the child; cancelling the child does not
    /// affect the parent.
    pub fn child_token(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
        }
    }

    /// Check cancellation and return an error if cancelled.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }

    /// Drive `fut` to completion unless the token is cancelled first.
    pub async fn run_until_cancelled<F: Future>(&self, fut: F) -> Result<F::Output, CancelledError> {
        tokio::select! {
            biased;
            _ = self.inner.cancelled() => Err(CancelledError),
            output = fut => Ok(output),
        }
    }
}

/// Error returned when an operation is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledError;

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation was cancelled")
    }
}

impl std::error::Error for CancelledError {}

impl From<CancelledError> for crate::error::NodeAgentError {
    fn from(_: CancelledError) -> Self {
        crate::error::NodeAgentError::Cancelled
    }
}
