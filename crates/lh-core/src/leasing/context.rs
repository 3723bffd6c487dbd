//! Cancellation and deadlines for suspending lease operations.
//!
//! Every call that may wait on the coordination store takes a [`Context`].
//! A context combines a [`CancellationToken`] with an optional deadline;
//! derived contexts are cancelled with their parent and never outlive its
//! deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::LeaseError;

/// Cancellation signal and optional deadline passed to blocking operations.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derives a context that is cancelled with `self` or on its own `cancel`.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derives a child context that expires `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a child context that expires at `deadline`, or at the parent's
    /// deadline if that comes first.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once `cancel` has been called on this context or an ancestor.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The instant after which operations fail with `DeadlineExceeded`.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the error an operation should report right now, if any.
    pub fn err(&self) -> Option<LeaseError> {
        if self.token.is_cancelled() {
            return Some(LeaseError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(LeaseError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn done(&self) -> LeaseError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => LeaseError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => LeaseError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                LeaseError::Cancelled
            }
        }
    }

    /// Runs `fut` until it completes or the context fires, whichever is first.
    ///
    /// A context that has already fired never polls `fut`.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, LeaseError>
    where
        F: Future<Output = Result<T, LeaseError>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            result = fut => result,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
