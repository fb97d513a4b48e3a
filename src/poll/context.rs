use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a [`WaitContext`] stopped accepting new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    /// The context (or one of its parents) was cancelled explicitly.
    Cancelled,
    /// The context deadline elapsed.
    DeadlineExceeded,
}

impl std::fmt::Display for Cancellation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "context cancelled"),
            Self::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

/// Cancellation scope for a wait against the cluster.
///
/// A context carries a cancellation token and an optional deadline. Child
/// contexts are cancelled with their parent and never outlive the parent's
/// deadline. Cloning shares the same token.
#[derive(Debug, Clone, Default)]
pub struct WaitContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl WaitContext {
    /// A root context with no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A root context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().child_with_timeout(timeout)
    }

    /// A child that is cancelled together with `self`.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child whose deadline is the earlier of `now + timeout` and the
    /// parent's deadline.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(match self.deadline {
                Some(parent) if parent < deadline => parent,
                _ => deadline,
            }),
        }
    }

    /// Cancel this context and every child derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// `Some` once the context was cancelled or its deadline passed.
    ///
    /// Explicit cancellation is reported in preference to the deadline.
    pub fn err(&self) -> Option<Cancellation> {
        if self.token.is_cancelled() {
            Some(Cancellation::Cancelled)
        } else if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            Some(Cancellation::DeadlineExceeded)
        } else {
            None
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves when the context is cancelled or the deadline passes.
    pub async fn done(&self) -> Cancellation {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => Cancellation::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Cancellation::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                Cancellation::Cancelled
            }
        }
    }
}
