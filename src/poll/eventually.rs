use std::time::Duration;

use tracing::debug;

use super::context::{Cancellation, WaitContext};
use super::error::WaitError;

/// Poll interval used when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Why a single attempt did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// Not ready yet; try again after the poll interval.
    Retry(String),
    /// Something is broken; do not try again.
    StopTrying(String),
    /// The attempt observed a cancelled context. Ends the wait without
    /// replacing the last retry message.
    Cancelled,
}

impl AttemptError {
    pub fn retry(message: impl Into<String>) -> Self {
        Self::Retry(message.into())
    }

    pub fn stop(message: impl Into<String>) -> Self {
        Self::StopTrying(message.into())
    }
}

/// Fixed-interval re-invocation of an attempt until it succeeds, asks to
/// stop, or the context ends.
///
/// ```no_run
/// # use std::time::Duration;
/// # use machine_e2e::poll::{AttemptError, Eventually, WaitContext};
/// # async fn example() -> Result<(), machine_e2e::poll::WaitError> {
/// let ctx = WaitContext::with_timeout(Duration::from_secs(60));
/// let mut seen = 0;
/// Eventually::new(&ctx)
///     .poll_interval(Duration::from_secs(1))
///     .until(async |_| {
///         seen += 1;
///         if seen < 3 { Err(AttemptError::retry("not yet")) } else { Ok(()) }
///     })
///     .await
/// # }
/// ```
#[derive(Debug)]
pub struct Eventually<'a> {
    ctx: &'a WaitContext,
    poll_interval: Duration,
    timeout: Option<Duration>,
    description: Option<String>,
}

impl<'a> Eventually<'a> {
    pub fn new(ctx: &'a WaitContext) -> Self {
        Self {
            ctx,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
            description: None,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bound the wait by `timeout` in addition to the context's own deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Label used in log output.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Run `attempt` until it returns `Ok`.
    ///
    /// The first attempt starts immediately. The context is checked before
    /// every attempt, so a dead context never invokes `attempt`.
    pub async fn until<T, F>(self, mut attempt: F) -> Result<T, WaitError>
    where
        F: AsyncFnMut(&WaitContext) -> Result<T, AttemptError>,
    {
        let ctx = match self.timeout {
            Some(timeout) => self.ctx.child_with_timeout(timeout),
            None => self.ctx.clone(),
        };
        let description = self.description.as_deref().unwrap_or("condition");

        let mut attempts = 0u32;
        let mut last: Option<String> = None;

        loop {
            if let Some(cancellation) = ctx.err() {
                debug!(description, attempts, %cancellation, "giving up");
                return Err(WaitError::from_cancellation(cancellation, attempts, last));
            }

            attempts += 1;
            match attempt(&ctx).await {
                Ok(value) => {
                    debug!(description, attempts, "succeeded");
                    return Ok(value);
                }
                Err(AttemptError::StopTrying(message)) => {
                    debug!(description, attempts, %message, "stopped trying");
                    return Err(WaitError::StoppedTrying { attempts, message });
                }
                Err(AttemptError::Cancelled) => {
                    let cancellation = ctx.err().unwrap_or(Cancellation::Cancelled);
                    return Err(WaitError::from_cancellation(cancellation, attempts, last));
                }
                Err(AttemptError::Retry(message)) => {
                    debug!(
                        description,
                        attempts,
                        remaining = ?ctx.remaining(),
                        %message,
                        "not yet, retrying"
                    );
                    last = Some(message);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                cancellation = ctx.done() => {
                    return Err(WaitError::from_cancellation(cancellation, attempts, last));
                }
            }
        }
    }
}
