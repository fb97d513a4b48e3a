use std::time::Duration;

use tracing::warn;

use super::assertions::Assertions;
use super::context::WaitContext;
use super::error::WaitError;
use super::eventually::{AttemptError, DEFAULT_POLL_INTERVAL, Eventually};

/// Message used when an assertion returns `false` without recording why.
pub const UNRECORDED_FAILURE: &str = "assertion returned false without recording a failure";

/// Outcome of one assertion evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AssertionFailure {
    Cancelled,
    Failed(String),
}

/// Run `check` and `condition` until the condition holds.
///
/// Every attempt evaluates `check` first. A check that returns `false` ends
/// the wait immediately with [`WaitError::CheckFailed`], even if the
/// condition would have held on the same attempt; `condition` is not
/// evaluated after a failed check. A condition that returns `false` is
/// retried after [`DEFAULT_POLL_INTERVAL`]. When the context is cancelled
/// before either assertion starts, neither runs and the wait ends with the
/// cancellation error carrying the last condition failure.
///
/// Both assertions receive a fresh [`Assertions`] sink per evaluation and
/// must record their failure reason there.
pub async fn run_check_until<C, U>(
    ctx: &WaitContext,
    check: C,
    condition: U,
) -> Result<(), WaitError>
where
    C: AsyncFnMut(&WaitContext, &Assertions) -> bool,
    U: AsyncFnMut(&WaitContext, &Assertions) -> bool,
{
    run_check_until_every(ctx, DEFAULT_POLL_INTERVAL, check, condition).await
}

/// [`run_check_until`] with an explicit poll interval.
pub async fn run_check_until_every<C, U>(
    ctx: &WaitContext,
    poll_interval: Duration,
    mut check: C,
    mut condition: U,
) -> Result<(), WaitError>
where
    C: AsyncFnMut(&WaitContext, &Assertions) -> bool,
    U: AsyncFnMut(&WaitContext, &Assertions) -> bool,
{
    let result = Eventually::new(ctx)
        .poll_interval(poll_interval)
        .describe("check until condition")
        .until(async |ctx: &WaitContext| attempt_once(ctx, &mut check, &mut condition).await)
        .await;

    match result {
        Err(WaitError::StoppedTrying { attempts, message }) => {
            warn!(attempts, %message, "check failed before condition succeeded");
            Err(WaitError::CheckFailed { attempts, message })
        }
        other => other,
    }
}

/// [`run_check_until`] for test bodies: returns `true` on success and fails
/// the calling test otherwise.
///
/// # Panics
///
/// Panics with the synthesized failure message when the check fails or the
/// context ends before the condition holds.
pub async fn assert_check_until<C, U>(ctx: &WaitContext, check: C, condition: U) -> bool
where
    C: AsyncFnMut(&WaitContext, &Assertions) -> bool,
    U: AsyncFnMut(&WaitContext, &Assertions) -> bool,
{
    match run_check_until(ctx, check, condition).await {
        Ok(()) => true,
        Err(err) => panic!(
            "check failed or condition did not succeed before the context was cancelled: {err}"
        ),
    }
}

async fn attempt_once<C, U>(
    ctx: &WaitContext,
    check: &mut C,
    condition: &mut U,
) -> Result<(), AttemptError>
where
    C: AsyncFnMut(&WaitContext, &Assertions) -> bool,
    U: AsyncFnMut(&WaitContext, &Assertions) -> bool,
{
    run_assertion(ctx, check)
        .await
        .map_err(|failure| match failure {
            AssertionFailure::Cancelled => AttemptError::Cancelled,
            AssertionFailure::Failed(message) => AttemptError::StopTrying(message),
        })?;

    run_assertion(ctx, condition)
        .await
        .map_err(|failure| match failure {
            AssertionFailure::Cancelled => AttemptError::Cancelled,
            AssertionFailure::Failed(message) => AttemptError::Retry(message),
        })
}

async fn run_assertion<A>(ctx: &WaitContext, assertion: &mut A) -> Result<(), AssertionFailure>
where
    A: AsyncFnMut(&WaitContext, &Assertions) -> bool,
{
    if ctx.is_cancelled() {
        return Err(AssertionFailure::Cancelled);
    }

    let sink = Assertions::new();
    if assertion(ctx, &sink).await {
        return Ok(());
    }

    Err(AssertionFailure::Failed(
        sink.into_message()
            .unwrap_or_else(|| UNRECORDED_FAILURE.to_string()),
    ))
}
