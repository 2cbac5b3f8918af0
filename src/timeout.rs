//! Deadline combinator for long-running async work.
//!
//! Every external process invocation in the engine is raced against a
//! deadline through [`guard`]. The elapsed case is reported as its own type so
//! callers can map it onto a timeout error that stays distinguishable from the
//! operation's own failures.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// The deadline passed before the guarded future completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deadline of {}s elapsed", after.as_secs())]
pub struct DeadlineElapsed {
    pub after: Duration,
}

/// Race `fut` against `after`. The future is dropped when the deadline wins,
/// which kills any child process spawned with `kill_on_drop`.
pub async fn guard<F>(after: Duration, fut: F) -> Result<F::Output, DeadlineElapsed>
where
    F: Future,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| DeadlineElapsed { after })
}

/// Like [`guard`] for fallible futures: the elapsed case is converted into
/// the future's own error type with `on_elapsed`.
pub async fn guard_result<F, T, E>(
    after: Duration,
    fut: F,
    on_elapsed: impl FnOnce(Duration) -> E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match guard(after, fut).await {
        Ok(result) => result,
        Err(elapsed) => Err(on_elapsed(elapsed.after)),
    }
}
