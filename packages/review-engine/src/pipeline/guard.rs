//! Time-boxed, cancellable collaborator calls.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ReviewError};

/// Run `call` under a timeout, abandoning it if `cancel` fires.
///
/// The select is biased towards cancellation, so once the token is
/// cancelled `call` is never polled for the first time: no new request is
/// started after a job is cancelled. A call already in flight is dropped.
pub async fn guarded<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    operation: &str,
    call: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ReviewError::Cancelled),
        outcome = tokio::time::timeout(timeout, call) => match outcome {
            Ok(result) => result,
            Err(_) => Err(ReviewError::Timeout {
                operation: operation.to_string(),
                millis: timeout.as_millis() as u64,
            }),
        },
    }
}
