//! Retry utilities: backoff builder and retryable error classification.
//!
//! The registry never retries on its own. Callers that want to ride out a
//! transient outage wrap their calls with [`with_storage_retry`].

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::warn;

use crate::storage::{Result, StorageError};

/// Standard backoff for storage calls.
///
/// - Min delay: 50ms
/// - Max delay: 5s
/// - Max attempts: 8
/// - Jitter enabled
pub fn storage_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(8)
        .with_jitter()
}

/// Determines if a storage error is worth retrying.
///
/// Retryable:
/// - `StorageUnavailable`: transient failure of a single request
/// - `ConnectionFailure`: server not reachable (yet)
///
/// Everything else (missing board, bad input, index setup) fails the same
/// way on every attempt.
pub fn is_retryable_error(err: &StorageError) -> bool {
    err.is_retryable()
}

/// Run `operation`, retrying retryable storage errors with
/// [`storage_backoff`].
pub async fn with_storage_retry<T, F, Fut>(operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    operation
        .retry(storage_backoff())
        .when(is_retryable_error)
        .notify(|err: &StorageError, delay: Duration| {
            warn!(error = %err, ?delay, "Storage call failed, retrying");
        })
        .await
}
