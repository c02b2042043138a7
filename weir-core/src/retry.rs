//! Retry helper for transient dependency failures.
//!
//! Per-event work is retried a few times in place; a still-failing
//! retriable error then propagates to the outer batch loop, which redelivers
//! the whole batch (at-least-once). Non-retriable errors are never retried
//! here.

use std::time::Duration;

use tracing::warn;

/// Errors that know whether retrying can help
pub trait Retriable {
    fn is_retriable(&self) -> bool;
}

/// Number of in-place attempts before giving up
const DEFAULT_ATTEMPTS: u32 = 3;

/// Base delay between attempts; doubles per attempt
const BASE_DELAY: Duration = Duration::from_millis(200);

/// Run `op`, retrying up to two more times when it fails with a retriable
/// error. Non-retriable errors and exhausted retries return the last error.
pub async fn retry_if_retriable<T, E, F, Fut>(mut op: F) -> Result<T, E>
where
    E: Retriable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                if !error.is_retriable() || attempt >= DEFAULT_ATTEMPTS {
                    return Err(error);
                }
                warn!(%error, attempt, "Retriable error, retrying");
                tokio::time::sleep(BASE_DELAY * 2u32.pow(attempt - 1)).await;
            }
        }
    }
}
