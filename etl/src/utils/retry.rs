use crate::utils::time::sleep_with_jitter;
use std::future::Future;
use tracing::debug;

/// Runs `operation` until it succeeds, fails with a non-transient error, or
/// `retries` extra attempts have been spent. The delay doubles after every attempt.
pub async fn retry_with_backoff<T, F, Fut>(
    mut retries: u32,
    base_delay_ms: u64,
    operation: F,
) -> common::Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = common::Result<T>>,
{
    let mut delay = base_delay_ms;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if retries == 0 || !e.is_transient() {
                    return Err(e);
                }

                debug!(error = %e, retries_left = retries, delay_ms = delay, "Retrying after transient error");
                retries -= 1;
                sleep_with_jitter(delay, delay / 2).await;
                delay = delay.saturating_mul(2);
            }
        }
    }
}
