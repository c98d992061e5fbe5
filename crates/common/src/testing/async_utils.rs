//! Async testing utilities
//!
//! Every wait here is measured with `tokio::time`, so helpers behave the
//! same under `#[tokio::test(start_paused = true)]`.

use std::future::Future;
use std::time::Duration;

/// Poll an async condition until it returns true or times out
pub async fn poll_until<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();

    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }

    false
}
