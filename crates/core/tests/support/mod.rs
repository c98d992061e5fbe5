//! Shared test helpers for `callgate-core` integration tests.
//!
//! Scripted and gated transports so tests can control exactly when a call
//! completes and how it fails, without any real I/O.

#![allow(dead_code)]

pub mod transports;

use std::time::Duration;

use callgate_common::testing::poll_until;

/// Wait (bounded) until `condition` holds, yielding to other tasks between
/// checks.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    poll_until(Duration::from_secs(5), Duration::from_millis(1), || {
        let ready = condition();
        async move { ready }
    })
    .await
}
