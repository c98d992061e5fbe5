//! Testing utilities and helpers
//!
//! - **[`async_utils`]**: bounded polling on paused or real time
//! - [`init_test_tracing`]: route `tracing` output through the test harness
//!
//! ```rust,ignore
//! use callgate_common::testing::init_test_tracing;
//!
//! #[tokio::test]
//! async fn admits_in_priority_order() {
//!     init_test_tracing();
//!     // ...
//! }
//! ```

pub mod async_utils;

use tracing_subscriber::EnvFilter;

pub use async_utils::poll_until;

/// Install a test-writer `tracing` subscriber once per process
///
/// Honours `RUST_LOG`; defaults to `debug` for workspace crates. Repeated
/// calls are no-ops, so every test may call it.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("callgate_core=debug,callgate_common=debug"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}
