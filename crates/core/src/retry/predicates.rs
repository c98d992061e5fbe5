//! Ready-made retry predicates.
//!
//! A transport failure is retried when any configured predicate matches.

use std::sync::Arc;

use super::RetryPredicate;
use crate::error::TransportError;

/// Network and timeout failures, and 5xx responses.
pub fn transient(error: &TransportError) -> bool {
    error.is_connectivity() || error.is_server_error()
}

/// Retry only the given status codes.
pub fn status_codes(codes: impl IntoIterator<Item = u16>) -> RetryPredicate {
    let codes: Vec<u16> = codes.into_iter().collect();
    Arc::new(move |error: &TransportError| error.status.is_some_and(|s| codes.contains(&s)))
}

/// Retry only connectivity failures (no status code).
pub fn connectivity() -> RetryPredicate {
    Arc::new(TransportError::is_connectivity)
}

/// Never retry.
pub fn never() -> RetryPredicate {
    Arc::new(|_: &TransportError| false)
}
