//! Admission control: concurrency caps, token-bucket rate limiting and the
//! priority queue for requests that cannot start yet.
//!
//! - **[`TokenBucket`]**: capped, periodically refilled permit pool
//! - **[`AdmissionController`]**: global and per-endpoint in-flight limits,
//!   queue-or-reject policy, priority-ordered queue draining

mod controller;
mod token_bucket;

pub use controller::{Admission, AdmissionAttempt, AdmissionController, PendingAdmission};
pub use token_bucket::TokenBucket;
