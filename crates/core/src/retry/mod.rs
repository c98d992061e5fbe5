//! Retry decisions with exponential backoff and jitter.
//!
//! The [`RetryOrchestrator`] never re-invokes anything itself: it decides,
//! waits out the backoff, and hands back the next attempt's descriptor. The
//! hook chain then re-runs the whole pipeline for that attempt, so every
//! retry goes through admission and the circuit check again.

mod orchestrator;
pub mod predicates;

pub use orchestrator::{RetryDecision, RetryOrchestrator, RetryPredicate, StopReason};
