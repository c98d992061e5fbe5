//! Per-endpoint circuit breaking.
//!
//! Each endpoint key has an independent CLOSED/OPEN/HALF_OPEN state machine.
//! An open circuit fails calls fast with `CircuitOpen`; after the reset
//! timeout a single trial call decides whether it closes again.

mod breaker;

pub use breaker::{
    CircuitBreaker, CircuitState, CircuitStats, FailureListener, StateListener, SuccessListener,
};
