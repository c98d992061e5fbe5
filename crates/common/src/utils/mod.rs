//! Common utility functions
//!
//! - **[`serde`]**: Serialization helpers for durations in config structs

pub mod serde;

pub use self::serde::duration_millis;
