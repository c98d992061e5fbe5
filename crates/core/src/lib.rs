//! # Callgate Core
//!
//! Resilience pipeline for outbound calls.
//!
//! This crate contains:
//! - Admission control: global and per-endpoint concurrency limits, a token
//!   bucket, and a priority queue for requests that do not fit yet
//! - Per-endpoint circuit breaking
//! - Retries with exponential backoff and jitter
//! - An ordered hook chain that composes those stages around a transport
//!
//! ## Architecture Principles
//! - Only depends on `callgate-common` for shared error and clock types
//! - No HTTP or other I/O: the transport is a trait supplied by the caller
//! - Every stage is a hook, so custom behaviour composes the same way
//!
//! ## Example
//!
//! ```no_run
//! use callgate_core::{transport_fn, Pipeline, PipelineConfig, RequestDescriptor, TransportError};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config: PipelineConfig = serde_json::from_str(
//!     r#"{ "global_concurrency": 4, "queue_enabled": true, "retry": { "max_retries": 2 } }"#,
//! )?;
//! let pipeline = Pipeline::<String, String>::new(config)?;
//!
//! let transport = transport_fn(|request: RequestDescriptor<String>| async move {
//!     Ok::<_, TransportError>(format!("echo {}", request.payload()))
//! });
//!
//! let response = pipeline
//!     .execute(RequestDescriptor::new("/echo", "hello".to_string()), &transport)
//!     .await?;
//! assert_eq!(response, "echo hello");
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod circuit;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod hooks;
pub mod pipeline;
pub mod retry;
pub mod transport;

pub use admission::{
    Admission, AdmissionAttempt, AdmissionController, PendingAdmission, TokenBucket,
};
pub use circuit::{
    CircuitBreaker, CircuitState, CircuitStats, FailureListener, StateListener, SuccessListener,
};
pub use config::{CircuitBreakerConfig, PipelineConfig, RetryConfig, TokenBucketConfig};
pub use descriptor::{KeyFn, PriorityFn, RequestClassifier, RequestDescriptor, DEFAULT_ENDPOINT_KEY};
pub use error::{CallFailure, PipelineError, RejectReason, TransportError, TransportErrorKind};
pub use hooks::{ErrorOutcome, Hook, HookChain, PreCall};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineStats};
pub use retry::{RetryDecision, RetryOrchestrator, RetryPredicate, StopReason};
pub use transport::{transport_fn, FnTransport, Transport};
