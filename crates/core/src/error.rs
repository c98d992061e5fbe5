//! Error taxonomy of the call pipeline.
//!
//! Errors are classified once, where they arise: the transport produces a
//! [`TransportError`], pipeline stages produce the other [`PipelineError`]
//! variants. Nothing downstream reclassifies an error; retries and circuit
//! accounting read the classification they were given.

use std::fmt;
use std::time::Duration;

use callgate_common::error::{CommonError, ErrorClassification, ErrorSeverity};
use callgate_common::impl_error_classification;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::RequestDescriptor;

/// Coarse failure category reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// Connection could not be established or was lost.
    Network,
    /// The transport gave up waiting for a response.
    Timeout,
    /// The endpoint answered with an error status.
    Status,
    /// The request was refused before it was sent.
    Validation,
    /// The caller's cancellation token fired mid-flight.
    Cancelled,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Status => "status",
            Self::Validation => "validation",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Failure reported by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Server-provided hint (e.g. `Retry-After`) for the earliest retry.
    pub retry_after: Option<Duration>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self { kind, status: None, message: message.into(), retry_after: None }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    /// Error status response (4xx/5xx) from the endpoint.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self { status: Some(status), ..Self::new(TransportErrorKind::Status, message) }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Validation, message)
    }

    pub fn cancelled() -> Self {
        Self::new(TransportErrorKind::Cancelled, "request cancelled")
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Other, message)
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn is_server_error(&self) -> bool {
        self.status.is_some_and(|status| (500..=599).contains(&status))
    }

    /// Network or timeout failure without a status code.
    pub fn is_connectivity(&self) -> bool {
        matches!(self.kind, TransportErrorKind::Network | TransportErrorKind::Timeout)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} error (status {}): {}", self.kind, status, self.message),
            None => write!(f, "{} error: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for TransportError {}

impl ErrorClassification for TransportError {
    fn is_retryable(&self) -> bool {
        self.is_connectivity() || self.is_server_error() || self.status == Some(429)
    }

    fn severity(&self) -> ErrorSeverity {
        match self.kind {
            TransportErrorKind::Cancelled => ErrorSeverity::Info,
            TransportErrorKind::Network | TransportErrorKind::Timeout => ErrorSeverity::Warning,
            _ if self.status == Some(429) => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Why admission refused a request outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No slot or token available and queuing is disabled.
    NoCapacity,
    /// Queuing is enabled but the queue is at its depth limit.
    QueueFull,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCapacity => f.write_str("no capacity"),
            Self::QueueFull => f.write_str("queue full"),
        }
    }
}

/// Every way a call through the pipeline can fail.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("admission rejected for endpoint '{endpoint}': {reason}")]
    AdmissionRejected { endpoint: String, reason: RejectReason },

    #[error("circuit open for endpoint '{endpoint}'")]
    CircuitOpen { endpoint: String, retry_after: Option<Duration> },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },

    #[error("pipeline disposed")]
    Disposed,

    #[error("request withdrawn from the admission queue")]
    Withdrawn,

    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl PipelineError {
    pub fn hook(hook: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hook { hook: hook.into(), message: message.into() }
    }

    pub fn as_transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Short machine-readable name, used as a structured log field
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::AdmissionRejected { .. } => "admission_rejected",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Transport(_) => "transport",
            Self::Hook { .. } => "hook",
            Self::Disposed => "disposed",
            Self::Withdrawn => "withdrawn",
            Self::Cancelled => "cancelled",
            Self::Common(e) => e.kind_name(),
        }
    }
}

impl_error_classification!(PipelineError, Common,
    Self::AdmissionRejected { .. } => {
        retryable: false,
        severity: ErrorSeverity::Warning,
        critical: false,
    },
    Self::CircuitOpen { retry_after, .. } => {
        retryable: false,
        severity: ErrorSeverity::Warning,
        critical: false,
        retry_after: *retry_after,
    },
    Self::Transport(error) => {
        retryable: error.is_retryable(),
        severity: error.severity(),
        critical: false,
        retry_after: error.retry_after(),
    },
    Self::Hook { .. } => {
        retryable: false,
        severity: ErrorSeverity::Error,
        critical: false,
    },
    Self::Disposed | Self::Withdrawn | Self::Cancelled => {
        retryable: false,
        severity: ErrorSeverity::Info,
        critical: false,
    }
);

/// Terminal failure of a call: the classified error plus the descriptor of
/// the last attempt made.
pub struct CallFailure<P> {
    pub error: PipelineError,
    pub descriptor: RequestDescriptor<P>,
}

impl<P> CallFailure<P> {
    pub fn new(error: PipelineError, descriptor: RequestDescriptor<P>) -> Self {
        Self { error, descriptor }
    }

    pub fn error(&self) -> &PipelineError {
        &self.error
    }

    pub fn descriptor(&self) -> &RequestDescriptor<P> {
        &self.descriptor
    }

    /// Retries performed before giving up.
    pub fn attempt_count(&self) -> u32 {
        self.descriptor.attempt_count()
    }

    pub fn into_error(self) -> PipelineError {
        self.error
    }
}

impl<P> fmt::Debug for CallFailure<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallFailure")
            .field("error", &self.error)
            .field("request_id", &self.descriptor.id())
            .field("endpoint", &self.descriptor.endpoint())
            .field("attempt_count", &self.descriptor.attempt_count())
            .finish()
    }
}

impl<P> fmt::Display for CallFailure<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (endpoint '{}', attempt {})",
            self.error,
            self.descriptor.endpoint(),
            self.descriptor.attempt_count()
        )
    }
}

impl<P> std::error::Error for CallFailure<P> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl<P> ErrorClassification for CallFailure<P> {
    fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }

    fn severity(&self) -> ErrorSeverity {
        self.error.severity()
    }

    fn is_critical(&self) -> bool {
        self.error.is_critical()
    }

    fn retry_after(&self) -> Option<Duration> {
        self.error.retry_after()
    }
}
