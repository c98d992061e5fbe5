//! Common error types and classification for Callgate crates
//!
//! The error handling system is built on three pieces:
//!
//! 1. **`CommonError`**: error patterns shared by several modules
//!    (invalid configuration and internal invariant violations).
//!
//! 2. **`ErrorClassification` trait**: a standard interface for classifying
//!    errors by retryability, severity and criticality.
//!
//! 3. **`ErrorSeverity` enum**: a unified severity scale used when logging.
//!
//! Module-specific errors **compose** with `CommonError` instead of
//! duplicating its variants:
//!
//! ```rust,ignore
//! #[derive(Debug, thiserror::Error)]
//! pub enum AdmissionError {
//!     #[error("queue full")]
//!     QueueFull,
//!
//!     #[error(transparent)]
//!     Common(#[from] CommonError),
//! }
//!
//! impl_error_classification!(AdmissionError, Common,
//!     Self::QueueFull => {
//!         retryable: false,
//!         severity: ErrorSeverity::Warning,
//!         critical: false,
//!     }
//! );
//! ```
//!
//! ## ErrorSeverity Levels
//!
//! | Level | Use Case |
//! |-------|----------|
//! | **Info** | Expected conditions (cancellation, withdrawal) |
//! | **Warning** | Degraded but operational (throttling, open circuits) |
//! | **Error** | Failure requiring attention (bad config, server errors) |
//! | **Critical** | Internal invariant violated |

use std::fmt;
use std::time::Duration;

/// Standard result type using CommonError
pub type CommonResult<T> = Result<T, CommonError>;

/// Common error variants that appear across multiple modules
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommonError {
    /// A configuration value failed validation
    #[error("Configuration error in field '{field}': {message}")]
    Config { field: String, message: String },

    /// Internal errors that shouldn't normally occur
    #[error("Internal error in '{context}': {message}")]
    Internal { context: String, message: String },
}

impl ErrorClassification for CommonError {
    fn is_retryable(&self) -> bool {
        false
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Config { .. } => ErrorSeverity::Error,
            Self::Internal { .. } => ErrorSeverity::Critical,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl CommonError {
    /// Create a configuration error for a specific field
    pub fn config_field<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        Self::Config { field: field.into(), message: message.into() }
    }

    /// Create an internal error with context
    pub fn internal_with_context<S: Into<String>, C: Into<String>>(message: S, context: C) -> Self {
        Self::Internal { context: context.into(), message: message.into() }
    }

    /// Short machine-readable name, used as a structured log field
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Error classification trait for consistent error handling across modules
///
/// Retry predicates, log levels and fail-fast decisions all read errors
/// through this interface, so every error type in the workspace implements
/// it.
pub trait ErrorClassification {
    /// Check if this error is retryable
    ///
    /// Retryable errors are transient issues that may succeed if attempted
    /// again: network failures, timeouts, server-side 5xx responses.
    fn is_retryable(&self) -> bool;

    /// Get the error severity level
    fn severity(&self) -> ErrorSeverity;

    /// Check if this is a critical error requiring immediate attention
    fn is_critical(&self) -> bool;

    /// Get the suggested retry delay if applicable
    ///
    /// Returns `Some(Duration)` when a specific delay is recommended (e.g.
    /// from a `Retry-After` header or an open circuit's reopen time).
    fn retry_after(&self) -> Option<Duration>;
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention and action
    Error,
    /// Critical, immediate action required
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Macro to implement ErrorClassification by delegating to CommonError
///
/// Module errors that embed `CommonError` list their own variants with a
/// fixed classification; the embedded variant delegates.
///
/// # Usage
///
/// ```rust,ignore
/// impl_error_classification!(MyError, Common,
///     Self::Specific(_) => {
///         retryable: false,
///         severity: ErrorSeverity::Error,
///         critical: false,
///     },
///     Self::Throttled { retry_after } => {
///         retryable: true,
///         severity: ErrorSeverity::Warning,
///         critical: false,
///         retry_after: *retry_after,
///     }
/// );
/// ```
#[macro_export]
macro_rules! impl_error_classification {
    (
        $error_type:ty,
        $common_variant:ident
        $(,
            $variant:pat => {
                retryable: $retryable:expr,
                severity: $severity:expr,
                critical: $critical:expr
                $(, retry_after: $retry_after:expr)?
                $(,)?
            }
        )*
        $(,)?
    ) => {
        impl $crate::error::ErrorClassification for $error_type {
            fn is_retryable(&self) -> bool {
                match self {
                    Self::$common_variant(e) => $crate::error::ErrorClassification::is_retryable(e),
                    $(
                        #[allow(unused_variables)]
                        $variant => $retryable,
                    )*
                }
            }

            fn severity(&self) -> $crate::error::ErrorSeverity {
                match self {
                    Self::$common_variant(e) => $crate::error::ErrorClassification::severity(e),
                    $(
                        #[allow(unused_variables)]
                        $variant => $severity,
                    )*
                }
            }

            fn is_critical(&self) -> bool {
                match self {
                    Self::$common_variant(e) => $crate::error::ErrorClassification::is_critical(e),
                    $(
                        #[allow(unused_variables)]
                        $variant => $critical,
                    )*
                }
            }

            fn retry_after(&self) -> Option<std::time::Duration> {
                match self {
                    Self::$common_variant(e) => $crate::error::ErrorClassification::retry_after(e),
                    $(
                        $(
                            $variant => $retry_after,
                        )?
                    )*
                    #[allow(unreachable_patterns)]
                    _ => None,
                }
            }
        }
    };
}
