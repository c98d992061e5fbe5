use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use super::predicates;
use crate::circuit::{CircuitBreaker, CircuitState};
use crate::config::RetryConfig;
use crate::descriptor::RequestDescriptor;
use crate::error::{PipelineError, TransportError};

/// Decides whether a transport failure is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&TransportError) -> bool + Send + Sync>;

/// Why a failure is not retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The call was rejected by, or has since tripped, the circuit breaker.
    CircuitOpen,
    /// No predicate matched, or the error did not come from the transport.
    NotRetryable,
    /// `max_retries` attempts have already been made.
    Exhausted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen => f.write_str("circuit_open"),
            Self::NotRetryable => f.write_str("not_retryable"),
            Self::Exhausted => f.write_str("exhausted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Stop(StopReason),
}

/// Exponential backoff retry policy.
///
/// With a circuit breaker attached, a failure is not retried while the
/// endpoint's circuit is open; those stops do not consume attempts.
pub struct RetryOrchestrator {
    config: RetryConfig,
    predicates: Vec<RetryPredicate>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl RetryOrchestrator {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, predicates: Vec::new(), breaker: None }
    }

    /// Add a retry predicate. Once any predicate is added, the default
    /// (network, timeout and 5xx) no longer applies on its own.
    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Backoff before retry number `retry_number` (1-based), without jitter:
    /// `min(max_delay, base_delay * 2^(retry_number - 1))`.
    pub fn backoff_delay(&self, retry_number: u32) -> Duration {
        let exponent = retry_number.saturating_sub(1);
        let factor = 2_u32.checked_pow(exponent).unwrap_or(u32::MAX);

        self.config
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay)
    }

    /// Add up to 50% of `delay` when jitter is enabled.
    fn jittered(&self, delay: Duration) -> Duration {
        if !self.config.jitter || delay.is_zero() {
            return delay;
        }

        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let extra_ms = rand::thread_rng().gen_range(0..=delay_ms / 2);
        delay.saturating_add(Duration::from_millis(extra_ms))
    }

    /// Whether the configured predicates accept this transport failure.
    pub fn matches(&self, error: &TransportError) -> bool {
        if self.predicates.is_empty() {
            return predicates::transient(error);
        }
        self.predicates.iter().any(|predicate| predicate(error))
    }

    /// Decide what to do about a failed attempt.
    ///
    /// `attempt_count` is the number of retries already made for the
    /// request; the returned delay is for retry `attempt_count + 1`.
    pub fn decide(
        &self,
        error: &PipelineError,
        endpoint: &str,
        attempt_count: u32,
    ) -> RetryDecision {
        if error.is_circuit_open() {
            return RetryDecision::Stop(StopReason::CircuitOpen);
        }
        if let Some(breaker) = &self.breaker {
            if breaker.state(endpoint) == CircuitState::Open {
                return RetryDecision::Stop(StopReason::CircuitOpen);
            }
        }

        let Some(transport_error) = error.as_transport() else {
            return RetryDecision::Stop(StopReason::NotRetryable);
        };
        if !self.matches(transport_error) {
            return RetryDecision::Stop(StopReason::NotRetryable);
        }
        if attempt_count >= self.config.max_retries {
            return RetryDecision::Stop(StopReason::Exhausted);
        }

        let mut delay = self.jittered(self.backoff_delay(attempt_count.saturating_add(1)));
        if let Some(hint) = transport_error.retry_after {
            delay = delay.max(hint.min(self.config.max_delay));
        }

        RetryDecision::Retry { delay }
    }

    /// Handle a failed attempt: either give the error back, or wait out the
    /// backoff and return the descriptor for the next attempt.
    ///
    /// # Errors
    ///
    /// The original error when the failure is not retried, or `Cancelled`
    /// when the descriptor's token fires during the backoff.
    pub async fn handle_failure<P>(
        &self,
        error: PipelineError,
        descriptor: &RequestDescriptor<P>,
        endpoint: &str,
    ) -> Result<RequestDescriptor<P>, PipelineError> {
        let attempt_count = descriptor.attempt_count();

        let delay = match self.decide(&error, endpoint, attempt_count) {
            RetryDecision::Retry { delay } => delay,
            RetryDecision::Stop(reason) => {
                debug!(
                    request_id = %descriptor.id(),
                    endpoint,
                    attempt_count,
                    reason = %reason,
                    error_kind = error.kind_name(),
                    "Not retrying"
                );
                return Err(error);
            }
        };

        info!(
            request_id = %descriptor.id(),
            endpoint,
            attempt = attempt_count + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying after backoff"
        );

        match descriptor.cancellation() {
            Some(token) => {
                tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        debug!(request_id = %descriptor.id(), endpoint, "Backoff cancelled");
                        return Err(PipelineError::Cancelled);
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }

        Ok(descriptor.next_attempt())
    }
}

impl fmt::Debug for RetryOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOrchestrator")
            .field("config", &self.config)
            .field("predicates", &self.predicates.len())
            .field("circuit_breaker", &self.breaker.is_some())
            .finish()
    }
}
