use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use callgate_common::time::{Clock, SystemClock};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CircuitBreakerConfig;
use crate::error::{PipelineError, TransportError};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally
    #[default]
    Closed,
    /// Calls fail fast until the reset timeout elapses
    Open,
    /// One trial call decides between Closed and Open
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Callback invoked on every state transition with `(endpoint, from, to)`.
pub type StateListener = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Callback invoked with the endpoint key after every recorded success.
pub type SuccessListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback invoked after every counted failure.
pub type FailureListener = Arc<dyn Fn(&str, &PipelineError) + Send + Sync>;

/// Snapshot of one endpoint's circuit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    /// Consecutive monitored failures since the last success.
    pub failure_count: u32,
    /// Milliseconds since the UNIX epoch of the last monitored failure.
    pub last_failure_time: Option<u64>,
    pub success_count: u64,
    pub total_requests: u64,
}

#[derive(Debug, Default)]
struct CircuitRecord {
    state: CircuitState,
    consecutive_failures: u32,
    reopen_at: Option<Instant>,
    /// Call id of the half-open trial in flight.
    trial: Option<Uuid>,
    success_count: u64,
    total_requests: u64,
    last_failure_at: Option<u64>,
}

impl CircuitRecord {
    fn is_trial(&self, call: Uuid) -> bool {
        self.state == CircuitState::HalfOpen && self.trial == Some(call)
    }
}

/// Per-endpoint failure state machine.
///
/// Only monitored failures count: transport errors whose status is in the
/// configured set, plus status-less network and timeout failures. Pipeline
/// rejections (`CircuitOpen`, `AdmissionRejected`, ...) never count.
///
/// Every call is identified by the id passed to [`before_call`]. While the
/// circuit is half-open only the trial call's outcome moves the state;
/// results of calls admitted earlier are ignored.
///
/// [`before_call`]: CircuitBreaker::before_call
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    circuits: DashMap<String, CircuitRecord>,
    listener: Option<StateListener>,
    success_listener: Option<SuccessListener>,
    failure_listener: Option<FailureListener>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            circuits: DashMap::new(),
            listener: None,
            success_listener: None,
            failure_listener: None,
        }
    }

    pub fn with_listener(mut self, listener: StateListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_success_listener(mut self, listener: SuccessListener) -> Self {
        self.success_listener = Some(listener);
        self
    }

    pub fn with_failure_listener(mut self, listener: FailureListener) -> Self {
        self.failure_listener = Some(listener);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Gate call `call` to `endpoint`.
    ///
    /// The first call after the reset timeout becomes the half-open trial.
    ///
    /// # Errors
    ///
    /// `CircuitOpen` while the circuit is open (with the time left until the
    /// reset timeout) or while a half-open trial is already in flight.
    pub fn before_call(&self, endpoint: &str, call: Uuid) -> Result<(), PipelineError> {
        let now = self.clock.now();
        let mut transition = None;

        let outcome = {
            let mut record = self.circuits.entry(endpoint.to_string()).or_default();
            record.total_requests += 1;

            let state = record.state;
            match state {
                CircuitState::Closed => Ok(()),
                CircuitState::Open => {
                    let reopen_at = record.reopen_at.unwrap_or(now);
                    if now >= reopen_at {
                        record.state = CircuitState::HalfOpen;
                        record.trial = Some(call);
                        transition = Some((CircuitState::Open, CircuitState::HalfOpen));
                        Ok(())
                    } else {
                        Err(PipelineError::CircuitOpen {
                            endpoint: endpoint.to_string(),
                            retry_after: Some(reopen_at - now),
                        })
                    }
                }
                CircuitState::HalfOpen if record.trial.is_some() => {
                    Err(PipelineError::CircuitOpen {
                        endpoint: endpoint.to_string(),
                        retry_after: None,
                    })
                }
                CircuitState::HalfOpen => {
                    record.trial = Some(call);
                    Ok(())
                }
            }
        };

        if let Some((from, to)) = transition {
            self.notify(endpoint, from, to);
        }
        if outcome.is_err() {
            debug!(endpoint, "Call rejected by open circuit");
        }
        outcome
    }

    /// Record a successful call.
    pub fn on_success(&self, endpoint: &str, call: Uuid) {
        let transition = {
            let mut record = self.circuits.entry(endpoint.to_string()).or_default();
            record.success_count += 1;

            let state = record.state;
            match state {
                CircuitState::Closed => {
                    record.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen if record.is_trial(call) => {
                    record.state = CircuitState::Closed;
                    record.consecutive_failures = 0;
                    record.trial = None;
                    record.reopen_at = None;
                    Some((CircuitState::HalfOpen, CircuitState::Closed))
                }
                // Late success from a call admitted before the circuit opened.
                CircuitState::HalfOpen | CircuitState::Open => None,
            }
        };

        if let Some((from, to)) = transition {
            info!(endpoint, "Circuit closed after successful trial");
            self.notify(endpoint, from, to);
        }
        if let Some(listener) = &self.success_listener {
            listener(endpoint);
        }
    }

    /// Record a failed call. Returns `true` if the failure was counted.
    ///
    /// An uncounted failure of the half-open trial frees the trial slot
    /// without changing state, so the next call becomes the trial. Failures
    /// of other calls while half-open are not counted.
    pub fn on_failure(&self, endpoint: &str, call: Uuid, error: &PipelineError) -> bool {
        if !self.is_monitored(error) {
            self.release_trial(endpoint, call);
            return false;
        }

        let now = self.clock.now();
        let failed_at = self.clock.millis_since_epoch();
        let transition = {
            let mut record = self.circuits.entry(endpoint.to_string()).or_default();
            if record.state == CircuitState::HalfOpen && !record.is_trial(call) {
                return false;
            }
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            record.last_failure_at = Some(failed_at);

            let state = record.state;
            match state {
                CircuitState::Closed
                    if record.consecutive_failures >= self.config.failure_threshold =>
                {
                    record.state = CircuitState::Open;
                    record.reopen_at = Some(now + self.config.reset_timeout);
                    Some((CircuitState::Closed, CircuitState::Open, record.consecutive_failures))
                }
                CircuitState::HalfOpen => {
                    record.state = CircuitState::Open;
                    record.trial = None;
                    record.reopen_at = Some(now + self.config.reset_timeout);
                    Some((CircuitState::HalfOpen, CircuitState::Open, record.consecutive_failures))
                }
                _ => None,
            }
        };

        if let Some((from, to, failures)) = transition {
            warn!(
                endpoint,
                failures,
                reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                "Circuit opened"
            );
            self.notify(endpoint, from, to);
        }
        if let Some(listener) = &self.failure_listener {
            listener(endpoint, error);
        }
        true
    }

    /// Free the half-open trial slot held by `call` when that call never
    /// produced an outcome. Any other call is a no-op.
    pub fn release_trial(&self, endpoint: &str, call: Uuid) {
        if let Some(mut record) = self.circuits.get_mut(endpoint) {
            if record.is_trial(call) {
                record.trial = None;
            }
        }
    }

    /// Current state for an endpoint (`Closed` if never seen).
    ///
    /// An open circuit whose reset timeout has elapsed still reports `Open`
    /// until the next `before_call` moves it to `HalfOpen`.
    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.circuits.get(endpoint).map(|record| record.state).unwrap_or_default()
    }

    /// Counters and state for an endpoint (all zero if never seen).
    pub fn get_stats(&self, endpoint: &str) -> CircuitStats {
        self.circuits
            .get(endpoint)
            .map(|record| CircuitStats {
                state: record.state,
                failure_count: record.consecutive_failures,
                last_failure_time: record.last_failure_at,
                success_count: record.success_count,
                total_requests: record.total_requests,
            })
            .unwrap_or_default()
    }

    /// Force an endpoint's circuit back to a fresh closed state.
    pub fn reset(&self, endpoint: &str) {
        let previous = self.circuits.remove(endpoint).map(|(_, record)| record.state);
        if let Some(from) = previous.filter(|state| *state != CircuitState::Closed) {
            info!(endpoint, "Circuit manually reset");
            self.notify(endpoint, from, CircuitState::Closed);
        }
    }

    fn is_monitored(&self, error: &PipelineError) -> bool {
        error.as_transport().is_some_and(|transport| self.is_monitored_transport(transport))
    }

    fn is_monitored_transport(&self, error: &TransportError) -> bool {
        match error.status {
            Some(status) => self.config.monitored_status_codes.contains(&status),
            None => error.is_connectivity(),
        }
    }

    fn notify(&self, endpoint: &str, from: CircuitState, to: CircuitState) {
        debug!(endpoint, from = %from, to = %to, "Circuit state transition");
        if let Some(listener) = &self.listener {
            listener(endpoint, from, to);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("endpoints", &self.circuits.len())
            .field("listener", &self.listener.is_some())
            .field("success_listener", &self.success_listener.is_some())
            .field("failure_listener", &self.failure_listener.is_some())
            .finish()
    }
}
