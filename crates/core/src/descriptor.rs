//! Request descriptors and the rules that classify them.
//!
//! A [`RequestDescriptor`] is the immutable record of one logical call. Each
//! retry produces a fresh copy through [`RequestDescriptor::next_attempt`];
//! nothing mutates a descriptor in place once it has entered the pipeline.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Endpoint key used when a request's key cannot be resolved.
pub const DEFAULT_ENDPOINT_KEY: &str = "__default__";

/// Immutable description of an outbound call attempt.
pub struct RequestDescriptor<P> {
    id: Uuid,
    endpoint: String,
    attempt_count: u32,
    priority: i64,
    payload: Arc<P>,
    cancellation: Option<CancellationToken>,
}

impl<P> RequestDescriptor<P> {
    /// Create the descriptor of an original attempt (`attempt_count == 0`).
    pub fn new(endpoint: impl Into<String>, payload: P) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint: endpoint.into(),
            attempt_count: 0,
            priority: 0,
            payload: Arc::new(payload),
            cancellation: None,
        }
    }

    /// Set the queue priority (higher is served first).
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a cancellation token, observed while queued and while backing
    /// off between retries.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Correlation id shared by every attempt of the same logical call.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Request target (typically the URL) used as the default endpoint key.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Number of retries already performed; `0` for the original attempt.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn shared_payload(&self) -> Arc<P> {
        Arc::clone(&self.payload)
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Copy of this descriptor for the next retry.
    pub fn next_attempt(&self) -> Self {
        Self { attempt_count: self.attempt_count.saturating_add(1), ..self.clone() }
    }
}

impl<P> Clone for RequestDescriptor<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            endpoint: self.endpoint.clone(),
            attempt_count: self.attempt_count,
            priority: self.priority,
            payload: Arc::clone(&self.payload),
            cancellation: self.cancellation.clone(),
        }
    }
}

impl<P> fmt::Debug for RequestDescriptor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("attempt_count", &self.attempt_count)
            .field("priority", &self.priority)
            .field("cancellable", &self.cancellation.is_some())
            .finish_non_exhaustive()
    }
}

/// Resolves an endpoint key from a descriptor; `None` or an empty string
/// falls back to [`DEFAULT_ENDPOINT_KEY`].
pub type KeyFn<P> = Arc<dyn Fn(&RequestDescriptor<P>) -> Option<String> + Send + Sync>;

/// Computes a queue priority from a descriptor.
pub type PriorityFn<P> = Arc<dyn Fn(&RequestDescriptor<P>) -> i64 + Send + Sync>;

/// Endpoint-key and priority rules shared by the admission and circuit
/// stages, so both see the same key for a request.
pub struct RequestClassifier<P> {
    key_fn: Option<KeyFn<P>>,
    priority_fn: Option<PriorityFn<P>>,
}

impl<P> RequestClassifier<P> {
    pub fn new() -> Self {
        Self { key_fn: None, priority_fn: None }
    }

    pub fn with_key_fn(mut self, key_fn: KeyFn<P>) -> Self {
        self.key_fn = Some(key_fn);
        self
    }

    pub fn with_priority_fn(mut self, priority_fn: PriorityFn<P>) -> Self {
        self.priority_fn = Some(priority_fn);
        self
    }

    pub fn endpoint_key(&self, descriptor: &RequestDescriptor<P>) -> String {
        let resolved = match &self.key_fn {
            Some(key_fn) => key_fn(descriptor),
            None => Some(descriptor.endpoint().to_string()),
        };

        match resolved {
            Some(key) if !key.is_empty() => key,
            _ => DEFAULT_ENDPOINT_KEY.to_string(),
        }
    }

    pub fn priority(&self, descriptor: &RequestDescriptor<P>) -> i64 {
        match &self.priority_fn {
            Some(priority_fn) => priority_fn(descriptor),
            None => descriptor.priority(),
        }
    }
}

impl<P> Default for RequestClassifier<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Clone for RequestClassifier<P> {
    fn clone(&self) -> Self {
        Self { key_fn: self.key_fn.clone(), priority_fn: self.priority_fn.clone() }
    }
}

impl<P> fmt::Debug for RequestClassifier<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestClassifier")
            .field("key_fn", &self.key_fn.as_ref().map(|_| "<function>"))
            .field("priority_fn", &self.priority_fn.as_ref().map(|_| "<function>"))
            .finish()
    }
}
