use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use callgate_common::CommonError;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::token_bucket::TokenBucket;
use crate::config::PipelineConfig;
use crate::descriptor::{RequestClassifier, RequestDescriptor};
use crate::error::{PipelineError, RejectReason};

type Grant = Result<(), PipelineError>;

/// A granted admission slot.
///
/// The slot stays occupied until [`AdmissionController::release`] is called
/// for the same request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    endpoint: String,
    queued_for: Option<Duration>,
}

impl Admission {
    /// Endpoint key the slot was granted under; release with this key.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Time spent queued, or `None` if admitted immediately.
    pub fn queued_for(&self) -> Option<Duration> {
        self.queued_for
    }
}

/// Outcome of a non-blocking admission attempt.
#[derive(Debug)]
pub enum AdmissionAttempt<P: Send + Sync + 'static> {
    Admitted(Admission),
    Queued(PendingAdmission<P>),
}

#[derive(Debug, Default)]
struct EndpointState {
    in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<i64>,
    seq: u64,
}

struct QueueEntry<P> {
    descriptor: RequestDescriptor<P>,
    endpoint: String,
    sender: oneshot::Sender<Grant>,
    enqueued_at: Instant,
}

struct AdmissionState<P> {
    global_in_flight: usize,
    endpoints: HashMap<String, EndpointState>,
    // Ordered by priority descending, then enqueue order.
    queue: BTreeMap<QueueKey, QueueEntry<P>>,
    next_seq: u64,
    disposed: bool,
}

/// Gates in-flight requests globally and per endpoint.
///
/// Every check-and-increment happens under one lock, so no admission attempt
/// can observe another's intermediate state. Requests that do not fit are
/// queued (priority descending, FIFO within a priority) or rejected,
/// depending on configuration. The queue is drained after every release,
/// every enqueue and every token refill.
pub struct AdmissionController<P> {
    global_limit: Option<usize>,
    endpoint_limits: HashMap<String, usize>,
    queue_enabled: bool,
    max_queue_depth: Option<usize>,
    bucket: Option<TokenBucket>,
    classifier: Arc<RequestClassifier<P>>,
    state: Mutex<AdmissionState<P>>,
    shutdown: CancellationToken,
    refill_task: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Send + Sync + 'static> AdmissionController<P> {
    /// Create a controller and start its token refill timer (if a bucket is
    /// configured and a Tokio runtime is available).
    pub fn new(config: &PipelineConfig, classifier: Arc<RequestClassifier<P>>) -> Arc<Self> {
        let controller = Arc::new(Self {
            global_limit: config.global_concurrency,
            endpoint_limits: config.endpoint_concurrency.clone(),
            queue_enabled: config.queue_enabled,
            max_queue_depth: config.max_queue_depth,
            bucket: config.token_bucket.as_ref().map(TokenBucket::new),
            classifier,
            state: Mutex::new(AdmissionState {
                global_in_flight: 0,
                endpoints: HashMap::new(),
                queue: BTreeMap::new(),
                next_seq: 0,
                disposed: false,
            }),
            shutdown: CancellationToken::new(),
            refill_task: Mutex::new(None),
        });

        controller.start_refill_timer();
        controller
    }

    fn start_refill_timer(self: &Arc<Self>) {
        let Some(bucket) = &self.bucket else {
            return;
        };

        let period = bucket.interval();
        let weak: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        match Handle::try_current() {
            Ok(runtime) => {
                let handle = runtime.spawn(async move {
                    let mut interval = tokio::time::interval(period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    interval.tick().await;

                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = interval.tick() => {}
                        }

                        let Some(controller) = weak.upgrade() else {
                            break;
                        };
                        controller.on_refill_tick();
                    }
                });

                *self.refill_task.lock() = Some(handle);
            }
            Err(_) => {
                warn!("Token bucket will not refill: no active Tokio runtime detected");
            }
        }
    }

    /// One refill tick: add tokens, then admit whatever now fits.
    pub fn on_refill_tick(&self) {
        let Some(bucket) = &self.bucket else {
            return;
        };

        let tokens = bucket.refill();
        let mut state = self.state.lock();
        let admitted = self.process_queue_locked(&mut state);
        if admitted > 0 {
            debug!(
                tokens,
                admitted,
                queue_depth = state.queue.len(),
                "Refill admitted queued requests"
            );
        }
    }

    /// Try to admit without waiting.
    ///
    /// # Errors
    ///
    /// `Disposed` after [`dispose`](Self::dispose); `AdmissionRejected` when
    /// the request does not fit and queuing is disabled or the queue is full.
    pub fn try_acquire(
        self: &Arc<Self>,
        descriptor: &RequestDescriptor<P>,
    ) -> Result<AdmissionAttempt<P>, PipelineError> {
        let endpoint = self.classifier.endpoint_key(descriptor);
        let priority = self.classifier.priority(descriptor);

        let mut state = self.state.lock();
        if state.disposed {
            return Err(PipelineError::Disposed);
        }

        if self.try_admit_locked(&mut state, &endpoint) {
            debug!(
                request_id = %descriptor.id(),
                endpoint = %endpoint,
                in_flight = state.global_in_flight,
                "Request admitted"
            );
            return Ok(AdmissionAttempt::Admitted(Admission { endpoint, queued_for: None }));
        }

        if !self.queue_enabled {
            debug!(endpoint = %endpoint, "Request rejected: no capacity and queuing disabled");
            return Err(PipelineError::AdmissionRejected {
                endpoint,
                reason: RejectReason::NoCapacity,
            });
        }

        if self.max_queue_depth.is_some_and(|max| state.queue.len() >= max) {
            warn!(endpoint = %endpoint, queue_depth = state.queue.len(), "Admission queue full");
            return Err(PipelineError::AdmissionRejected {
                endpoint,
                reason: RejectReason::QueueFull,
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let (sender, receiver) = oneshot::channel();
        let enqueued_at = Instant::now();
        state.queue.insert(
            QueueKey { priority: Reverse(priority), seq },
            QueueEntry {
                descriptor: descriptor.clone(),
                endpoint: endpoint.clone(),
                sender,
                enqueued_at,
            },
        );
        debug!(
            request_id = %descriptor.id(),
            endpoint = %endpoint,
            priority,
            queue_depth = state.queue.len(),
            "Request queued"
        );

        self.process_queue_locked(&mut state);

        Ok(AdmissionAttempt::Queued(PendingAdmission {
            ticket: seq,
            endpoint,
            enqueued_at,
            receiver: Some(receiver),
            controller: Arc::clone(self),
        }))
    }

    /// Admit the request, waiting in the queue if necessary.
    ///
    /// A cancelled descriptor token withdraws the queued entry.
    ///
    /// # Errors
    ///
    /// Everything [`try_acquire`](Self::try_acquire) returns, plus
    /// `Disposed` if the controller is disposed while waiting and
    /// `Cancelled` if the descriptor's token fires while queued.
    #[instrument(
        skip_all,
        fields(request_id = %descriptor.id(), endpoint = %descriptor.endpoint())
    )]
    pub async fn acquire(
        self: &Arc<Self>,
        descriptor: &RequestDescriptor<P>,
    ) -> Result<Admission, PipelineError> {
        let pending = match self.try_acquire(descriptor)? {
            AdmissionAttempt::Admitted(admission) => return Ok(admission),
            AdmissionAttempt::Queued(pending) => pending,
        };

        match descriptor.cancellation() {
            Some(token) => {
                tokio::select! {
                    biased;
                    outcome = pending.wait() => outcome,
                    _ = token.cancelled() => {
                        debug!("Queued request cancelled");
                        Err(PipelineError::Cancelled)
                    }
                }
            }
            None => pending.wait().await,
        }
    }

    /// Free the slot held by `descriptor`, then drain the queue.
    ///
    /// Counters are floored at zero, so a release without a matching
    /// admission is harmless.
    pub fn release(&self, descriptor: &RequestDescriptor<P>) {
        let endpoint = self.classifier.endpoint_key(descriptor);
        let mut state = self.state.lock();
        Self::release_locked(&mut state, &endpoint);
        self.process_queue_locked(&mut state);
    }

    /// Remove a queued request, failing its pending admission with
    /// `Withdrawn`. Returns `false` if the ticket is no longer queued.
    pub fn withdraw(&self, ticket: u64) -> bool {
        let mut state = self.state.lock();
        let Some(key) = state.queue.keys().find(|key| key.seq == ticket).copied() else {
            return false;
        };

        if let Some(entry) = state.queue.remove(&key) {
            debug!(
                request_id = %entry.descriptor.id(),
                endpoint = %entry.endpoint,
                "Request withdrawn"
            );
            let _ = entry.sender.send(Err(PipelineError::Withdrawn));
        }
        true
    }

    /// Stop the refill timer and fail every queued request with `Disposed`.
    /// Later admission attempts fail with `Disposed` too.
    pub fn dispose(&self) {
        let drained = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            std::mem::take(&mut state.queue)
        };

        self.shutdown.cancel();
        if let Some(bucket) = &self.bucket {
            bucket.stop();
        }
        if let Some(handle) = self.refill_task.lock().take() {
            handle.abort();
        }

        let rejected = drained.len();
        for (_, entry) in drained {
            let _ = entry.sender.send(Err(PipelineError::Disposed));
        }
        info!(rejected, "Admission controller disposed");
    }

    /// Whether [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// In-flight requests for one endpoint key.
    pub fn in_flight(&self, endpoint: &str) -> usize {
        self.state.lock().endpoints.get(endpoint).map_or(0, |e| e.in_flight)
    }

    /// In-flight requests across all endpoints.
    pub fn global_in_flight(&self) -> usize {
        self.state.lock().global_in_flight
    }

    /// Requests waiting in the admission queue.
    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Queued requests for one endpoint key.
    pub fn queue_depth(&self, endpoint: &str) -> usize {
        self.state.lock().queue.values().filter(|entry| entry.endpoint == endpoint).count()
    }

    /// The rate limiter, or `None` when rate limiting is disabled.
    pub fn token_bucket(&self) -> Option<&TokenBucket> {
        self.bucket.as_ref()
    }

    fn global_full(&self, state: &AdmissionState<P>) -> bool {
        self.global_limit.is_some_and(|limit| state.global_in_flight >= limit)
    }

    // Checks run in order global, endpoint, token so a token is only spent
    // when the request is otherwise admissible.
    fn try_admit_locked(&self, state: &mut AdmissionState<P>, endpoint: &str) -> bool {
        if self.global_full(state) {
            return false;
        }

        if let Some(limit) = self.endpoint_limits.get(endpoint) {
            let current = state.endpoints.get(endpoint).map_or(0, |e| e.in_flight);
            if current >= *limit {
                return false;
            }
        }

        if let Some(bucket) = &self.bucket {
            if !bucket.try_consume() {
                return false;
            }
        }

        state.global_in_flight += 1;
        state.endpoints.entry(endpoint.to_string()).or_default().in_flight += 1;
        true
    }

    fn release_locked(state: &mut AdmissionState<P>, endpoint: &str) {
        state.global_in_flight = state.global_in_flight.saturating_sub(1);
        if let Some(entry) = state.endpoints.get_mut(endpoint) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }

    /// Single pass over the queue in priority order, admitting every entry
    /// that currently fits. Returns the number admitted.
    fn process_queue_locked(&self, state: &mut AdmissionState<P>) -> usize {
        if state.disposed || state.queue.is_empty() {
            return 0;
        }

        let keys: Vec<QueueKey> = state.queue.keys().copied().collect();
        let mut admitted = 0;

        for key in keys {
            if self.global_full(state) {
                break;
            }

            let (endpoint, closed) = match state.queue.get(&key) {
                Some(entry) => (entry.endpoint.clone(), entry.sender.is_closed()),
                None => continue,
            };

            if closed {
                state.queue.remove(&key);
                continue;
            }

            if !self.try_admit_locked(state, &endpoint) {
                continue;
            }

            let Some(entry) = state.queue.remove(&key) else {
                Self::release_locked(state, &endpoint);
                continue;
            };

            if entry.sender.send(Ok(())).is_err() {
                Self::release_locked(state, &endpoint);
                continue;
            }

            admitted += 1;
            debug!(
                request_id = %entry.descriptor.id(),
                endpoint = %entry.endpoint,
                waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                "Queued request admitted"
            );
        }

        admitted
    }
}

impl<P> Drop for AdmissionController<P> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A queued admission request.
///
/// Dropping it before it resolves withdraws the queue entry; if the slot was
/// granted but never observed, the slot is released.
pub struct PendingAdmission<P: Send + Sync + 'static> {
    ticket: u64,
    endpoint: String,
    enqueued_at: Instant,
    receiver: Option<oneshot::Receiver<Grant>>,
    controller: Arc<AdmissionController<P>>,
}

impl<P: Send + Sync + 'static> PendingAdmission<P> {
    /// Ticket accepted by [`AdmissionController::withdraw`].
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Classified endpoint key the request is queued under.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Wait until the request is admitted, withdrawn or the controller is
    /// disposed.
    pub async fn wait(mut self) -> Result<Admission, PipelineError> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(PipelineError::Withdrawn);
        };

        let outcome = receiver.await;
        self.receiver = None;

        match outcome {
            Ok(Ok(())) => Ok(Admission {
                endpoint: std::mem::take(&mut self.endpoint),
                queued_for: Some(self.enqueued_at.elapsed()),
            }),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(CommonError::internal_with_context(
                "queue entry dropped without a decision",
                "admission",
            )
            .into()),
        }
    }
}

impl<P: Send + Sync + 'static> Drop for PendingAdmission<P> {
    fn drop(&mut self) {
        let Some(mut receiver) = self.receiver.take() else {
            return;
        };

        let controller = &self.controller;
        let mut state = controller.state.lock();

        let key = state.queue.keys().find(|key| key.seq == self.ticket).copied();
        if let Some(key) = key {
            state.queue.remove(&key);
            debug!(endpoint = %self.endpoint, "Pending admission dropped while queued");
            return;
        }

        if let Ok(Ok(())) = receiver.try_recv() {
            AdmissionController::<P>::release_locked(&mut state, &self.endpoint);
            controller.process_queue_locked(&mut state);
        }
    }
}

impl<P: Send + Sync + 'static> std::fmt::Debug for PendingAdmission<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAdmission")
            .field("ticket", &self.ticket)
            .field("endpoint", &self.endpoint)
            .field("resolved", &self.receiver.is_none())
            .finish()
    }
}
