//! In-memory transports.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use callgate_core::{RequestDescriptor, Transport, TransportError};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Replays a fixed script of outcomes, then succeeds with `0` forever.
///
/// Records the instant of every call so tests can measure backoff gaps.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<u32, TransportError>>>,
    calls: AtomicU32,
    call_times: Mutex<Vec<Instant>>,
}

impl ScriptedTransport {
    pub fn new(script: impl IntoIterator<Item = Result<u32, TransportError>>) -> Self {
        Self { script: Mutex::new(script.into_iter().collect()), ..Self::default() }
    }

    /// Fail `times` times with `error`, then succeed with `ok`.
    pub fn failing(times: usize, error: TransportError, ok: u32) -> Self {
        let mut script: Vec<_> = std::iter::repeat(Err(error)).take(times).collect();
        script.push(Ok(ok));
        Self::new(script)
    }

    /// Always fail with `error`.
    pub fn always(error: TransportError) -> Self {
        Self::failing(10_000, error, 0)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().clone()
    }
}

#[async_trait]
impl<P: Send + Sync + 'static> Transport<P, u32> for ScriptedTransport {
    async fn call(&self, _descriptor: &RequestDescriptor<P>) -> Result<u32, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().push(Instant::now());
        self.script.lock().pop_front().unwrap_or(Ok(0))
    }
}

/// Blocks every call until the test releases it with [`GatedTransport::open`].
///
/// Tracks current and peak concurrency per endpoint and overall, plus the
/// order in which calls started (by `u32` payload).
pub struct GatedTransport {
    gate: Arc<Semaphore>,
    state: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    active: HashMap<String, usize>,
    peak: HashMap<String, usize>,
    active_total: usize,
    peak_total: usize,
    started: Vec<u32>,
}

impl GatedTransport {
    pub fn new() -> Self {
        Self { gate: Arc::new(Semaphore::new(0)), state: Mutex::default() }
    }

    /// Let `n` blocked (or future) calls complete.
    pub fn open(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn started(&self) -> Vec<u32> {
        self.state.lock().started.clone()
    }

    pub fn started_count(&self) -> usize {
        self.state.lock().started.len()
    }

    pub fn active_total(&self) -> usize {
        self.state.lock().active_total
    }

    pub fn peak(&self, endpoint: &str) -> usize {
        self.state.lock().peak.get(endpoint).copied().unwrap_or(0)
    }

    pub fn peak_total(&self) -> usize {
        self.state.lock().peak_total
    }
}

#[async_trait]
impl Transport<u32, u32> for GatedTransport {
    async fn call(&self, descriptor: &RequestDescriptor<u32>) -> Result<u32, TransportError> {
        let endpoint = descriptor.endpoint().to_string();
        {
            let mut state = self.state.lock();
            let active = state.active.entry(endpoint.clone()).or_default();
            *active += 1;
            let active = *active;
            let peak = state.peak.entry(endpoint.clone()).or_default();
            *peak = (*peak).max(active);
            state.active_total += 1;
            state.peak_total = state.peak_total.max(state.active_total);
            state.started.push(*descriptor.payload());
        }

        let permit = self.gate.acquire().await;
        if let Ok(permit) = permit {
            permit.forget();
        }

        let mut state = self.state.lock();
        if let Some(active) = state.active.get_mut(&endpoint) {
            *active -= 1;
        }
        state.active_total -= 1;
        Ok(*descriptor.payload())
    }
}
