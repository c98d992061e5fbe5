use std::cmp::Reverse;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{ErrorOutcome, Hook, PreCall};
use crate::descriptor::RequestDescriptor;
use crate::error::{CallFailure, PipelineError};
use crate::transport::Transport;

/// Default upper bound on chain passes for a single call.
pub const DEFAULT_MAX_RUNS: u32 = 64;

struct RegisteredHook<P, R> {
    priority: i32,
    hook: Arc<dyn Hook<P, R>>,
}

/// How a single pass through the chain ended.
enum RunOutcome<P, R> {
    Done(R),
    Failed(CallFailure<P>),
    /// A hook asked for another pass; `last` is the failure it answered.
    Retry { next: RequestDescriptor<P>, last: CallFailure<P> },
}

/// Ordered list of hooks executed around a transport call.
///
/// Every hook's `post_call`, `on_error` and `abandon` receive the descriptor
/// that hook's own `pre_call` was given, even if a later hook replaced it.
pub struct HookChain<P, R> {
    hooks: Vec<RegisteredHook<P, R>>,
    max_runs: u32,
}

impl<P, R> HookChain<P, R>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn new() -> Self {
        Self { hooks: Vec::new(), max_runs: DEFAULT_MAX_RUNS }
    }

    /// Cap the number of passes (original attempt plus re-runs).
    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = max_runs.max(1);
        self
    }

    /// Add a hook. Higher priorities run first; equal priorities keep
    /// registration order.
    pub fn register(&mut self, hook: Arc<dyn Hook<P, R>>, priority: i32) {
        self.hooks.push(RegisteredHook { priority, hook });
        self.hooks.sort_by_key(|entry| Reverse(entry.priority));
    }

    /// Hook names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.hooks.iter().map(|entry| entry.hook.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Maximum number of passes per call.
    pub fn max_runs(&self) -> u32 {
        self.max_runs
    }

    /// Run the chain around `transport` until it produces a response or a
    /// terminal failure.
    ///
    /// # Errors
    ///
    /// The final [`PipelineError`] together with the descriptor of the last
    /// attempt. When the run limit stops a retry, that is the failure the
    /// retrying hook answered.
    pub async fn execute<T>(
        &self,
        descriptor: RequestDescriptor<P>,
        transport: &T,
    ) -> Result<R, CallFailure<P>>
    where
        T: Transport<P, R> + ?Sized,
    {
        let mut descriptor = descriptor;
        let mut run = 1;

        loop {
            match self.run_once(descriptor, transport).await {
                RunOutcome::Done(response) => return Ok(response),
                RunOutcome::Failed(failure) => return Err(failure),
                RunOutcome::Retry { last, .. } if run >= self.max_runs => {
                    warn!(
                        request_id = %last.descriptor().id(),
                        max_runs = self.max_runs,
                        error_kind = last.error().kind_name(),
                        "Hook chain run limit reached"
                    );
                    return Err(last);
                }
                RunOutcome::Retry { next, .. } => {
                    debug!(
                        request_id = %next.id(),
                        run,
                        attempt_count = next.attempt_count(),
                        "Re-running hook chain"
                    );
                    descriptor = next;
                    run += 1;
                }
            }
        }
    }

    async fn run_once<T>(
        &self,
        descriptor: RequestDescriptor<P>,
        transport: &T,
    ) -> RunOutcome<P, R>
    where
        T: Transport<P, R> + ?Sized,
    {
        let mut guard = AbandonGuard::new(&self.hooks);
        let mut current = descriptor;

        for (index, entry) in self.hooks.iter().enumerate() {
            match entry.hook.pre_call(current.clone()).await {
                Ok(PreCall::Continue(next)) => {
                    let seen = std::mem::replace(&mut current, next);
                    guard.enter(index, seen);
                }
                Ok(PreCall::ShortCircuit(response)) => {
                    debug!(
                        request_id = %current.id(),
                        hook = entry.hook.name(),
                        "Pre-call hook short-circuited"
                    );
                    return RunOutcome::Done(response);
                }
                Err(error) => {
                    debug!(
                        request_id = %current.id(),
                        hook = entry.hook.name(),
                        error_kind = error.kind_name(),
                        "Pre-call hook failed, unwinding"
                    );
                    return self.on_error(&mut guard, current, error).await;
                }
            }
        }

        match transport.call(&current).await {
            Ok(response) => self.post_call(&mut guard, 0, current, response).await,
            Err(error) => self.on_error(&mut guard, current, error.into()).await,
        }
    }

    /// Thread `response` through the post-call hooks of entered hooks from
    /// `from` onwards.
    async fn post_call(
        &self,
        guard: &mut AbandonGuard<'_, P, R>,
        from: usize,
        descriptor: RequestDescriptor<P>,
        response: R,
    ) -> RunOutcome<P, R> {
        let mut response = response;

        for (index, entry) in self.hooks.iter().enumerate().skip(from) {
            let Some(seen) = guard.settle(index) else {
                continue;
            };
            match entry.hook.post_call(&seen, response).await {
                Ok(next) => response = next,
                Err(error) => {
                    warn!(
                        request_id = %descriptor.id(),
                        hook = entry.hook.name(),
                        error = %error,
                        "Post-call hook failed"
                    );
                    return RunOutcome::Failed(CallFailure::new(error, descriptor));
                }
            }
        }

        RunOutcome::Done(response)
    }

    /// Thread `error` through the error hooks of entered hooks until one
    /// recovers or asks for a retry.
    async fn on_error(
        &self,
        guard: &mut AbandonGuard<'_, P, R>,
        descriptor: RequestDescriptor<P>,
        error: PipelineError,
    ) -> RunOutcome<P, R> {
        let mut error = error;

        for (index, entry) in self.hooks.iter().enumerate() {
            let Some(seen) = guard.settle(index) else {
                continue;
            };
            let answered = error.clone();
            match entry.hook.on_error(&seen, error).await {
                ErrorOutcome::Propagate(next) => error = next,
                ErrorOutcome::Recovered(response) => {
                    debug!(
                        request_id = %descriptor.id(),
                        hook = entry.hook.name(),
                        "Error hook recovered"
                    );
                    return self.post_call(guard, index + 1, descriptor, response).await;
                }
                ErrorOutcome::Retry(next) => {
                    return RunOutcome::Retry {
                        next,
                        last: CallFailure::new(answered, descriptor),
                    };
                }
            }
        }

        RunOutcome::Failed(CallFailure::new(error, descriptor))
    }
}

impl<P, R> Default for HookChain<P, R>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<P, R> fmt::Debug for HookChain<P, R>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks: Vec<(&str, i32)> =
            self.hooks.iter().map(|entry| (entry.hook.name(), entry.priority)).collect();
        f.debug_struct("HookChain")
            .field("hooks", &hooks)
            .field("max_runs", &self.max_runs)
            .finish()
    }
}

/// Holds, for each hook that has completed `pre_call` but not yet received
/// `post_call` or `on_error` in the current run, the descriptor it was
/// given. Abandons those hooks on drop.
///
/// Dropping happens at the end of every run and also when the caller drops
/// the `execute` future mid-flight.
struct AbandonGuard<'a, P, R>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    hooks: &'a [RegisteredHook<P, R>],
    entered: Vec<Option<RequestDescriptor<P>>>,
}

impl<'a, P, R> AbandonGuard<'a, P, R>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    fn new(hooks: &'a [RegisteredHook<P, R>]) -> Self {
        Self { hooks, entered: hooks.iter().map(|_| None).collect() }
    }

    fn enter(&mut self, index: usize, seen: RequestDescriptor<P>) {
        self.entered[index] = Some(seen);
    }

    /// Take the hook's descriptor if it was still pending.
    fn settle(&mut self, index: usize) -> Option<RequestDescriptor<P>> {
        self.entered[index].take()
    }
}

impl<P, R> Drop for AbandonGuard<'_, P, R>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    fn drop(&mut self) {
        for (entry, seen) in self.hooks.iter().zip(&self.entered).rev() {
            if let Some(seen) = seen {
                entry.hook.abandon(seen);
            }
        }
    }
}
