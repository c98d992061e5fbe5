//! Ordered pre-call, post-call and error hooks around a transport call.
//!
//! Every pipeline stage (admission, circuit breaking, retry) is a [`Hook`]
//! registered on a [`HookChain`]; user hooks slot in between them by
//! priority. A hook whose `pre_call` completed is guaranteed exactly one of
//! `post_call`, `on_error` or `abandon` for that run, so stages can pair
//! acquisition in `pre_call` with release in the other three.

mod chain;

pub use chain::{HookChain, DEFAULT_MAX_RUNS};

use async_trait::async_trait;

use crate::descriptor::RequestDescriptor;
use crate::error::PipelineError;

/// Result of a pre-call hook.
#[derive(Debug)]
pub enum PreCall<P, R> {
    /// Continue with this (possibly rewritten) descriptor.
    Continue(RequestDescriptor<P>),
    /// Skip the transport and the post-call hooks and answer with this
    /// response.
    ShortCircuit(R),
}

/// Result of an error hook.
#[derive(Debug)]
pub enum ErrorOutcome<P, R> {
    /// Hand the error (possibly replaced) to the next error hook.
    Propagate(PipelineError),
    /// Treat the call as successful with this response. Post-call hooks
    /// registered after the recovering hook still run.
    Recovered(R),
    /// Re-run the whole chain with this descriptor.
    Retry(RequestDescriptor<P>),
}

/// A stage of the call pipeline.
///
/// All methods have pass-through defaults, so a hook only implements the
/// phases it cares about.
#[async_trait]
pub trait Hook<P, R>: Send + Sync
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    /// Name used in logs and in `PipelineError::Hook`.
    fn name(&self) -> &str;

    /// Runs before the transport, in chain order.
    ///
    /// # Errors
    ///
    /// An error here is routed through the error hooks of the hooks whose
    /// pre-call already completed; the transport is not called.
    async fn pre_call(
        &self,
        descriptor: RequestDescriptor<P>,
    ) -> Result<PreCall<P, R>, PipelineError> {
        Ok(PreCall::Continue(descriptor))
    }

    /// Runs after a successful transport call (or a recovery), in chain order.
    ///
    /// # Errors
    ///
    /// An error here is fatal: remaining hooks are abandoned and the error
    /// is returned to the caller.
    async fn post_call(
        &self,
        _descriptor: &RequestDescriptor<P>,
        response: R,
    ) -> Result<R, PipelineError> {
        Ok(response)
    }

    /// Runs after a failed attempt, in chain order.
    async fn on_error(
        &self,
        _descriptor: &RequestDescriptor<P>,
        error: PipelineError,
    ) -> ErrorOutcome<P, R> {
        ErrorOutcome::Propagate(error)
    }

    /// Called instead of `post_call`/`on_error` when a run ends without
    /// reaching this hook again: a later hook short-circuited, a post-call
    /// failed, a retry was scheduled by an earlier hook, or the caller
    /// dropped the call.
    fn abandon(&self, _descriptor: &RequestDescriptor<P>) {}
}
