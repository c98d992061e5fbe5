//! The built-in pipeline stages, expressed as hooks.
//!
//! Stage priorities put admission outermost, then the circuit check, then
//! retry. The chain hands every stage back the descriptor its own `pre_call`
//! saw, so slots and trials are released under the key they were taken for
//! even when a custom hook rewrites the request further in.
//!
//! A custom hook that acquires something in `pre_call` should use a
//! priority above [`RETRY_STAGE_PRIORITY`], so its release runs before the
//! retry backoff rather than being abandoned after it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::admission::AdmissionController;
use crate::circuit::CircuitBreaker;
use crate::descriptor::{RequestClassifier, RequestDescriptor};
use crate::error::PipelineError;
use crate::hooks::{ErrorOutcome, Hook, PreCall};
use crate::retry::RetryOrchestrator;

pub const ADMISSION_STAGE_PRIORITY: i32 = 300;
pub const CIRCUIT_STAGE_PRIORITY: i32 = 200;
pub const RETRY_STAGE_PRIORITY: i32 = 100;

/// Acquires an admission slot before the call and releases it on every
/// outcome.
pub(crate) struct AdmissionStage<P> {
    controller: Arc<AdmissionController<P>>,
}

impl<P> AdmissionStage<P> {
    pub(crate) fn new(controller: Arc<AdmissionController<P>>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl<P, R> Hook<P, R> for AdmissionStage<P>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    fn name(&self) -> &str {
        "admission"
    }

    async fn pre_call(
        &self,
        descriptor: RequestDescriptor<P>,
    ) -> Result<PreCall<P, R>, PipelineError> {
        self.controller.acquire(&descriptor).await?;
        Ok(PreCall::Continue(descriptor))
    }

    async fn post_call(
        &self,
        descriptor: &RequestDescriptor<P>,
        response: R,
    ) -> Result<R, PipelineError> {
        self.controller.release(descriptor);
        Ok(response)
    }

    async fn on_error(
        &self,
        descriptor: &RequestDescriptor<P>,
        error: PipelineError,
    ) -> ErrorOutcome<P, R> {
        self.controller.release(descriptor);
        ErrorOutcome::Propagate(error)
    }

    fn abandon(&self, descriptor: &RequestDescriptor<P>) {
        self.controller.release(descriptor);
    }
}

/// Fails fast on open circuits and records each attempt's outcome.
///
/// The request id identifies the attempt to the breaker, so only the
/// half-open trial's own outcome can close or reopen the circuit.
pub(crate) struct CircuitStage<P> {
    breaker: Arc<CircuitBreaker>,
    classifier: Arc<RequestClassifier<P>>,
}

impl<P> CircuitStage<P> {
    pub(crate) fn new(breaker: Arc<CircuitBreaker>, classifier: Arc<RequestClassifier<P>>) -> Self {
        Self { breaker, classifier }
    }
}

#[async_trait]
impl<P, R> Hook<P, R> for CircuitStage<P>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    fn name(&self) -> &str {
        "circuit_breaker"
    }

    async fn pre_call(
        &self,
        descriptor: RequestDescriptor<P>,
    ) -> Result<PreCall<P, R>, PipelineError> {
        self.breaker.before_call(&self.classifier.endpoint_key(&descriptor), descriptor.id())?;
        Ok(PreCall::Continue(descriptor))
    }

    async fn post_call(
        &self,
        descriptor: &RequestDescriptor<P>,
        response: R,
    ) -> Result<R, PipelineError> {
        self.breaker.on_success(&self.classifier.endpoint_key(descriptor), descriptor.id());
        Ok(response)
    }

    async fn on_error(
        &self,
        descriptor: &RequestDescriptor<P>,
        error: PipelineError,
    ) -> ErrorOutcome<P, R> {
        self.breaker.on_failure(&self.classifier.endpoint_key(descriptor), descriptor.id(), &error);
        ErrorOutcome::Propagate(error)
    }

    fn abandon(&self, descriptor: &RequestDescriptor<P>) {
        self.breaker.release_trial(&self.classifier.endpoint_key(descriptor), descriptor.id());
    }
}

/// Turns retryable failures into a re-run of the chain after a backoff.
pub(crate) struct RetryStage<P> {
    orchestrator: Arc<RetryOrchestrator>,
    classifier: Arc<RequestClassifier<P>>,
}

impl<P> RetryStage<P> {
    pub(crate) fn new(
        orchestrator: Arc<RetryOrchestrator>,
        classifier: Arc<RequestClassifier<P>>,
    ) -> Self {
        Self { orchestrator, classifier }
    }
}

#[async_trait]
impl<P, R> Hook<P, R> for RetryStage<P>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    fn name(&self) -> &str {
        "retry"
    }

    async fn on_error(
        &self,
        descriptor: &RequestDescriptor<P>,
        error: PipelineError,
    ) -> ErrorOutcome<P, R> {
        let endpoint = self.classifier.endpoint_key(descriptor);
        match self.orchestrator.handle_failure(error, descriptor, &endpoint).await {
            Ok(next) => ErrorOutcome::Retry(next),
            Err(error) => ErrorOutcome::Propagate(error),
        }
    }
}
