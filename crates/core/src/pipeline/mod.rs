//! The assembled call pipeline.
//!
//! A [`Pipeline`] owns one admission controller, one circuit breaker and one
//! retry orchestrator, wired into a [`HookChain`] together with any custom
//! hooks. Per-endpoint state lives inside those components, so separate
//! pipelines never share limits or circuits.

mod stages;

pub use stages::{ADMISSION_STAGE_PRIORITY, CIRCUIT_STAGE_PRIORITY, RETRY_STAGE_PRIORITY};

use std::fmt;
use std::sync::Arc;

use callgate_common::time::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::admission::AdmissionController;
use crate::circuit::{
    CircuitBreaker, CircuitState, FailureListener, StateListener, SuccessListener,
};
use crate::config::PipelineConfig;
use crate::descriptor::{KeyFn, PriorityFn, RequestClassifier, RequestDescriptor};
use crate::error::{CallFailure, PipelineError};
use crate::hooks::{Hook, HookChain, DEFAULT_MAX_RUNS};
use crate::retry::{RetryOrchestrator, RetryPredicate};
use crate::transport::Transport;
use stages::{AdmissionStage, CircuitStage, RetryStage};

/// Point-in-time view of one endpoint key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub endpoint: String,
    pub circuit_state: CircuitState,
    pub failure_count: u32,
    pub in_flight: usize,
    pub queue_depth: usize,
}

/// Builder for [`Pipeline`]; closures and extra hooks go here, plain
/// settings go in [`PipelineConfig`].
pub struct PipelineBuilder<P, R> {
    config: PipelineConfig,
    key_fn: Option<KeyFn<P>>,
    priority_fn: Option<PriorityFn<P>>,
    retry_predicates: Vec<RetryPredicate>,
    state_listener: Option<StateListener>,
    success_listener: Option<SuccessListener>,
    failure_listener: Option<FailureListener>,
    clock: Option<Arc<dyn Clock>>,
    hooks: Vec<(Arc<dyn Hook<P, R>>, i32)>,
    max_runs: u32,
}

impl<P, R> PipelineBuilder<P, R>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            key_fn: None,
            priority_fn: None,
            retry_predicates: Vec::new(),
            state_listener: None,
            success_listener: None,
            failure_listener: None,
            clock: None,
            hooks: Vec::new(),
            max_runs: DEFAULT_MAX_RUNS,
        }
    }

    /// Resolve endpoint keys with `key_fn` instead of the request endpoint.
    pub fn key_fn(
        mut self,
        key_fn: impl Fn(&RequestDescriptor<P>) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Compute queue priorities with `priority_fn` instead of the descriptor
    /// priority.
    pub fn priority_fn(
        mut self,
        priority_fn: impl Fn(&RequestDescriptor<P>) -> i64 + Send + Sync + 'static,
    ) -> Self {
        self.priority_fn = Some(Arc::new(priority_fn));
        self
    }

    /// Add a retry predicate; the first one replaces the default.
    pub fn retry_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.retry_predicates.push(predicate);
        self
    }

    /// Observe circuit state transitions.
    pub fn state_listener(
        mut self,
        listener: impl Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    ) -> Self {
        self.state_listener = Some(Arc::new(listener));
        self
    }

    /// Observe every success the circuit breaker records.
    pub fn circuit_success_listener(
        mut self,
        listener: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        self.success_listener = Some(Arc::new(listener));
        self
    }

    /// Observe every failure the circuit breaker counts.
    pub fn circuit_failure_listener(
        mut self,
        listener: impl Fn(&str, &PipelineError) + Send + Sync + 'static,
    ) -> Self {
        self.failure_listener = Some(Arc::new(listener));
        self
    }

    /// Clock used by the circuit breaker's reset timeout.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Register a custom hook. See [`ADMISSION_STAGE_PRIORITY`] and the
    /// other stage priorities for where it lands.
    pub fn hook(mut self, hook: Arc<dyn Hook<P, R>>, priority: i32) -> Self {
        self.hooks.push((hook, priority));
        self
    }

    /// Cap the passes through the hook chain per call. When retries are
    /// configured the cap is raised to at least `max_retries + 1`.
    pub fn max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = max_runs;
        self
    }

    /// Validate the configuration and assemble the pipeline.
    ///
    /// Starts the token refill timer when a bucket is configured, so this
    /// should run inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// `PipelineError::Common` wrapping a `CommonError::Config` that names
    /// the invalid field.
    pub fn build(self) -> Result<Pipeline<P, R>, PipelineError> {
        self.config.validate()?;

        let mut classifier = RequestClassifier::new();
        if let Some(key_fn) = self.key_fn {
            classifier = classifier.with_key_fn(key_fn);
        }
        if let Some(priority_fn) = self.priority_fn {
            classifier = classifier.with_priority_fn(priority_fn);
        }
        let classifier = Arc::new(classifier);

        let admission = AdmissionController::new(&self.config, Arc::clone(&classifier));

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let breaker = self.config.circuit_breaker.clone().map(|breaker_config| {
            let mut breaker = CircuitBreaker::with_clock(breaker_config, clock);
            if let Some(listener) = self.state_listener {
                breaker = breaker.with_listener(listener);
            }
            if let Some(listener) = self.success_listener {
                breaker = breaker.with_success_listener(listener);
            }
            if let Some(listener) = self.failure_listener {
                breaker = breaker.with_failure_listener(listener);
            }
            Arc::new(breaker)
        });

        let retry = self.config.retry.clone().map(|retry_config| {
            let mut orchestrator = RetryOrchestrator::new(retry_config);
            for predicate in self.retry_predicates {
                orchestrator = orchestrator.with_predicate(predicate);
            }
            if let Some(breaker) = &breaker {
                orchestrator = orchestrator.with_circuit_breaker(Arc::clone(breaker));
            }
            Arc::new(orchestrator)
        });

        let max_runs = self
            .config
            .retry
            .as_ref()
            .map_or(self.max_runs, |retry| self.max_runs.max(retry.max_retries.saturating_add(1)));
        let mut chain = HookChain::new().with_max_runs(max_runs);
        chain.register(
            Arc::new(AdmissionStage::new(Arc::clone(&admission))),
            ADMISSION_STAGE_PRIORITY,
        );
        if let Some(breaker) = &breaker {
            chain.register(
                Arc::new(CircuitStage::new(Arc::clone(breaker), Arc::clone(&classifier))),
                CIRCUIT_STAGE_PRIORITY,
            );
        }
        if let Some(retry) = &retry {
            chain.register(
                Arc::new(RetryStage::new(Arc::clone(retry), Arc::clone(&classifier))),
                RETRY_STAGE_PRIORITY,
            );
        }
        for (hook, priority) in self.hooks {
            chain.register(hook, priority);
        }

        info!(
            global_concurrency = ?self.config.global_concurrency,
            queue_enabled = self.config.queue_enabled,
            circuit_breaker = breaker.is_some(),
            retry = retry.is_some(),
            hooks = ?chain.names(),
            max_runs = chain.max_runs(),
            "Pipeline built"
        );

        Ok(Pipeline { config: self.config, classifier, admission, breaker, retry, chain })
    }
}

impl<P, R> fmt::Debug for PipelineBuilder<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("config", &self.config)
            .field("hooks", &self.hooks.len())
            .field("max_runs", &self.max_runs)
            .finish_non_exhaustive()
    }
}

/// Admission control, circuit breaking and retries around a transport.
pub struct Pipeline<P, R> {
    config: PipelineConfig,
    classifier: Arc<RequestClassifier<P>>,
    admission: Arc<AdmissionController<P>>,
    breaker: Option<Arc<CircuitBreaker>>,
    retry: Option<Arc<RetryOrchestrator>>,
    chain: HookChain<P, R>,
}

impl<P, R> Pipeline<P, R>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn builder(config: PipelineConfig) -> PipelineBuilder<P, R> {
        PipelineBuilder::new(config)
    }

    /// Build a pipeline with no closures or custom hooks.
    ///
    /// # Errors
    ///
    /// See [`PipelineBuilder::build`].
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        PipelineBuilder::new(config).build()
    }

    /// Send a request through the pipeline.
    ///
    /// # Errors
    ///
    /// A [`CallFailure`] with the classified error and the descriptor of the
    /// last attempt made.
    #[instrument(
        skip_all,
        fields(request_id = %descriptor.id(), endpoint = %descriptor.endpoint())
    )]
    pub async fn execute<T>(
        &self,
        descriptor: RequestDescriptor<P>,
        transport: &T,
    ) -> Result<R, CallFailure<P>>
    where
        T: Transport<P, R> + ?Sized,
    {
        let result = self.chain.execute(descriptor, transport).await;
        if let Err(failure) = &result {
            debug!(
                error_kind = failure.error().kind_name(),
                attempt_count = failure.attempt_count(),
                "Request failed"
            );
        }
        result
    }

    /// Circuit and admission counters for one endpoint key.
    pub fn stats(&self, endpoint: &str) -> PipelineStats {
        let circuit = self.breaker.as_ref().map(|breaker| breaker.get_stats(endpoint));
        PipelineStats {
            endpoint: endpoint.to_string(),
            circuit_state: circuit.as_ref().map(|c| c.state).unwrap_or_default(),
            failure_count: circuit.as_ref().map_or(0, |c| c.failure_count),
            in_flight: self.admission.in_flight(endpoint),
            queue_depth: self.admission.queue_depth(endpoint),
        }
    }

    /// Stop the token refill timer and reject queued and future requests
    /// with `Disposed`. Calls already past admission run to completion.
    pub fn dispose(&self) {
        self.admission.dispose();
        info!("Pipeline disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.admission.is_disposed()
    }

    /// Endpoint key this pipeline uses for `descriptor`.
    pub fn endpoint_key(&self, descriptor: &RequestDescriptor<P>) -> String {
        self.classifier.endpoint_key(descriptor)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn admission(&self) -> &Arc<AdmissionController<P>> {
        &self.admission
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    pub fn retry(&self) -> Option<&Arc<RetryOrchestrator>> {
        self.retry.as_ref()
    }

    pub fn hook_chain(&self) -> &HookChain<P, R> {
        &self.chain
    }
}

impl<P, R> fmt::Debug for Pipeline<P, R>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}
