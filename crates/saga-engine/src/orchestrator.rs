//! The control loop that ties routing, correlation, execution and persistence together.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::OrchestratorConfig;
use crate::context::{Cancellation, ExecutionContext, Transition, TransitionKind};
use crate::error::{BoxError, SagaError};
use crate::pipeline::{Pipeline, StepInfo, StepMiddleware};
use crate::registration::{HandlerFn, RegisteredSaga, SagaRegistration, Stage};
use crate::router::SagaRouter;
use crate::saga::{Message, MessageType, Saga, SagaState, SagaType};
use crate::services::{MessagePublisher, SagaRecord, SagaRepository, SagaResolver};
use crate::state::SagaStatus;
use crate::validator::Violation;

/// A redelivery the transport should schedule for the triggering message.
///
/// Hand the message back through [`SagaOrchestrator::handle_message_for`]
/// with `saga`, so sibling sagas that already handled it do not run twice.
#[derive(Debug)]
pub struct RetryRequest {
    pub saga: SagaType,
    pub saga_type: &'static str,
    pub saga_id: String,
    /// None means redeliver immediately, subject to the transport's backoff.
    pub delay: Option<Duration>,
    pub error: Option<BoxError>,
}

/// What happened to one saga for one inbound message.
#[derive(Debug)]
pub struct StepOutcome {
    saga_type: &'static str,
    saga_id: String,
    stage: Stage,
    kind: TransitionKind,
    published: bool,
    concurrency_token: Option<String>,
    retry: Option<RetryRequest>,
    failure: Option<BoxError>,
}

impl StepOutcome {
    pub fn saga_type(&self) -> &'static str {
        self.saga_type
    }

    pub fn saga_id(&self) -> &str {
        &self.saga_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn kind(&self) -> TransitionKind {
        self.kind
    }

    /// Returns true if an outgoing message was handed to the publisher.
    pub fn published(&self) -> bool {
        self.published
    }

    /// Returns the token of the version this step saved.
    ///
    /// None for a `Retry`, which saves nothing.
    pub fn concurrency_token(&self) -> Option<&str> {
        self.concurrency_token.as_deref()
    }

    /// Returns the redelivery request of a `Retry` transition.
    pub fn retry(&self) -> Option<&RetryRequest> {
        self.retry.as_ref()
    }
}

/// The result of one [`SagaOrchestrator::handle_message`] call.
#[derive(Debug)]
pub struct HandleReport {
    message_type: MessageType,
    outcomes: Vec<StepOutcome>,
}

impl HandleReport {
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// One outcome per saga that handled the message, in registration order.
    pub fn outcomes(&self) -> &[StepOutcome] {
        &self.outcomes
    }

    pub fn into_outcomes(self) -> Vec<StepOutcome> {
        self.outcomes
    }

    /// Returns the outcome of saga type `saga_type`, if it handled the message.
    pub fn outcome_for(&self, saga_type: &str) -> Option<&StepOutcome> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.saga_type == saga_type)
    }

    /// Returns false if no registered saga reacts to the message type.
    pub fn is_relevant(&self) -> bool {
        !self.outcomes.is_empty()
    }

    /// Every redelivery the transport should schedule.
    pub fn retry_requests(&self) -> impl Iterator<Item = &RetryRequest> + '_ {
        self.outcomes.iter().filter_map(StepOutcome::retry)
    }
}

/// An inbound message with its envelope ids.
pub(crate) struct Inbound {
    message: Arc<dyn Message>,
    message_type: MessageType,
    correlation_id: Option<String>,
    causation_id: Option<String>,
}

impl Inbound {
    fn new(
        message: Arc<dyn Message>,
        correlation_id: Option<String>,
        causation_id: Option<String>,
    ) -> Self {
        Self {
            message_type: message.message_type(),
            message,
            correlation_id,
            causation_id,
        }
    }
}

/// Ports and pipeline shared by every registration.
pub(crate) struct Engine {
    repository: Arc<dyn SagaRepository>,
    publisher: Arc<dyn MessagePublisher>,
    resolver: Arc<dyn SagaResolver>,
    pipeline: Pipeline,
    config: OrchestratorConfig,
}

impl Engine {
    /// Runs `registration` for `inbound`.
    ///
    /// Returns None if the registration has no handler for the message type.
    pub(crate) async fn dispatch<S: Saga>(
        &self,
        registration: &SagaRegistration<S>,
        inbound: &Inbound,
        cancellation: &Cancellation,
    ) -> Result<Option<StepOutcome>, SagaError> {
        let Some((stage, handler)) = registration.handler(inbound.message_type) else {
            tracing::debug!(
                saga_type = S::saga_type(),
                message_type = %inbound.message_type,
                "no handler registered, skipping saga"
            );
            return Ok(None);
        };

        let outcome = match stage {
            Stage::Start => self.start::<S>(handler, inbound, cancellation).await?,
            Stage::Step | Stage::Compensate => {
                self.advance(registration, stage, handler, inbound, cancellation)
                    .await?
            }
        };
        Ok(Some(outcome))
    }

    async fn start<S: Saga>(
        &self,
        handler: HandlerFn<S>,
        inbound: &Inbound,
        cancellation: &Cancellation,
    ) -> Result<StepOutcome, SagaError> {
        cancellation.check()?;
        let saga = self.resolve::<S>().await?;

        let mut ctx = ExecutionContext::new(
            String::new(),
            S::saga_type(),
            S::State::default(),
            inbound.message.clone(),
            inbound.correlation_id.clone(),
            inbound.causation_id.clone(),
            cancellation.clone(),
        );
        saga.on_created(&mut ctx)
            .await
            .map_err(|source| SagaError::Handler {
                saga_type: S::saga_type().to_string(),
                source,
            })?;

        let saga_id = S::saga_id(ctx.state()).to_string();
        if saga_id.is_empty() {
            return Err(SagaError::configuration(
                S::saga_type(),
                vec![Violation::EmptySagaId],
            ));
        }

        tracing::info!(saga_type = S::saga_type(), saga_id = %saga_id, "saga created");
        let ctx = ctx.with_saga_id(saga_id);
        self.execute(&*saga, Stage::Start, handler, ctx, inbound).await
    }

    async fn advance<S: Saga>(
        &self,
        registration: &SagaRegistration<S>,
        stage: Stage,
        handler: HandlerFn<S>,
        inbound: &Inbound,
        cancellation: &Cancellation,
    ) -> Result<StepOutcome, SagaError> {
        let saga_id = registration.correlate(&*inbound.message)?;

        let mut attempts = 0;
        loop {
            match self
                .advance_once::<S>(&saga_id, stage, handler, inbound, cancellation)
                .await
            {
                Err(SagaError::Concurrency { .. }) if attempts < self.config.concurrency_retries => {
                    attempts += 1;
                    metrics::counter!("saga_concurrency_conflicts_total", "saga_type" => S::saga_type())
                        .increment(1);
                    tracing::warn!(
                        saga_type = S::saga_type(),
                        saga_id = %saga_id,
                        attempt = attempts,
                        "stale saga state, reloading"
                    );
                }
                Err(err @ SagaError::Concurrency { .. }) => {
                    metrics::counter!("saga_concurrency_conflicts_total", "saga_type" => S::saga_type())
                        .increment(1);
                    return Err(err);
                }
                result => return result,
            }
        }
    }

    async fn advance_once<S: Saga>(
        &self,
        saga_id: &str,
        stage: Stage,
        handler: HandlerFn<S>,
        inbound: &Inbound,
        cancellation: &Cancellation,
    ) -> Result<StepOutcome, SagaError> {
        cancellation.check()?;
        let SagaRecord {
            status,
            state,
            concurrency_token,
            ..
        } = self
            .repository
            .load_state(S::saga_type(), saga_id, cancellation)
            .await?
            .ok_or_else(|| SagaError::SagaNotFound {
                saga_type: S::saga_type().to_string(),
                saga_id: saga_id.to_string(),
            })?;

        if status.is_terminal() {
            return Err(SagaError::SagaTerminated {
                saga_type: S::saga_type().to_string(),
                saga_id: saga_id.to_string(),
                status,
            });
        }

        let mut state: S::State = serde_json::from_value(state)?;
        state.set_concurrency_token(concurrency_token);

        cancellation.check()?;
        let saga = self.resolve::<S>().await?;
        let ctx = ExecutionContext::new(
            saga_id.to_string(),
            S::saga_type(),
            state,
            inbound.message.clone(),
            inbound.correlation_id.clone(),
            inbound.causation_id.clone(),
            cancellation.clone(),
        );
        self.execute(&*saga, stage, handler, ctx, inbound).await
    }

    async fn resolve<S: Saga>(&self) -> Result<Arc<S>, SagaError> {
        let instance = self
            .resolver
            .resolve(SagaType::of::<S>())
            .await
            .map_err(|source| SagaError::Resolution {
                saga_type: S::saga_type().to_string(),
                source,
            })?;
        instance.downcast::<S>().map_err(|_| SagaError::Resolution {
            saga_type: S::saga_type().to_string(),
            source: format!("resolver returned an instance of another type for {}", S::saga_type())
                .into(),
        })
    }

    async fn execute<S: Saga>(
        &self,
        saga: &S,
        stage: Stage,
        handler: HandlerFn<S>,
        mut ctx: ExecutionContext<S::State>,
        inbound: &Inbound,
    ) -> Result<StepOutcome, SagaError> {
        ctx.cancellation().check()?;
        let step = StepInfo {
            saga_type: S::saga_type(),
            saga_id: ctx.saga_id().to_string(),
            message_type: inbound.message_type,
            stage,
            correlation_id: inbound.correlation_id.clone(),
        };

        let result = self
            .pipeline
            .run(&step, handler(saga, &*inbound.message, &mut ctx))
            .await;
        let transition = match result {
            Ok(Some(transition)) => transition,
            Ok(None) => ctx.continue_saga(),
            Err(source) => {
                return Err(SagaError::Handler {
                    saga_type: S::saga_type().to_string(),
                    source,
                });
            }
        };

        let cancellation = ctx.cancellation().clone();
        let state = ctx.into_state();
        self.apply::<S>(step, state, transition, &cancellation).await
    }

    /// Acts on a transition: persist, then publish.
    ///
    /// A `Fail` comes back as an outcome carrying the saga's error, so the
    /// remaining sagas for the same message still run.
    async fn apply<S: Saga>(
        &self,
        step: StepInfo,
        state: S::State,
        transition: Transition,
        cancellation: &Cancellation,
    ) -> Result<StepOutcome, SagaError> {
        let (kind, outgoing, delay, error) = transition.into_parts();
        metrics::counter!(
            "saga_transitions_total",
            "saga_type" => step.saga_type,
            "transition" => kind.as_str()
        )
        .increment(1);

        let Some(status) = SagaStatus::after(kind) else {
            tracing::info!(
                saga_type = step.saga_type,
                saga_id = %step.saga_id,
                delay = ?delay,
                "saga step asked for redelivery"
            );
            let retry = RetryRequest {
                saga: SagaType::of::<S>(),
                saga_type: step.saga_type,
                saga_id: step.saga_id.clone(),
                delay,
                error,
            };
            return Ok(StepOutcome {
                saga_type: step.saga_type,
                saga_id: step.saga_id,
                stage: step.stage,
                kind,
                published: false,
                concurrency_token: None,
                retry: Some(retry),
                failure: None,
            });
        };

        cancellation.check()?;
        let record = SagaRecord {
            saga_type: step.saga_type.to_string(),
            saga_id: step.saga_id.clone(),
            status,
            state: serde_json::to_value(&state)?,
            concurrency_token: state.concurrency_token().map(str::to_string),
            updated_at: Utc::now(),
        };
        let token = self.repository.save_state(record, cancellation).await?;

        // Past this point the state is durable; cancellation no longer applies.
        let published = match outgoing {
            Some(message) => {
                self.publisher
                    .publish(&message, cancellation)
                    .await
                    .map_err(|source| SagaError::Publish {
                        saga_type: step.saga_type.to_string(),
                        saga_id: step.saga_id.clone(),
                        source,
                    })?;
                true
            }
            None => false,
        };

        let failure = match kind {
            TransitionKind::Fail => {
                tracing::warn!(
                    saga_type = step.saga_type,
                    saga_id = %step.saga_id,
                    error = ?error,
                    "saga failed"
                );
                Some(error.unwrap_or_else(|| "saga failed without an error".into()))
            }
            _ => {
                if let Some(err) = &error {
                    tracing::warn!(
                        saga_type = step.saga_type,
                        saga_id = %step.saga_id,
                        error = %err,
                        "saga compensating"
                    );
                }
                if status.is_terminal() {
                    tracing::info!(saga_type = step.saga_type, saga_id = %step.saga_id, "saga completed");
                }
                None
            }
        };

        Ok(StepOutcome {
            saga_type: step.saga_type,
            saga_id: step.saga_id,
            stage: step.stage,
            kind,
            published,
            concurrency_token: Some(token),
            retry: None,
            failure,
        })
    }
}

/// Routes inbound messages to every interested saga and drives them one step.
///
/// Calls for different messages may run concurrently. Conflicting writes to
/// one saga instance are detected through its concurrency token.
pub struct SagaOrchestrator {
    router: Arc<SagaRouter>,
    engine: Engine,
}

impl SagaOrchestrator {
    /// Creates an orchestrator over `router` with an empty pipeline.
    pub fn new(
        router: Arc<SagaRouter>,
        repository: Arc<dyn SagaRepository>,
        publisher: Arc<dyn MessagePublisher>,
        resolver: Arc<dyn SagaResolver>,
    ) -> Self {
        Self {
            router,
            engine: Engine {
                repository,
                publisher,
                resolver,
                pipeline: Pipeline::new(),
                config: OrchestratorConfig::default(),
            },
        }
    }

    /// Adds a middleware inside the ones already added.
    pub fn with_middleware(mut self, middleware: impl StepMiddleware + 'static) -> Self {
        self.engine.pipeline.push(Arc::new(middleware));
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.engine.config = config;
        self
    }

    pub fn router(&self) -> &SagaRouter {
        &self.router
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.engine.config
    }

    /// Handles one inbound message for every saga registered for its type.
    ///
    /// Sagas run in registration order. A saga returning `Fail` does not stop
    /// the others; once all have run, the first failure is returned as
    /// `SagaError::SagaFailed`. Any other error stops the call at that saga,
    /// whose type it names; sagas that ran before it keep their saved state.
    /// Handler errors come back as `SagaError::Handler` with the handler's
    /// error as `source`, unchanged.
    ///
    /// A message no saga reacts to yields an empty report.
    #[tracing::instrument(
        skip_all,
        fields(message_type = %message.message_type(), correlation_id = ?correlation_id)
    )]
    pub async fn handle_message(
        &self,
        message: Arc<dyn Message>,
        correlation_id: Option<String>,
        causation_id: Option<String>,
        cancellation: &Cancellation,
    ) -> Result<HandleReport, SagaError> {
        metrics::counter!("saga_messages_handled_total").increment(1);
        let inbound = Inbound::new(message, correlation_id, causation_id);
        let registrations: Vec<_> = self.router.matching(inbound.message_type).collect();
        self.run(registrations, &inbound, cancellation).await
    }

    /// Handles one inbound message for saga type `saga` only.
    ///
    /// This is the redelivery path for a [`RetryRequest`]. Fails with
    /// `SagaError::NotRegistered` if the router does not know `saga`.
    #[tracing::instrument(
        skip_all,
        fields(saga_type = %saga, message_type = %message.message_type())
    )]
    pub async fn handle_message_for(
        &self,
        saga: SagaType,
        message: Arc<dyn Message>,
        correlation_id: Option<String>,
        causation_id: Option<String>,
        cancellation: &Cancellation,
    ) -> Result<HandleReport, SagaError> {
        metrics::counter!("saga_messages_handled_total").increment(1);
        let registration =
            self.router
                .registration(saga)
                .ok_or_else(|| SagaError::NotRegistered {
                    saga_type: saga.name().to_string(),
                })?;
        let inbound = Inbound::new(message, correlation_id, causation_id);
        self.run(vec![registration], &inbound, cancellation).await
    }

    async fn run(
        &self,
        registrations: Vec<&Arc<dyn RegisteredSaga>>,
        inbound: &Inbound,
        cancellation: &Cancellation,
    ) -> Result<HandleReport, SagaError> {
        let mut outcomes = Vec::with_capacity(registrations.len());
        for registration in registrations {
            if let Some(outcome) = registration
                .dispatch(&self.engine, inbound, cancellation)
                .await?
            {
                outcomes.push(outcome);
            }
        }

        if outcomes.is_empty() {
            tracing::debug!("message is not saga-relevant");
        }

        let mut failed = None;
        for outcome in &mut outcomes {
            let Some(source) = outcome.failure.take() else {
                continue;
            };
            if failed.is_none() {
                failed = Some((outcome.saga_type, outcome.saga_id.clone(), source));
            } else {
                tracing::warn!(
                    saga_type = outcome.saga_type,
                    saga_id = %outcome.saga_id,
                    error = %source,
                    "further saga failed on the same message"
                );
            }
        }
        if let Some((saga_type, saga_id, source)) = failed {
            return Err(SagaError::SagaFailed {
                saga_type: saga_type.to_string(),
                saga_id,
                source,
            });
        }

        Ok(HandleReport {
            message_type: inbound.message_type,
            outcomes,
        })
    }
}

impl std::fmt::Debug for SagaOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaOrchestrator")
            .field("router", &self.router)
            .field("pipeline", &self.engine.pipeline)
            .field("config", &self.engine.config)
            .finish()
    }
}
