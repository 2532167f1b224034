//! Saga orchestration engine.
//!
//! This crate routes inbound messages to long-running, message-driven
//! workflows ("sagas"), persists their state between steps and hands the
//! follow-up messages they emit to a publisher.
//!
//! A message travels through the engine like this:
//! 1. The [`SagaRouter`] finds every registered saga interested in its type
//! 2. Start messages create a fresh state; step and compensate messages
//!    correlate to a saga id and load the stored state
//! 3. The handler runs inside the middleware [`Pipeline`] and returns a
//!    [`Transition`]
//! 4. The [`SagaOrchestrator`] persists the state, then publishes the outgoing
//!    message, if any
//!
//! Storage, publishing and saga construction are ports (see [`services`]).

pub mod config;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod registration;
pub mod router;
pub mod saga;
pub mod services;
pub mod state;
pub mod telemetry;
pub mod validator;

pub use config::OrchestratorConfig;
pub use context::{Cancellation, ExecutionContext, OutgoingMessage, Transition, TransitionKind};
pub use error::{BoxError, Result, SagaError};
pub use orchestrator::{HandleReport, RetryRequest, SagaOrchestrator, StepOutcome};
pub use pipeline::{MetricsMiddleware, Next, Pipeline, StepInfo, StepMiddleware, TracingMiddleware};
pub use registration::{RegistrationBuilder, RegistrationInfo, SagaRegistration, Stage};
pub use router::{SagaModule, SagaRouter};
pub use saga::{
    CompensatesWith, HandlerResult, Handles, Message, MessageType, Saga, SagaState, SagaType,
    StartsWith,
};
pub use services::{
    InMemoryMessagePublisher, InMemorySagaRepository, MessagePublisher, RepositoryError,
    SagaFactories, SagaRecord, SagaRepository, SagaResolver,
};
pub use state::SagaStatus;
pub use validator::Violation;
