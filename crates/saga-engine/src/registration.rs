//! Typed registration of a saga's capabilities.
//!
//! A saga type declares what it reacts to in [`Saga::configure`]. The
//! declarations become a dispatch table keyed by [`MessageType`], holding a
//! plain function pointer per handler, plus one correlation strategy per
//! step and compensate message.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture};
use serde::{Deserialize, Serialize};

use crate::context::{Cancellation, ExecutionContext};
use crate::error::{BoxError, SagaError};
use crate::orchestrator::{Engine, Inbound, StepOutcome};
use crate::saga::{CompensatesWith, HandlerResult, Handles, Message, MessageType, Saga, SagaType, StartsWith};
use crate::validator;

/// The role a message type plays for one saga type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Creates a new saga instance.
    Start,
    /// Advances an existing instance.
    Step,
    /// Rolls back an existing instance.
    Compensate,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::Step => "step",
            Stage::Compensate => "compensate",
        }
    }

    /// Returns true if messages of this stage need a correlation strategy.
    pub fn requires_correlation(&self) -> bool {
        !matches!(self, Stage::Start)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Type-erased saga handler, captured at registration time.
pub(crate) type HandlerFn<S> = for<'a> fn(
    &'a S,
    &'a dyn Message,
    &'a mut ExecutionContext<<S as Saga>::State>,
) -> BoxFuture<'a, HandlerResult>;

/// Maps a message to the id of the saga it belongs to.
///
/// Returns None if the message is not of the declared type.
pub(crate) type Correlator = Arc<dyn Fn(&dyn Message) -> Option<String> + Send + Sync>;

#[derive(Debug)]
struct WrongMessageType {
    expected: MessageType,
    actual: MessageType,
}

impl std::fmt::Display for WrongMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected message {}, got {}", self.expected, self.actual)
    }
}

impl std::error::Error for WrongMessageType {}

fn wrong_message<'a, M: Message>(message: &dyn Message) -> BoxFuture<'a, HandlerResult> {
    let err: BoxError = Box::new(WrongMessageType {
        expected: MessageType::of::<M>(),
        actual: message.message_type(),
    });
    Box::pin(future::ready(Err(err)))
}

fn invoke_start<'a, S, M>(
    saga: &'a S,
    message: &'a dyn Message,
    ctx: &'a mut ExecutionContext<S::State>,
) -> BoxFuture<'a, HandlerResult>
where
    S: StartsWith<M>,
    M: Message,
{
    match message.downcast_ref::<M>() {
        Some(message) => <S as StartsWith<M>>::start(saga, message, ctx),
        None => wrong_message::<M>(message),
    }
}

fn invoke_step<'a, S, M>(
    saga: &'a S,
    message: &'a dyn Message,
    ctx: &'a mut ExecutionContext<S::State>,
) -> BoxFuture<'a, HandlerResult>
where
    S: Handles<M>,
    M: Message,
{
    match message.downcast_ref::<M>() {
        Some(message) => <S as Handles<M>>::handle(saga, message, ctx),
        None => wrong_message::<M>(message),
    }
}

fn invoke_compensate<'a, S, M>(
    saga: &'a S,
    message: &'a dyn Message,
    ctx: &'a mut ExecutionContext<S::State>,
) -> BoxFuture<'a, HandlerResult>
where
    S: CompensatesWith<M>,
    M: Message,
{
    match message.downcast_ref::<M>() {
        Some(message) => <S as CompensatesWith<M>>::compensate(saga, message, ctx),
        None => wrong_message::<M>(message),
    }
}

/// One `starts_with` / `handles` / `compensates_with` call.
pub(crate) struct HandlerDeclaration<S: Saga> {
    pub(crate) message_type: MessageType,
    pub(crate) stage: Stage,
    handler: HandlerFn<S>,
}

/// One `correlate` call.
pub(crate) struct CorrelationDeclaration {
    pub(crate) message_type: MessageType,
    correlator: Correlator,
}

/// Collects the capability declarations of saga type `S`.
///
/// Nothing is rejected here; conflicting declarations are kept so the
/// validator can report every one of them.
pub struct RegistrationBuilder<S: Saga> {
    pub(crate) handlers: Vec<HandlerDeclaration<S>>,
    pub(crate) correlations: Vec<CorrelationDeclaration>,
}

impl<S: Saga> RegistrationBuilder<S> {
    pub(crate) fn new() -> Self {
        Self {
            handlers: Vec::new(),
            correlations: Vec::new(),
        }
    }

    fn declare(&mut self, message_type: MessageType, stage: Stage, handler: HandlerFn<S>) {
        self.handlers.push(HandlerDeclaration {
            message_type,
            stage,
            handler,
        });
    }

    /// Declares that a message of type `M` starts a new saga.
    pub fn starts_with<M: Message>(&mut self) -> &mut Self
    where
        S: StartsWith<M>,
    {
        self.declare(MessageType::of::<M>(), Stage::Start, invoke_start::<S, M>);
        self
    }

    /// Declares that a message of type `M` advances an existing saga.
    pub fn handles<M: Message>(&mut self) -> &mut Self
    where
        S: Handles<M>,
    {
        self.declare(MessageType::of::<M>(), Stage::Step, invoke_step::<S, M>);
        self
    }

    /// Declares that a message of type `M` compensates an existing saga.
    pub fn compensates_with<M: Message>(&mut self) -> &mut Self
    where
        S: CompensatesWith<M>,
    {
        self.declare(
            MessageType::of::<M>(),
            Stage::Compensate,
            invoke_compensate::<S, M>,
        );
        self
    }

    /// Declares how a message of type `M` maps to a saga id.
    pub fn correlate<M, F>(&mut self, strategy: F) -> &mut Self
    where
        M: Message,
        F: Fn(&M) -> String + Send + Sync + 'static,
    {
        let correlator: Correlator =
            Arc::new(move |message: &dyn Message| message.downcast_ref::<M>().map(&strategy));
        self.correlations.push(CorrelationDeclaration {
            message_type: MessageType::of::<M>(),
            correlator,
        });
        self
    }
}

/// Immutable description of what one saga type reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationInfo {
    saga: SagaType,
    starts: Vec<MessageType>,
    steps: Vec<MessageType>,
    compensations: Vec<MessageType>,
}

impl RegistrationInfo {
    pub fn saga(&self) -> SagaType {
        self.saga
    }

    pub fn saga_type(&self) -> &'static str {
        self.saga.name()
    }

    /// Message types that start the saga.
    pub fn starts(&self) -> &[MessageType] {
        &self.starts
    }

    /// Message types that advance the saga.
    pub fn steps(&self) -> &[MessageType] {
        &self.steps
    }

    /// Message types that compensate the saga.
    pub fn compensations(&self) -> &[MessageType] {
        &self.compensations
    }

    /// Returns the stage `message_type` plays for this saga, if any.
    pub fn stage_of(&self, message_type: MessageType) -> Option<Stage> {
        if self.starts.contains(&message_type) {
            Some(Stage::Start)
        } else if self.steps.contains(&message_type) {
            Some(Stage::Step)
        } else if self.compensations.contains(&message_type) {
            Some(Stage::Compensate)
        } else {
            None
        }
    }

    /// Returns true if the saga reacts to `message_type` at all.
    pub fn reacts_to(&self, message_type: MessageType) -> bool {
        self.stage_of(message_type).is_some()
    }

    /// Every message type the saga reacts to, deduplicated, in declaration order.
    pub fn all_message_types(&self) -> Vec<MessageType> {
        let mut all = Vec::with_capacity(self.starts.len() + self.steps.len() + self.compensations.len());
        for message_type in self
            .starts
            .iter()
            .chain(&self.steps)
            .chain(&self.compensations)
        {
            if !all.contains(message_type) {
                all.push(*message_type);
            }
        }
        all
    }
}

/// The validated registration of saga type `S`: metadata plus dispatch table.
pub struct SagaRegistration<S: Saga> {
    info: RegistrationInfo,
    handlers: HashMap<MessageType, (Stage, HandlerFn<S>)>,
    correlations: HashMap<MessageType, Correlator>,
}

impl<S: Saga> SagaRegistration<S> {
    /// Collects the declarations of `S`, validates them and builds the registration.
    ///
    /// Fails with a `Configuration` error listing every violation.
    pub fn build() -> Result<Self, SagaError> {
        let mut builder = RegistrationBuilder::<S>::new();
        S::configure(&mut builder);

        let violations = validator::validate(S::saga_type(), &builder);
        if !violations.is_empty() {
            return Err(SagaError::configuration(S::saga_type(), violations));
        }

        let mut info = RegistrationInfo {
            saga: SagaType::of::<S>(),
            starts: Vec::new(),
            steps: Vec::new(),
            compensations: Vec::new(),
        };
        let mut handlers = HashMap::new();
        for declaration in builder.handlers {
            match declaration.stage {
                Stage::Start => info.starts.push(declaration.message_type),
                Stage::Step => info.steps.push(declaration.message_type),
                Stage::Compensate => info.compensations.push(declaration.message_type),
            }
            handlers.insert(
                declaration.message_type,
                (declaration.stage, declaration.handler),
            );
        }
        let correlations = builder
            .correlations
            .into_iter()
            .map(|declaration| (declaration.message_type, declaration.correlator))
            .collect();

        Ok(Self {
            info,
            handlers,
            correlations,
        })
    }

    pub fn info(&self) -> &RegistrationInfo {
        &self.info
    }

    pub(crate) fn handler(&self, message_type: MessageType) -> Option<(Stage, HandlerFn<S>)> {
        self.handlers.get(&message_type).copied()
    }

    /// Computes the saga id a step or compensate message belongs to.
    pub(crate) fn correlate(&self, message: &dyn Message) -> Result<String, SagaError> {
        let message_type = message.message_type();
        self.correlations
            .get(&message_type)
            .and_then(|correlator| correlator(message))
            .ok_or_else(|| {
                SagaError::configuration(
                    S::saga_type(),
                    vec![validator::Violation::MissingCorrelation {
                        message_type,
                        stage: self.info.stage_of(message_type).unwrap_or(Stage::Step),
                    }],
                )
            })
    }
}

/// A registration with its saga type erased, as stored by the router.
pub(crate) trait RegisteredSaga: Send + Sync {
    fn info(&self) -> &RegistrationInfo;

    fn dispatch<'a>(
        &'a self,
        engine: &'a Engine,
        inbound: &'a Inbound,
        cancellation: &'a Cancellation,
    ) -> BoxFuture<'a, Result<Option<StepOutcome>, SagaError>>;
}

impl<S: Saga> RegisteredSaga for SagaRegistration<S> {
    fn info(&self) -> &RegistrationInfo {
        &self.info
    }

    fn dispatch<'a>(
        &'a self,
        engine: &'a Engine,
        inbound: &'a Inbound,
        cancellation: &'a Cancellation,
    ) -> BoxFuture<'a, Result<Option<StepOutcome>, SagaError>> {
        Box::pin(engine.dispatch(self, inbound, cancellation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug)]
    struct OrderPlaced {
        order_id: String,
    }
    impl Message for OrderPlaced {}

    #[derive(Debug)]
    struct PaymentReceived {
        order_id: String,
    }
    impl Message for PaymentReceived {}

    #[derive(Debug)]
    struct PaymentRefused {
        order_id: String,
    }
    impl Message for PaymentRefused {}

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct OrderState {
        order_id: String,
    }

    impl crate::saga::SagaState for OrderState {
        fn concurrency_token(&self) -> Option<&str> {
            None
        }

        fn set_concurrency_token(&mut self, _token: Option<String>) {}
    }

    struct OrderSaga;

    #[async_trait]
    impl Saga for OrderSaga {
        type State = OrderState;

        fn saga_type() -> &'static str {
            "Order"
        }

        fn saga_id(state: &OrderState) -> &str {
            &state.order_id
        }

        fn configure(registration: &mut RegistrationBuilder<Self>) {
            registration
                .starts_with::<OrderPlaced>()
                .handles::<PaymentReceived>()
                .compensates_with::<PaymentRefused>()
                .correlate(|m: &PaymentReceived| m.order_id.clone())
                .correlate(|m: &PaymentRefused| m.order_id.clone());
        }

        async fn on_created(&self, ctx: &mut ExecutionContext<OrderState>) -> Result<(), BoxError> {
            if let Some(placed) = ctx.message().downcast_ref::<OrderPlaced>() {
                let order_id = placed.order_id.clone();
                ctx.state_mut().order_id = order_id;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StartsWith<OrderPlaced> for OrderSaga {
        async fn start(&self, _: &OrderPlaced, _: &mut ExecutionContext<OrderState>) -> HandlerResult {
            Ok(None)
        }
    }

    #[async_trait]
    impl Handles<PaymentReceived> for OrderSaga {
        async fn handle(&self, _: &PaymentReceived, _: &mut ExecutionContext<OrderState>) -> HandlerResult {
            Ok(None)
        }
    }

    #[async_trait]
    impl CompensatesWith<PaymentRefused> for OrderSaga {
        async fn compensate(&self, _: &PaymentRefused, _: &mut ExecutionContext<OrderState>) -> HandlerResult {
            Ok(None)
        }
    }

    #[test]
    fn test_build_records_each_stage() {
        let registration = SagaRegistration::<OrderSaga>::build().unwrap();
        let info = registration.info();

        assert_eq!(info.saga_type(), "Order");
        assert_eq!(info.starts(), &[MessageType::of::<OrderPlaced>()]);
        assert_eq!(info.steps(), &[MessageType::of::<PaymentReceived>()]);
        assert_eq!(info.compensations(), &[MessageType::of::<PaymentRefused>()]);
        assert_eq!(
            info.stage_of(MessageType::of::<PaymentRefused>()),
            Some(Stage::Compensate)
        );
        assert_eq!(info.all_message_types().len(), 3);
    }

    #[test]
    fn test_handler_lookup_matches_stage() {
        let registration = SagaRegistration::<OrderSaga>::build().unwrap();
        let (stage, _) = registration
            .handler(MessageType::of::<PaymentReceived>())
            .unwrap();
        assert_eq!(stage, Stage::Step);

        #[derive(Debug)]
        struct Unrelated;
        impl Message for Unrelated {}
        assert!(registration.handler(MessageType::of::<Unrelated>()).is_none());
        assert!(!registration.info().reacts_to(MessageType::of::<Unrelated>()));
    }

    #[test]
    fn test_correlate_uses_declared_strategy() {
        let registration = SagaRegistration::<OrderSaga>::build().unwrap();
        let message = PaymentReceived {
            order_id: "A".to_string(),
        };
        assert_eq!(registration.correlate(&message).unwrap(), "A");

        let start = OrderPlaced {
            order_id: "A".to_string(),
        };
        let err = registration.correlate(&start).unwrap_err();
        assert!(matches!(err, SagaError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_dispatch_table_invokes_typed_handler() {
        let registration = SagaRegistration::<OrderSaga>::build().unwrap();
        let (_, handler) = registration
            .handler(MessageType::of::<OrderPlaced>())
            .unwrap();
        let message: Arc<dyn Message> = Arc::new(OrderPlaced {
            order_id: "A".to_string(),
        });
        let mut ctx = ExecutionContext::new(
            "A".to_string(),
            "Order",
            OrderState::default(),
            message.clone(),
            None,
            None,
            Cancellation::new(),
        );

        let result = handler(&OrderSaga, &*message, &mut ctx).await.unwrap();
        assert!(result.is_none());

        let wrong = PaymentReceived {
            order_id: "A".to_string(),
        };
        let err = handler(&OrderSaga, &wrong, &mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("expected message OrderPlaced"));
    }
}
