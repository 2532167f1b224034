//! The contract every saga type and its state satisfy.

use std::any::{Any, TypeId};
use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::context::{ExecutionContext, Transition};
use crate::error::BoxError;
use crate::registration::RegistrationBuilder;

/// Result returned by saga step handlers.
///
/// `Ok(None)` continues the saga without an outgoing message.
pub type HandlerResult = std::result::Result<Option<Transition>, BoxError>;

/// A message that can be routed to sagas or published by them.
///
/// Opt in with an empty impl:
/// ```ignore
/// #[derive(Debug)]
/// struct OrderPlaced { order_id: String }
/// impl Message for OrderPlaced {}
/// ```
pub trait Message: AnyMessage + Debug + Send + Sync + 'static {}

/// Object-safe access to the concrete type behind a `dyn Message`.
pub trait AnyMessage {
    fn as_any_message(&self) -> &dyn Any;
    fn message_type_name(&self) -> &'static str;
}

impl<T: Any> AnyMessage for T {
    fn as_any_message(&self) -> &dyn Any {
        self
    }

    fn message_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

impl dyn Message {
    /// Returns the routing key of this message.
    pub fn message_type(&self) -> MessageType {
        let any = <dyn Message as AnyMessage>::as_any_message(self);
        MessageType {
            id: any.type_id(),
            name: <dyn Message as AnyMessage>::message_type_name(self),
        }
    }

    /// Returns the message as `M` if that is its concrete type.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        <dyn Message as AnyMessage>::as_any_message(self).downcast_ref::<M>()
    }

    /// Returns true if the message is an `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.downcast_ref::<M>().is_some()
    }
}

/// Routing key for a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    id: TypeId,
    name: &'static str,
}

impl MessageType {
    /// Returns the key for message type `M`.
    pub fn of<M: Message>() -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: std::any::type_name::<M>(),
        }
    }

    /// Returns the fully qualified type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the type name without its module path.
    pub fn short_name(&self) -> &'static str {
        match self.name.split('<').next() {
            Some(head) => {
                let start = head.rfind("::").map(|i| i + 2).unwrap_or(0);
                &self.name[start..]
            }
            None => self.name,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

/// Identifies a saga type to the instance resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SagaType {
    id: TypeId,
    name: &'static str,
}

impl SagaType {
    /// Returns the key for saga type `S`.
    pub fn of<S: Saga>() -> Self {
        Self {
            id: TypeId::of::<S>(),
            name: S::saga_type(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Returns the saga type name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Display for SagaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Durable data of one saga instance.
///
/// The state is persisted as JSON after every step. The concurrency token is
/// filled in by the engine on load and checked by the repository on save, so
/// implementations usually keep it out of the serialized form:
/// ```ignore
/// #[serde(skip)]
/// token: Option<String>,
/// ```
pub trait SagaState: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Returns the token of the stored version this state was loaded from.
    fn concurrency_token(&self) -> Option<&str>;

    /// Sets the concurrency token.
    fn set_concurrency_token(&mut self, token: Option<String>);
}

/// A saga type: stateless business logic over a [`SagaState`].
///
/// Capabilities are declared in [`Saga::configure`] and backed by the
/// [`StartsWith`], [`Handles`] and [`CompensatesWith`] traits.
#[async_trait]
pub trait Saga: Send + Sync + Sized + 'static {
    /// The durable state of this saga.
    type State: SagaState;

    /// Returns the saga type name.
    ///
    /// Used as the persistence namespace, so it must be stable.
    fn saga_type() -> &'static str;

    /// Returns the saga id stored in the state.
    ///
    /// Empty until the creation hook has run.
    fn saga_id(state: &Self::State) -> &str;

    /// Declares the messages this saga starts with, handles and compensates with.
    fn configure(registration: &mut RegistrationBuilder<Self>);

    /// Populates a fresh state before the start handler runs.
    ///
    /// Runs once per instance, only for start messages. Must leave
    /// [`Saga::saga_id`] non-empty.
    async fn on_created(&self, ctx: &mut ExecutionContext<Self::State>) -> Result<(), BoxError>;
}

/// Capability: a message of type `M` starts a new saga instance.
#[async_trait]
pub trait StartsWith<M: Message>: Saga {
    async fn start(&self, message: &M, ctx: &mut ExecutionContext<Self::State>) -> HandlerResult;
}

/// Capability: a message of type `M` advances an existing saga instance.
///
/// Requires a correlation strategy for `M`.
#[async_trait]
pub trait Handles<M: Message>: Saga {
    async fn handle(&self, message: &M, ctx: &mut ExecutionContext<Self::State>) -> HandlerResult;
}

/// Capability: a message of type `M` compensates an existing saga instance.
///
/// Requires a correlation strategy for `M`.
#[async_trait]
pub trait CompensatesWith<M: Message>: Saga {
    async fn compensate(
        &self,
        message: &M,
        ctx: &mut ExecutionContext<Self::State>,
    ) -> HandlerResult;
}
