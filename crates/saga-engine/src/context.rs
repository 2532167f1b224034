//! Execution context passed to saga handlers and the transitions they return.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{BoxError, SagaError};
use crate::saga::{Message, MessageType};

/// Cooperative cancellation signal supplied by the caller.
///
/// Clones share the same signal.
#[derive(Debug, Clone)]
pub struct Cancellation {
    sender: Arc<watch::Sender<bool>>,
}

impl Cancellation {
    /// Creates a signal that has not been cancelled.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Cancels the signal for every clone.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Returns true if the signal was cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Returns `Err(SagaError::Cancelled)` once the signal was cancelled.
    pub fn check(&self) -> Result<(), SagaError> {
        if self.is_cancelled() {
            Err(SagaError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Waits until the signal is cancelled.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so this only returns once cancelled.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// What a transition instructs the orchestrator to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionKind {
    /// Persist state and keep the saga active.
    Continue,
    /// Persist state and terminate the saga successfully.
    Complete,
    /// Leave state untouched and ask the transport to redeliver the message.
    Retry,
    /// Persist state and roll back; the saga stays active.
    Compensate,
    /// Persist state and terminate the saga as failed.
    Fail,
}

impl TransitionKind {
    /// Returns true for `Complete` and `Fail`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransitionKind::Complete | TransitionKind::Fail)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Continue => "continue",
            TransitionKind::Complete => "complete",
            TransitionKind::Retry => "retry",
            TransitionKind::Compensate => "compensate",
            TransitionKind::Fail => "fail",
        }
    }
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A message emitted by a saga step, addressed to the publisher.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    message: Arc<dyn Message>,
    saga_type: &'static str,
    saga_id: String,
    correlation_id: Option<String>,
    causation_id: Option<String>,
}

impl OutgoingMessage {
    pub fn message(&self) -> &dyn Message {
        &*self.message
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    /// Returns the message as `M` if that is its concrete type.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.message.downcast_ref::<M>()
    }

    /// Returns the type of the saga that emitted the message.
    pub fn saga_type(&self) -> &'static str {
        self.saga_type
    }

    /// Returns the id of the saga that emitted the message.
    pub fn saga_id(&self) -> &str {
        &self.saga_id
    }

    /// Returns the business correlation id of the triggering message.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Returns the causation id of the triggering message.
    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }
}

/// The immutable outcome of one saga step.
///
/// Only an [`ExecutionContext`] can build one, so every transition carries
/// exactly the fields its kind allows.
#[derive(Debug)]
pub struct Transition {
    kind: TransitionKind,
    outgoing: Option<OutgoingMessage>,
    delay: Option<Duration>,
    error: Option<BoxError>,
}

impl Transition {
    fn new(kind: TransitionKind) -> Self {
        Self {
            kind,
            outgoing: None,
            delay: None,
            error: None,
        }
    }

    pub fn kind(&self) -> TransitionKind {
        self.kind
    }

    pub fn outgoing(&self) -> Option<&OutgoingMessage> {
        self.outgoing.as_ref()
    }

    /// Returns the redelivery delay of a `Retry`.
    ///
    /// None means retry immediately, subject to the transport's backoff.
    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    /// Returns the error attached to a `Retry`, `Compensate` or `Fail`.
    ///
    /// A `Compensate` without an error is a voluntary rollback.
    pub fn error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.error.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        TransitionKind,
        Option<OutgoingMessage>,
        Option<Duration>,
        Option<BoxError>,
    ) {
        (self.kind, self.outgoing, self.delay, self.error)
    }
}

/// Everything a saga handler gets to see for one invocation.
///
/// The context owns the saga state for the duration of the step; handlers
/// mutate it through [`ExecutionContext::state_mut`].
#[derive(Debug)]
pub struct ExecutionContext<St> {
    saga_id: String,
    saga_type: &'static str,
    state: St,
    message: Arc<dyn Message>,
    correlation_id: Option<String>,
    causation_id: Option<String>,
    cancellation: Cancellation,
}

impl<St> ExecutionContext<St> {
    pub(crate) fn new(
        saga_id: String,
        saga_type: &'static str,
        state: St,
        message: Arc<dyn Message>,
        correlation_id: Option<String>,
        causation_id: Option<String>,
        cancellation: Cancellation,
    ) -> Self {
        Self {
            saga_id,
            saga_type,
            state,
            message,
            correlation_id,
            causation_id,
            cancellation,
        }
    }

    /// Rebinds the context to the saga id derived after the creation hook.
    pub(crate) fn with_saga_id(mut self, saga_id: String) -> Self {
        self.saga_id = saga_id;
        self
    }

    pub(crate) fn into_state(self) -> St {
        self.state
    }

    /// Returns the saga id. Empty while the creation hook runs.
    pub fn saga_id(&self) -> &str {
        &self.saga_id
    }

    pub fn saga_type(&self) -> &'static str {
        self.saga_type
    }

    pub fn state(&self) -> &St {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut St {
        &mut self.state
    }

    /// Returns the message that triggered this step.
    pub fn message(&self) -> &dyn Message {
        &*self.message
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    fn outgoing(&self, message: impl Message) -> OutgoingMessage {
        OutgoingMessage {
            message: Arc::new(message),
            saga_type: self.saga_type,
            saga_id: self.saga_id.clone(),
            correlation_id: self.correlation_id.clone(),
            causation_id: self.causation_id.clone(),
        }
    }

    /// Keeps the saga active without sending anything.
    pub fn continue_saga(&self) -> Transition {
        Transition::new(TransitionKind::Continue)
    }

    /// Keeps the saga active and sends `message`.
    pub fn continue_with(&self, message: impl Message) -> Transition {
        Transition {
            outgoing: Some(self.outgoing(message)),
            ..Transition::new(TransitionKind::Continue)
        }
    }

    /// Terminates the saga successfully.
    pub fn complete(&self) -> Transition {
        Transition::new(TransitionKind::Complete)
    }

    /// Terminates the saga successfully and sends `message`.
    pub fn complete_with(&self, message: impl Message) -> Transition {
        Transition {
            outgoing: Some(self.outgoing(message)),
            ..Transition::new(TransitionKind::Complete)
        }
    }

    /// Asks for the triggering message to be redelivered after `delay`.
    ///
    /// State changes made by the handler are discarded.
    pub fn retry(&self, delay: Option<Duration>, error: Option<BoxError>) -> Transition {
        Transition {
            delay,
            error,
            ..Transition::new(TransitionKind::Retry)
        }
    }

    /// Rolls back without sending anything.
    pub fn compensate(&self, error: Option<BoxError>) -> Transition {
        Transition {
            error,
            ..Transition::new(TransitionKind::Compensate)
        }
    }

    /// Rolls back and sends the compensating `message`.
    pub fn compensate_with(&self, message: impl Message, error: Option<BoxError>) -> Transition {
        Transition {
            outgoing: Some(self.outgoing(message)),
            error,
            ..Transition::new(TransitionKind::Compensate)
        }
    }

    /// Terminates the saga as failed.
    pub fn fail(&self, error: impl Into<BoxError>) -> Transition {
        Transition {
            error: Some(error.into()),
            ..Transition::new(TransitionKind::Fail)
        }
    }

    /// Terminates the saga as failed and sends `message`.
    pub fn fail_with(&self, message: impl Message, error: impl Into<BoxError>) -> Transition {
        Transition {
            outgoing: Some(self.outgoing(message)),
            error: Some(error.into()),
            ..Transition::new(TransitionKind::Fail)
        }
    }
}
