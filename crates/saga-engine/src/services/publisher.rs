//! Outgoing message publisher trait and in-memory implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::context::{Cancellation, OutgoingMessage};
use crate::error::BoxError;
use crate::saga::Message;

/// Port for handing outgoing saga messages to the transport.
///
/// Failures propagate out of the step; the engine does not retry locally.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(
        &self,
        message: &OutgoingMessage,
        cancellation: &Cancellation,
    ) -> Result<(), BoxError>;
}

/// In-memory publisher for testing. Records every published message.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMessagePublisher {
    published: Arc<RwLock<Vec<OutgoingMessage>>>,
    fail_on_publish: Arc<AtomicBool>,
}

impl InMemoryMessagePublisher {
    /// Creates a new in-memory publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the publisher to fail every publish call.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Returns every message published so far, oldest first.
    pub async fn published(&self) -> Vec<OutgoingMessage> {
        self.published.read().await.clone()
    }

    /// Returns the number of published messages.
    pub async fn publish_count(&self) -> usize {
        self.published.read().await.len()
    }

    /// Returns the number of published messages of type `M`.
    pub async fn count_of<M: Message>(&self) -> usize {
        self.published
            .read()
            .await
            .iter()
            .filter(|message| message.downcast_ref::<M>().is_some())
            .count()
    }
}

#[async_trait]
impl MessagePublisher for InMemoryMessagePublisher {
    async fn publish(
        &self,
        message: &OutgoingMessage,
        _cancellation: &Cancellation,
    ) -> Result<(), BoxError> {
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err("message broker unavailable".into());
        }
        self.published.write().await.push(message.clone());
        Ok(())
    }
}
