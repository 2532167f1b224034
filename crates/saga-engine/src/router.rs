//! Registry of saga registrations, queried by message type.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SagaError;
use crate::registration::{RegisteredSaga, RegistrationInfo, SagaRegistration};
use crate::saga::{MessageType, Saga, SagaType};

/// A group of sagas registered together, e.g. all sagas of one bounded context.
pub trait SagaModule {
    fn register(&self, router: &mut SagaRouter) -> Result<(), SagaError>;
}

impl<F> SagaModule for F
where
    F: Fn(&mut SagaRouter) -> Result<(), SagaError>,
{
    fn register(&self, router: &mut SagaRouter) -> Result<(), SagaError> {
        self(router)
    }
}

/// Owns every saga registration and answers which ones react to a message type.
///
/// Built once at startup, then shared immutably (usually as `Arc<SagaRouter>`).
#[derive(Default)]
pub struct SagaRouter {
    registrations: Vec<Arc<dyn RegisteredSaga>>,
    by_saga: HashMap<TypeId, usize>,
    by_message: HashMap<MessageType, Vec<usize>>,
}

impl SagaRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers saga type `S`.
    ///
    /// Validates `S` first; an invalid saga is not added. Registering the same
    /// type again returns the existing registration.
    pub fn register<S: Saga>(&mut self) -> Result<&RegistrationInfo, SagaError> {
        let saga = TypeId::of::<S>();
        if let Some(&index) = self.by_saga.get(&saga) {
            return Ok(self.registrations[index].info());
        }

        let registration = SagaRegistration::<S>::build()?;
        let index = self.registrations.len();
        for message_type in registration.info().all_message_types() {
            self.by_message.entry(message_type).or_default().push(index);
        }
        self.by_saga.insert(saga, index);
        self.registrations.push(Arc::new(registration));

        tracing::debug!(saga_type = S::saga_type(), "saga registered");
        Ok(self.registrations[index].info())
    }

    /// Registers every saga of a module.
    ///
    /// Stops at and returns the first failing registration.
    pub fn register_module(&mut self, module: impl SagaModule) -> Result<(), SagaError> {
        module.register(self)
    }

    /// Returns every registration that reacts to `message_type`, in registration order.
    ///
    /// An empty result means the message is not saga-relevant.
    pub fn resolve_for_message(&self, message_type: MessageType) -> Vec<&RegistrationInfo> {
        self.matching(message_type)
            .map(|registration| registration.info())
            .collect()
    }

    pub(crate) fn matching(
        &self,
        message_type: MessageType,
    ) -> impl Iterator<Item = &Arc<dyn RegisteredSaga>> + '_ {
        self.by_message
            .get(&message_type)
            .into_iter()
            .flatten()
            .map(|&index| &self.registrations[index])
    }

    pub(crate) fn registration(&self, saga: SagaType) -> Option<&Arc<dyn RegisteredSaga>> {
        self.by_saga
            .get(&saga.id())
            .map(|&index| &self.registrations[index])
    }

    /// Returns true if saga type `S` is registered.
    pub fn contains<S: Saga>(&self) -> bool {
        self.by_saga.contains_key(&TypeId::of::<S>())
    }

    /// Returns every registration in registration order.
    pub fn registrations(&self) -> impl Iterator<Item = &RegistrationInfo> + '_ {
        self.registrations.iter().map(|registration| registration.info())
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl std::fmt::Debug for SagaRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.registrations()).finish()
    }
}
