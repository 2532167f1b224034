//! Saga instance resolver trait and a typed factory table.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BoxError;
use crate::saga::{Saga, SagaType};

/// A resolved saga instance, downcast by the engine to its concrete type.
pub type SagaInstance = Arc<dyn Any + Send + Sync>;

/// Port for obtaining saga instances, typically backed by a DI container.
#[async_trait]
pub trait SagaResolver: Send + Sync {
    async fn resolve(&self, saga: SagaType) -> Result<SagaInstance, BoxError>;
}

type Factory = Arc<dyn Fn() -> SagaInstance + Send + Sync>;

/// Resolver backed by one factory per saga type.
#[derive(Clone, Default)]
pub struct SagaFactories {
    factories: HashMap<TypeId, Factory>,
}

impl SagaFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a new `S` with `factory` for every resolution.
    pub fn register<S, F>(&mut self, factory: F) -> &mut Self
    where
        S: Saga,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move || Arc::new(factory()) as SagaInstance);
        self.factories.insert(TypeId::of::<S>(), factory);
        self
    }

    /// Hands out the same shared `S` for every resolution.
    pub fn register_instance<S: Saga>(&mut self, instance: Arc<S>) -> &mut Self {
        let factory: Factory = Arc::new(move || instance.clone() as SagaInstance);
        self.factories.insert(TypeId::of::<S>(), factory);
        self
    }

    pub fn contains(&self, saga: SagaType) -> bool {
        self.factories.contains_key(&saga.id())
    }
}

impl std::fmt::Debug for SagaFactories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaFactories")
            .field("factories", &self.factories.len())
            .finish()
    }
}

#[async_trait]
impl SagaResolver for SagaFactories {
    async fn resolve(&self, saga: SagaType) -> Result<SagaInstance, BoxError> {
        let factory = self
            .factories
            .get(&saga.id())
            .ok_or_else(|| format!("no factory registered for saga {saga}"))?;
        Ok(factory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::registration::RegistrationBuilder;
    use crate::saga::SagaState;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct EmptyState;

    impl SagaState for EmptyState {
        fn concurrency_token(&self) -> Option<&str> {
            None
        }

        fn set_concurrency_token(&mut self, _token: Option<String>) {}
    }

    struct Billing {
        region: &'static str,
    }

    #[async_trait]
    impl Saga for Billing {
        type State = EmptyState;

        fn saga_type() -> &'static str {
            "Billing"
        }

        fn saga_id(_state: &EmptyState) -> &str {
            ""
        }

        fn configure(_registration: &mut RegistrationBuilder<Self>) {}

        async fn on_created(&self, _ctx: &mut ExecutionContext<EmptyState>) -> Result<(), BoxError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_factory_builds_instance() {
        let mut factories = SagaFactories::new();
        factories.register(|| Billing { region: "eu" });
        assert!(factories.contains(SagaType::of::<Billing>()));

        let instance = factories.resolve(SagaType::of::<Billing>()).await.unwrap();
        let billing = instance.downcast::<Billing>().ok().unwrap();
        assert_eq!(billing.region, "eu");
    }

    #[tokio::test]
    async fn test_shared_instance_is_reused() {
        let shared = Arc::new(Billing { region: "us" });
        let mut factories = SagaFactories::new();
        factories.register_instance(shared.clone());

        let first = factories.resolve(SagaType::of::<Billing>()).await.unwrap();
        let first = first.downcast::<Billing>().ok().unwrap();
        assert!(Arc::ptr_eq(&first, &shared));
    }

    #[tokio::test]
    async fn test_unregistered_saga_fails() {
        let factories = SagaFactories::new();
        let err = factories
            .resolve(SagaType::of::<Billing>())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Billing"));
    }
}
