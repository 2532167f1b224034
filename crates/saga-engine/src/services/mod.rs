//! External ports consumed by the orchestrator and their in-memory implementations.

pub mod publisher;
pub mod repository;
pub mod resolver;

pub use publisher::{InMemoryMessagePublisher, MessagePublisher};
pub use repository::{InMemorySagaRepository, RepositoryError, SagaRecord, SagaRepository};
pub use resolver::{SagaFactories, SagaInstance, SagaResolver};
