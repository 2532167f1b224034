//! Saga error types.

use thiserror::Error;

use crate::services::RepositoryError;
use crate::state::SagaStatus;
use crate::validator::Violation;

/// Boxed error raised by saga handlers and external ports.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while registering sagas or handling messages.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A saga type is structurally invalid.
    ///
    /// Lists every violation found, not only the first.
    #[error("Invalid saga configuration for {saga_type}: {}", join_violations(.violations))]
    Configuration {
        saga_type: String,
        violations: Vec<Violation>,
    },

    /// A step or compensate message correlated to a saga that was never started.
    #[error("Saga not found: {saga_type}/{saga_id}")]
    SagaNotFound { saga_type: String, saga_id: String },

    /// The stored state changed between load and save.
    ///
    /// Retrying the whole message reloads fresh state.
    #[error("Concurrency conflict for saga {saga_type}/{saga_id}")]
    Concurrency { saga_type: String, saga_id: String },

    /// A message correlated to a saga that already completed or failed.
    #[error("Saga {saga_type}/{saga_id} is {status} and accepts no further messages")]
    SagaTerminated {
        saga_type: String,
        saga_id: String,
        status: SagaStatus,
    },

    /// The saga returned a `Fail` transition.
    #[error("Saga {saga_type}/{saga_id} failed: {source}")]
    SagaFailed {
        saga_type: String,
        saga_id: String,
        #[source]
        source: BoxError,
    },

    /// A saga handler, creation hook or middleware returned an error.
    #[error("Handler error in saga {saga_type}: {source}")]
    Handler {
        saga_type: String,
        #[source]
        source: BoxError,
    },

    /// The instance resolver could not provide a saga instance.
    #[error("Could not resolve saga {saga_type}: {source}")]
    Resolution {
        saga_type: String,
        #[source]
        source: BoxError,
    },

    /// Publishing an outgoing message failed after the state was saved.
    #[error("Failed to publish message from saga {saga_type}/{saga_id}: {source}")]
    Publish {
        saga_type: String,
        saga_id: String,
        #[source]
        source: BoxError,
    },

    /// A targeted redelivery named a saga type the router does not know.
    #[error("Saga {saga_type} is not registered")]
    NotRegistered { saga_type: String },

    /// The saga repository failed for a reason other than a stale token.
    #[error("Repository error: {0}")]
    Repository(#[source] BoxError),

    /// Saga state could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The caller cancelled the operation before state was persisted.
    #[error("Operation cancelled")]
    Cancelled,
}

impl SagaError {
    /// Creates a configuration error for a saga type.
    pub fn configuration(saga_type: impl Into<String>, violations: Vec<Violation>) -> Self {
        Self::Configuration {
            saga_type: saga_type.into(),
            violations,
        }
    }

    /// Returns true if retrying the whole message may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SagaError::Concurrency { .. })
    }

    /// Returns the saga type the error belongs to, if it is tied to one.
    pub fn saga_type(&self) -> Option<&str> {
        match self {
            SagaError::Configuration { saga_type, .. }
            | SagaError::SagaNotFound { saga_type, .. }
            | SagaError::Concurrency { saga_type, .. }
            | SagaError::SagaTerminated { saga_type, .. }
            | SagaError::SagaFailed { saga_type, .. }
            | SagaError::Handler { saga_type, .. }
            | SagaError::Resolution { saga_type, .. }
            | SagaError::Publish { saga_type, .. }
            | SagaError::NotRegistered { saga_type } => Some(saga_type),
            SagaError::Repository(_) | SagaError::Serialization(_) | SagaError::Cancelled => None,
        }
    }

    /// Returns the violations of a configuration error.
    pub fn violations(&self) -> &[Violation] {
        match self {
            SagaError::Configuration { violations, .. } => violations,
            _ => &[],
        }
    }
}

impl From<RepositoryError> for SagaError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Concurrency {
                saga_type, saga_id, ..
            } => SagaError::Concurrency { saga_type, saga_id },
            RepositoryError::Backend(source) => SagaError::Repository(source),
        }
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
