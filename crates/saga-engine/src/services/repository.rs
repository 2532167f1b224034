//! Saga state repository trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::context::Cancellation;
use crate::error::BoxError;
use crate::state::SagaStatus;

/// A persisted saga instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub saga_type: String,
    pub saga_id: String,
    pub status: SagaStatus,
    /// The serialized saga state.
    pub state: serde_json::Value,
    /// On load: the token of the stored version.
    /// On save: the token the caller expects to overwrite; None for a new saga.
    pub concurrency_token: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Errors returned by saga repositories.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The stored version no longer matches the token the state was loaded with.
    #[error(
        "Stale state for saga {saga_type}/{saga_id}: expected token {expected:?}, found {actual:?}"
    )]
    Concurrency {
        saga_type: String,
        saga_id: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// The storage backend failed.
    #[error("Repository backend error: {0}")]
    Backend(#[source] BoxError),
}

/// Port for loading and saving saga state.
///
/// Implementations must give read-your-writes consistency per saga id and
/// reject a save whose concurrency token is stale.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Loads the record of a saga instance.
    ///
    /// Returns None if the saga was never saved.
    async fn load_state(
        &self,
        saga_type: &str,
        saga_id: &str,
        cancellation: &Cancellation,
    ) -> Result<Option<SagaRecord>, RepositoryError>;

    /// Saves a record if its concurrency token matches the stored one.
    ///
    /// Returns the token of the newly stored version.
    async fn save_state(
        &self,
        record: SagaRecord,
        cancellation: &Cancellation,
    ) -> Result<String, RepositoryError>;
}

type RecordKey = (String, String);

/// In-memory saga repository for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemorySagaRepository {
    records: Arc<RwLock<HashMap<RecordKey, SagaRecord>>>,
    saves: Arc<AtomicUsize>,
    fail_on_save: Arc<AtomicBool>,
}

impl InMemorySagaRepository {
    /// Creates a new empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored record of a saga, if any.
    pub async fn get(&self, saga_type: &str, saga_id: &str) -> Option<SagaRecord> {
        let key = (saga_type.to_string(), saga_id.to_string());
        self.records.read().await.get(&key).cloned()
    }

    /// Returns the number of stored saga instances.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Returns the number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Configures the repository to fail every save.
    pub fn set_fail_on_save(&self, fail: bool) {
        self.fail_on_save.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    #[tracing::instrument(skip(self, _cancellation))]
    async fn load_state(
        &self,
        saga_type: &str,
        saga_id: &str,
        _cancellation: &Cancellation,
    ) -> Result<Option<SagaRecord>, RepositoryError> {
        Ok(self.get(saga_type, saga_id).await)
    }

    #[tracing::instrument(
        skip(self, record, _cancellation),
        fields(saga_type = %record.saga_type, saga_id = %record.saga_id)
    )]
    async fn save_state(
        &self,
        mut record: SagaRecord,
        _cancellation: &Cancellation,
    ) -> Result<String, RepositoryError> {
        if self.fail_on_save.load(Ordering::SeqCst) {
            return Err(RepositoryError::Backend("saga store unavailable".into()));
        }

        let key = (record.saga_type.clone(), record.saga_id.clone());
        let mut records = self.records.write().await;

        let actual = records
            .get(&key)
            .map(|stored| stored.concurrency_token.clone());
        // A missing record only accepts a save without a token, a stored one
        // only accepts its own token.
        let accepted = match &actual {
            None => record.concurrency_token.is_none(),
            Some(stored) => stored.is_some() && *stored == record.concurrency_token,
        };
        if !accepted {
            return Err(RepositoryError::Concurrency {
                saga_type: record.saga_type,
                saga_id: record.saga_id,
                expected: record.concurrency_token,
                actual: actual.flatten(),
            });
        }

        let token = Uuid::new_v4().to_string();
        record.concurrency_token = Some(token.clone());
        records.insert(key, record);
        self.saves.fetch_add(1, Ordering::SeqCst);

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(saga_id: &str, token: Option<String>, counter: u32) -> SagaRecord {
        SagaRecord {
            saga_type: "Order".to_string(),
            saga_id: saga_id.to_string(),
            status: SagaStatus::Active,
            state: serde_json::json!({ "counter": counter }),
            concurrency_token: token,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let repository = InMemorySagaRepository::new();
        let cancellation = Cancellation::new();

        let token = repository
            .save_state(record("A", None, 1), &cancellation)
            .await
            .unwrap();

        let loaded = repository
            .load_state("Order", "A", &cancellation)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.state["counter"], 1);
        assert_eq!(loaded.concurrency_token, Some(token));
        assert_eq!(repository.save_count(), 1);
        assert_eq!(repository.len().await, 1);
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let repository = InMemorySagaRepository::new();
        let loaded = repository
            .load_state("Order", "missing", &Cancellation::new())
            .await
            .unwrap();
        assert!(loaded.is_none());
        assert!(repository.is_empty().await);
    }

    #[tokio::test]
    async fn test_stale_token_is_rejected() {
        let repository = InMemorySagaRepository::new();
        let cancellation = Cancellation::new();

        let first = repository
            .save_state(record("A", None, 1), &cancellation)
            .await
            .unwrap();
        repository
            .save_state(record("A", Some(first.clone()), 2), &cancellation)
            .await
            .unwrap();

        let err = repository
            .save_state(record("A", Some(first), 3), &cancellation)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Concurrency { .. }));

        let stored = repository.get("Order", "A").await.unwrap();
        assert_eq!(stored.state["counter"], 2);
        assert_eq!(repository.save_count(), 2);
    }

    #[tokio::test]
    async fn test_second_create_is_rejected() {
        let repository = InMemorySagaRepository::new();
        let cancellation = Cancellation::new();

        repository
            .save_state(record("A", None, 1), &cancellation)
            .await
            .unwrap();
        let err = repository
            .save_state(record("A", None, 1), &cancellation)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Concurrency { .. }));
    }

    #[tokio::test]
    async fn test_token_for_missing_record_is_rejected() {
        let repository = InMemorySagaRepository::new();
        let err = repository
            .save_state(
                record("A", Some("gone".to_string()), 1),
                &Cancellation::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::Concurrency { actual: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_fail_on_save() {
        let repository = InMemorySagaRepository::new();
        repository.set_fail_on_save(true);

        let err = repository
            .save_state(record("A", None, 1), &Cancellation::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Backend(_)));
        assert_eq!(repository.save_count(), 0);
    }
}
