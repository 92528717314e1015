use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use carelog_core::{
    Identity, RemoteError, RemoteId, RemoteRow, RemoteStore, SchemaOperation, SchemaSnapshot,
};

/// Remote store handle that bounds every call with the configured timeout.
///
/// An elapsed timeout is reported as [`RemoteError::Unavailable`]; calls are never retried
/// here.
#[derive(Clone)]
pub struct RemoteClient {
    store: Arc<dyn RemoteStore>,
    timeout: Duration,
}

impl RemoteClient {
    #[must_use]
    pub fn new(store: Arc<dyn RemoteStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        if let Ok(result) = tokio::time::timeout(self.timeout, call).await {
            result
        } else {
            let timeout_ms = self.timeout.as_millis();
            tracing::warn!(operation, timeout_ms, "remote call timed out");
            Err(RemoteError::Unavailable(format!("{operation} timed out after {timeout_ms} ms")))
        }
    }

    /// # Errors
    /// Propagates the store's error, or `Unavailable` on timeout.
    pub async fn insert(&self, table: &str, row: RemoteRow) -> Result<RemoteId, RemoteError> {
        self.bounded("insert", self.store.insert(table, row)).await
    }

    /// # Errors
    /// Propagates the store's error, or `Unavailable` on timeout.
    pub async fn update(
        &self,
        table: &str,
        id: &RemoteId,
        columns: RemoteRow,
    ) -> Result<(), RemoteError> {
        self.bounded("update", self.store.update(table, id, columns)).await
    }

    /// # Errors
    /// Propagates the store's error, or `Unavailable` on timeout.
    pub async fn delete(&self, table: &str, id: &RemoteId) -> Result<(), RemoteError> {
        self.bounded("delete", self.store.delete(table, id)).await
    }

    /// # Errors
    /// Propagates the store's error, or `Unavailable` on timeout.
    pub async fn select_all(
        &self,
        table: &str,
        owner: &Identity,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        self.bounded("select_all", self.store.select_all(table, owner)).await
    }

    /// # Errors
    /// Propagates the store's error, or `Unavailable` on timeout.
    pub async fn exists(&self, table: &str, id: &RemoteId) -> Result<bool, RemoteError> {
        self.bounded("exists", self.store.exists(table, id)).await
    }

    /// # Errors
    /// Propagates the store's error, or `Unavailable` on timeout.
    pub async fn execute_schema_operation(
        &self,
        operation: &SchemaOperation,
    ) -> Result<(), RemoteError> {
        self.bounded("execute_schema_operation", self.store.execute_schema_operation(operation))
            .await
    }

    /// # Errors
    /// Propagates the store's error, or `Unavailable` on timeout.
    pub async fn schema_metadata(&self) -> Result<SchemaSnapshot, RemoteError> {
        self.bounded("schema_metadata", self.store.schema_metadata()).await
    }
}
