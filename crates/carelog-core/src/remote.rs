use async_trait::async_trait;

use crate::error::RemoteError;
use crate::ids::{Identity, RemoteId};
use crate::row::RemoteRow;
use crate::schema::{SchemaOperation, SchemaSnapshot};

/// Client contract for the shared remote store.
///
/// Implementations must treat `insert` as keyed by the row's `idempotency_key` column:
/// a second insert carrying a key already seen returns the id assigned the first time and
/// writes nothing.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn insert(&self, table: &str, row: RemoteRow) -> Result<RemoteId, RemoteError>;

    /// Overwrite the given columns of an existing row.
    ///
    /// # Errors
    /// [`RemoteError::NotFound`] when no row has that id.
    async fn update(&self, table: &str, id: &RemoteId, columns: RemoteRow)
        -> Result<(), RemoteError>;

    /// Delete a row; dependents referencing it are removed by the store.
    ///
    /// # Errors
    /// [`RemoteError::NotFound`] when no row has that id.
    async fn delete(&self, table: &str, id: &RemoteId) -> Result<(), RemoteError>;

    async fn select_all(&self, table: &str, owner: &Identity)
        -> Result<Vec<RemoteRow>, RemoteError>;

    async fn exists(&self, table: &str, id: &RemoteId) -> Result<bool, RemoteError>;

    async fn execute_schema_operation(&self, operation: &SchemaOperation)
        -> Result<(), RemoteError>;

    async fn schema_metadata(&self) -> Result<SchemaSnapshot, RemoteError>;
}
