use carelog_core::row::{
    format_timestamp, CREATED_AT_COLUMN, IDEMPOTENCY_KEY_COLUMN, IDENTITY_TABLE,
};
use carelog_core::{Identity, RemoteId, RemoteRow, SyncError};
use carelog_store_sqlite::LocalStore;
use serde_json::Value;
use time::OffsetDateTime;

use crate::remote::RemoteClient;

/// Obtains the durable remote identity this device writes under.
pub struct IdentityResolver<'a> {
    local: &'a LocalStore,
    remote: &'a RemoteClient,
}

impl<'a> IdentityResolver<'a> {
    #[must_use]
    pub fn new(local: &'a LocalStore, remote: &'a RemoteClient) -> Self {
        Self { local, remote }
    }

    /// Return the cached identity if it still exists remotely, otherwise register a new one
    /// keyed by the device token and cache it.
    ///
    /// # Errors
    /// Returns [`SyncError::RemoteUnavailable`] when the remote store cannot be reached; no
    /// identity is invented locally.
    #[tracing::instrument(name = "resolve_identity", level = "debug", skip(self))]
    pub async fn resolve(&self) -> Result<Identity, SyncError> {
        if let Some(cached) = self.local.cached_identity()? {
            if self.remote.exists(IDENTITY_TABLE, &RemoteId::from(&cached)).await? {
                tracing::debug!(identity = %cached, "cached identity confirmed");
                return Ok(cached);
            }
            tracing::warn!(identity = %cached, "cached identity no longer exists remotely");
        }

        let token = self.local.device_token()?;
        let mut row = RemoteRow::new();
        row.insert(IDEMPOTENCY_KEY_COLUMN.to_string(), Value::String(token.to_string()));
        row.insert(
            CREATED_AT_COLUMN.to_string(),
            Value::String(format_timestamp(OffsetDateTime::now_utc())?),
        );
        let identity = Identity::from(self.remote.insert(IDENTITY_TABLE, row).await?);
        self.local.store_identity(&identity)?;
        tracing::info!(identity = %identity, "registered remote identity");
        Ok(identity)
    }
}
