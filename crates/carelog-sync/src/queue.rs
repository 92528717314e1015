use carelog_core::row::{insert_row, update_columns};
use carelog_core::{
    idempotency_key, EntityKind, EntityRecord, Identity, LocalId, MutationEnvelope, MutationOp,
    RemoteError, RemoteId, RowError, SyncError,
};
use carelog_store_sqlite::LocalStore;
use serde::Serialize;
use time::OffsetDateTime;

use crate::remote::RemoteClient;

#[derive(Debug, Clone, Copy, Default, Serialize, Eq, PartialEq)]
pub struct DrainReport {
    /// Entries written to the remote store.
    pub applied: usize,
    /// Updates and deletes whose remote row was already gone.
    pub already_gone: usize,
    /// Entries with nothing left to send, such as a create whose record was bound earlier.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum Pushed {
    Written,
    AlreadyGone,
    NothingToSend,
}

#[derive(Debug)]
pub(crate) enum PushError {
    /// Cannot be sent until its parent profile has a remote id.
    Blocked(String),
    Remote(RemoteError),
    Local(SyncError),
}

impl From<SyncError> for PushError {
    fn from(value: SyncError) -> Self {
        Self::Local(value)
    }
}

impl From<anyhow::Error> for PushError {
    fn from(value: anyhow::Error) -> Self {
        Self::Local(SyncError::Local(value))
    }
}

impl From<RowError> for PushError {
    fn from(value: RowError) -> Self {
        Self::Local(SyncError::Corrupt(value))
    }
}

/// Durable buffer of mutations waiting for the remote store.
pub struct OfflineQueue<'a> {
    local: &'a LocalStore,
    remote: &'a RemoteClient,
    max_attempts_logged: u32,
}

impl<'a> OfflineQueue<'a> {
    #[must_use]
    pub fn new(local: &'a LocalStore, remote: &'a RemoteClient) -> Self {
        Self { local, remote, max_attempts_logged: 5 }
    }

    /// Entries failing at least this many times are logged at error level.
    #[must_use]
    pub fn with_attempt_threshold(mut self, max_attempts_logged: u32) -> Self {
        self.max_attempts_logged = max_attempts_logged;
        self
    }

    /// # Errors
    /// Returns [`SyncError::Local`] when the entry cannot be persisted.
    pub fn enqueue(&self, envelope: &MutationEnvelope) -> Result<i64, SyncError> {
        let seq = self.local.enqueue(envelope)?;
        tracing::debug!(
            seq,
            kind = %envelope.kind,
            op = envelope.op.as_str(),
            local_id = %envelope.local_id,
            "mutation queued"
        );
        Ok(seq)
    }

    /// # Errors
    /// Returns [`SyncError::Local`] when the queue cannot be read.
    pub fn len(&self) -> Result<usize, SyncError> {
        Ok(self.local.queue_len()?)
    }

    /// # Errors
    /// Returns [`SyncError::Local`] when the queue cannot be read.
    pub fn is_empty(&self) -> Result<bool, SyncError> {
        Ok(self.len()? == 0)
    }

    /// Send queued mutations, parents first and in enqueue order within each kind.
    ///
    /// A failing entry holds back the rest of its kind; other kinds continue unless the
    /// remote store is unreachable, which stops the drain.
    ///
    /// # Errors
    /// Returns [`SyncError::DrainIncomplete`] when anything is still queued afterwards, and
    /// [`SyncError::Local`] or [`SyncError::Corrupt`] for local failures.
    #[tracing::instrument(name = "drain", level = "debug", skip_all)]
    pub async fn drain(&self, identity: &Identity) -> Result<DrainReport, SyncError> {
        let mut report = DrainReport::default();
        let mut last_error = None;
        let mut unreachable = false;

        'kinds: for kind in EntityKind::ALL {
            for entry in self.local.queued_for_kind(kind)? {
                match self.push(&entry.envelope(), identity).await {
                    Ok(pushed) => {
                        self.local.acknowledge(entry.seq)?;
                        match pushed {
                            Pushed::Written => report.applied += 1,
                            Pushed::AlreadyGone => report.already_gone += 1,
                            Pushed::NothingToSend => report.skipped += 1,
                        }
                    }
                    Err(PushError::Blocked(reason)) => {
                        tracing::debug!(
                            seq = entry.seq,
                            kind = %kind,
                            reason = %reason,
                            "holding back queued mutation"
                        );
                        last_error = Some(reason);
                        continue 'kinds;
                    }
                    Err(PushError::Remote(err)) => {
                        let attempts =
                            self.local.record_attempt_failure(entry.seq, &err.to_string())?;
                        if attempts >= self.max_attempts_logged {
                            tracing::error!(
                                seq = entry.seq,
                                kind = %kind,
                                attempts,
                                error = %err,
                                "queued mutation keeps failing"
                            );
                        } else {
                            tracing::warn!(
                                seq = entry.seq,
                                kind = %kind,
                                attempts,
                                error = %err,
                                "queued mutation failed"
                            );
                        }
                        unreachable = err.is_unavailable();
                        last_error = Some(err.to_string());
                        if unreachable {
                            break 'kinds;
                        }
                        continue 'kinds;
                    }
                    Err(PushError::Local(err)) => return Err(err),
                }
            }
        }

        let remaining = self.local.queue_len()?;
        if remaining > 0 {
            tracing::info!(applied = report.applied, remaining, "offline queue drain incomplete");
            return Err(SyncError::DrainIncomplete {
                applied: report.applied,
                remaining,
                last_error,
                unreachable,
            });
        }
        tracing::info!(applied = report.applied, "offline queue drained");
        Ok(report)
    }

    /// Write one mutation to the remote store.
    pub(crate) async fn push(
        &self,
        envelope: &MutationEnvelope,
        identity: &Identity,
    ) -> Result<Pushed, PushError> {
        match envelope.op {
            MutationOp::Create => self.push_create(envelope, identity).await,
            MutationOp::Update => self.push_update(envelope).await,
            MutationOp::Delete => self.push_delete(envelope).await,
        }
    }

    async fn push_create(
        &self,
        envelope: &MutationEnvelope,
        identity: &Identity,
    ) -> Result<Pushed, PushError> {
        let Some(current) = self.local.record(&envelope.local_id)? else {
            tracing::debug!(
                local_id = %envelope.local_id,
                "record deleted before its create was sent"
            );
            return Ok(Pushed::NothingToSend);
        };
        if current.header.remote_id.is_some() {
            return Ok(Pushed::NothingToSend);
        }

        let body = envelope.payload.clone().unwrap_or_else(|| current.body.clone());
        let parent_remote = self.parent_remote_id(body.parent())?;
        let record = EntityRecord { header: current.header, body };
        let key = idempotency_key(envelope.kind, &envelope.local_id, identity);
        let row = insert_row(&record, identity, &key, parent_remote.as_ref())?;

        let remote_id =
            self.remote.insert(envelope.kind.table(), row).await.map_err(PushError::Remote)?;
        self.local.bind_remote(&envelope.local_id, &remote_id, identity)?;
        Ok(Pushed::Written)
    }

    async fn push_update(&self, envelope: &MutationEnvelope) -> Result<Pushed, PushError> {
        let remote_id = match &envelope.remote_id {
            Some(remote_id) => remote_id.clone(),
            None => match self.local.record(&envelope.local_id)? {
                None => return Ok(Pushed::NothingToSend),
                Some(record) => record.header.remote_id.ok_or_else(|| {
                    PushError::Blocked(format!(
                        "{} {} has not reached the remote store yet",
                        envelope.kind, envelope.local_id
                    ))
                })?,
            },
        };

        let body = envelope.payload.as_ref().ok_or_else(|| {
            PushError::Local(SyncError::Corrupt(RowError::Malformed(format!(
                "queued update of {} carries no body",
                envelope.local_id
            ))))
        })?;
        let parent_remote = self.parent_remote_id(body.parent())?;
        let columns = update_columns(body, parent_remote.as_ref(), OffsetDateTime::now_utc())?;

        match self.remote.update(envelope.kind.table(), &remote_id, columns).await {
            Ok(()) => Ok(Pushed::Written),
            Err(RemoteError::NotFound { .. }) => {
                tracing::debug!(remote_id = %remote_id, "updated row already deleted remotely");
                Ok(Pushed::AlreadyGone)
            }
            Err(err) => Err(PushError::Remote(err)),
        }
    }

    async fn push_delete(&self, envelope: &MutationEnvelope) -> Result<Pushed, PushError> {
        let Some(remote_id) = &envelope.remote_id else {
            return Ok(Pushed::NothingToSend);
        };
        match self.remote.delete(envelope.kind.table(), remote_id).await {
            Ok(()) => Ok(Pushed::Written),
            Err(RemoteError::NotFound { .. }) => Ok(Pushed::AlreadyGone),
            Err(err) => Err(PushError::Remote(err)),
        }
    }

    fn parent_remote_id(&self, parent: Option<&LocalId>) -> Result<Option<RemoteId>, PushError> {
        let Some(parent) = parent else {
            return Ok(None);
        };
        let remote_id = self
            .local
            .record(parent)?
            .filter(|record| record.kind() == EntityKind::ChildProfile)
            .and_then(|record| record.header.remote_id);
        match remote_id {
            Some(remote_id) => Ok(Some(remote_id)),
            None => Err(PushError::Blocked(format!(
                "parent profile {parent} has no remote id yet"
            ))),
        }
    }
}
