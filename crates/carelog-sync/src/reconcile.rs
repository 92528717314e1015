use std::collections::BTreeMap;

use carelog_core::row::{record_from_row, row_id, row_parent};
use carelog_core::{EntityKind, EntityRecord, Identity, LocalId, LocalSnapshot, RemoteId, SyncError};
use carelog_store_sqlite::LocalStore;
use serde::Serialize;

use crate::queue::{DrainReport, OfflineQueue};
use crate::remote::RemoteClient;

#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct ReconcileReport {
    pub drained: DrainReport,
    /// Records in the local snapshot after the pull.
    pub snapshot_records: usize,
    /// Pulled dependents whose parent profile was not among the pulled rows.
    pub skipped_orphans: usize,
}

/// Brings the local snapshot in line with the remote store: queued writes first, then a
/// whole-snapshot pull.
pub struct SyncReconciler<'a> {
    local: &'a LocalStore,
    remote: &'a RemoteClient,
    max_attempts_logged: u32,
}

impl<'a> SyncReconciler<'a> {
    #[must_use]
    pub fn new(local: &'a LocalStore, remote: &'a RemoteClient) -> Self {
        Self { local, remote, max_attempts_logged: 5 }
    }

    #[must_use]
    pub fn with_attempt_threshold(mut self, max_attempts_logged: u32) -> Self {
        self.max_attempts_logged = max_attempts_logged;
        self
    }

    /// Drain the offline queue, then pull. The pull only runs once every queued write
    /// has been acknowledged.
    ///
    /// # Errors
    /// Returns the drain's error when anything stays queued (local state is kept), or the
    /// pull's error.
    #[tracing::instrument(name = "reconcile", level = "debug", skip_all)]
    pub async fn reconcile(&self, identity: &Identity) -> Result<ReconcileReport, SyncError> {
        let drained = OfflineQueue::new(self.local, self.remote)
            .with_attempt_threshold(self.max_attempts_logged)
            .drain(identity)
            .await
            .inspect_err(|err| tracing::info!(error = %err, "skipping pull; queue not drained"))?;

        let (snapshot, skipped_orphans) = self.pull(identity).await?;
        Ok(ReconcileReport { drained, snapshot_records: snapshot.len(), skipped_orphans })
    }

    /// Replace the local snapshot with every remote row owned by `identity`.
    ///
    /// Records already known by remote id keep their local id. Last writer wins for the
    /// whole snapshot.
    ///
    /// # Errors
    /// Returns [`SyncError::QueueNotEmpty`] while local writes are still queued, and the
    /// remote or local failure otherwise. The previous snapshot survives any failure.
    #[tracing::instrument(name = "pull_and_replace", level = "debug", skip_all)]
    pub async fn pull_and_replace(&self, identity: &Identity) -> Result<LocalSnapshot, SyncError> {
        self.pull(identity).await.map(|(snapshot, _)| snapshot)
    }

    async fn pull(&self, identity: &Identity) -> Result<(LocalSnapshot, usize), SyncError> {
        let queued = self.local.queue_len()?;
        if queued > 0 {
            return Err(SyncError::QueueNotEmpty(queued));
        }

        let known = self.local.remote_index()?;
        let mut profiles: BTreeMap<RemoteId, LocalId> = BTreeMap::new();
        let mut records: Vec<EntityRecord> = Vec::new();
        let mut skipped_orphans = 0;

        for kind in EntityKind::ALL {
            let rows = self.remote.select_all(kind.table(), identity).await?;
            for row in rows {
                let remote_id = row_id(&row)?;
                let local_id = known.get(&remote_id).cloned().unwrap_or_else(LocalId::generate);

                let parent_local = if kind.is_dependent() {
                    let parent = row_parent(&row).and_then(|parent| profiles.get(&parent).cloned());
                    if parent.is_none() {
                        tracing::warn!(
                            kind = %kind,
                            remote_id = %remote_id,
                            "pulled row has no known parent"
                        );
                        skipped_orphans += 1;
                        continue;
                    }
                    parent
                } else {
                    None
                };

                let record = record_from_row(kind, &row, local_id, parent_local)?;
                if kind == EntityKind::ChildProfile {
                    profiles.insert(remote_id, record.local_id().clone());
                }
                records.push(record);
            }
        }

        self.local.replace_snapshot(&records)?;
        tracing::info!(records = records.len(), skipped_orphans, "local snapshot replaced");
        Ok((LocalSnapshot::from_records(records), skipped_orphans))
    }
}
