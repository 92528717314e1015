use std::collections::BTreeMap;

use carelog_core::row::insert_row;
use carelog_core::{
    idempotency_key, EntityKind, EntityRecord, Identity, LocalId, MigrationError, RemoteId,
};
use carelog_store_sqlite::LocalStore;
use serde::Serialize;

use crate::identity::IdentityResolver;
use crate::remote::RemoteClient;

/// Local-to-remote id assignments made during one migration run, per kind.
#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct RemapTable {
    by_kind: BTreeMap<EntityKind, BTreeMap<LocalId, RemoteId>>,
}

impl RemapTable {
    pub fn record(&mut self, kind: EntityKind, local_id: LocalId, remote_id: RemoteId) {
        self.by_kind.entry(kind).or_default().insert(local_id, remote_id);
    }

    #[must_use]
    pub fn get(&self, kind: EntityKind, local_id: &LocalId) -> Option<&RemoteId> {
        self.by_kind.get(&kind).and_then(|entries| entries.get(local_id))
    }

    #[must_use]
    pub fn len(&self, kind: EntityKind) -> usize {
        self.by_kind.get(&kind).map_or(0, BTreeMap::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_kind.values().all(BTreeMap::is_empty)
    }
}

/// A dependent record left behind because its parent profile never reached the remote store.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct DroppedRecord {
    pub kind: EntityKind,
    pub local_id: LocalId,
    pub missing_parent: LocalId,
}

#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct MigrationReport {
    pub already_completed: bool,
    pub identity: Option<Identity>,
    pub migrated: BTreeMap<EntityKind, usize>,
    pub dropped: Vec<DroppedRecord>,
    pub remap: RemapTable,
}

impl MigrationReport {
    #[must_use]
    pub fn migrated_total(&self) -> usize {
        self.migrated.values().sum()
    }
}

/// Moves the device's pre-existing records into the remote store, once.
pub struct MigrationOrchestrator<'a> {
    local: &'a LocalStore,
    remote: &'a RemoteClient,
}

impl<'a> MigrationOrchestrator<'a> {
    #[must_use]
    pub fn new(local: &'a LocalStore, remote: &'a RemoteClient) -> Self {
        Self { local, remote }
    }

    /// Migrate every local record that has no remote id yet, parents first.
    ///
    /// The completion flag is set only after every insert succeeded. A failed run leaves
    /// the flag unset; rerunning is safe because each insert carries an idempotency key and
    /// records bound in an earlier run are skipped.
    ///
    /// # Errors
    /// Returns [`MigrationError::Identity`] when no identity can be resolved and
    /// [`MigrationError::Remote`] for the first insert the remote store refuses.
    #[tracing::instrument(name = "migrate", level = "debug", skip(self))]
    pub async fn migrate(&self) -> Result<MigrationReport, MigrationError> {
        let marker = self.local.version_marker()?;
        if marker.migration_completed {
            tracing::debug!("migration already completed");
            return Ok(MigrationReport { already_completed: true, ..MigrationReport::default() });
        }

        let identity = IdentityResolver::new(self.local, self.remote)
            .resolve()
            .await
            .map_err(MigrationError::Identity)?;
        let mut report =
            MigrationReport { identity: Some(identity.clone()), ..MigrationReport::default() };

        for kind in EntityKind::ALL {
            for record in self.local.records_without_remote(kind)? {
                let parent_remote = match record.body.parent() {
                    None => None,
                    Some(parent) => match self.parent_remote_id(&report.remap, parent)? {
                        Some(remote_id) => Some(remote_id),
                        None => {
                            tracing::warn!(
                                kind = %kind,
                                local_id = %record.local_id(),
                                parent = %parent,
                                "dropping record whose parent profile was not migrated"
                            );
                            report.dropped.push(DroppedRecord {
                                kind,
                                local_id: record.local_id().clone(),
                                missing_parent: parent.clone(),
                            });
                            continue;
                        }
                    },
                };

                let remote_id =
                    self.migrate_record(&record, &identity, parent_remote.as_ref()).await?;
                report.remap.record(kind, record.local_id().clone(), remote_id);
                *report.migrated.entry(kind).or_default() += 1;
            }
        }

        if !self.local.mark_migration_completed()? {
            tracing::debug!("migration flag was set concurrently");
        }
        tracing::info!(
            migrated = report.migrated_total(),
            dropped = report.dropped.len(),
            identity = %identity,
            "local records migrated"
        );
        Ok(report)
    }

    async fn migrate_record(
        &self,
        record: &EntityRecord,
        identity: &Identity,
        parent_remote: Option<&RemoteId>,
    ) -> Result<RemoteId, MigrationError> {
        let kind = record.kind();
        let key = idempotency_key(kind, record.local_id(), identity);
        let row = insert_row(record, identity, &key, parent_remote)?;
        let remote_id = self.remote.insert(kind.table(), row).await.map_err(|source| {
            MigrationError::Remote { kind, local_id: record.local_id().clone(), source }
        })?;
        self.local.bind_remote(record.local_id(), &remote_id, identity)?;
        tracing::debug!(
            kind = %kind,
            local_id = %record.local_id(),
            remote_id = %remote_id,
            "record migrated"
        );
        Ok(remote_id)
    }

    fn parent_remote_id(
        &self,
        remap: &RemapTable,
        parent: &LocalId,
    ) -> Result<Option<RemoteId>, MigrationError> {
        if let Some(remote_id) = remap.get(EntityKind::ChildProfile, parent) {
            return Ok(Some(remote_id.clone()));
        }
        // Bound by an earlier run that did not finish.
        Ok(self
            .local
            .record(parent)?
            .filter(|record| record.kind() == EntityKind::ChildProfile)
            .and_then(|record| record.header.remote_id))
    }
}
