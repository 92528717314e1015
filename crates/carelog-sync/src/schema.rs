use carelog_core::{
    catalog_target, pending_descriptors, validate_descriptors, RollbackOutcome,
    SchemaChangeDescriptor, SchemaError, SchemaStatus, SchemaVersion,
};
use carelog_store_sqlite::LocalStore;
use serde::Serialize;

use crate::remote::RemoteClient;

#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct SchemaReport {
    pub from_version: SchemaVersion,
    pub to_version: SchemaVersion,
    pub applied: Vec<SchemaVersion>,
    pub backed_up: Vec<SchemaVersion>,
}

/// Applies versioned schema changes to the remote store, one at a time, persisting the
/// high-water mark after each.
pub struct SchemaApplier<'a> {
    local: &'a LocalStore,
    remote: &'a RemoteClient,
}

impl<'a> SchemaApplier<'a> {
    #[must_use]
    pub fn new(local: &'a LocalStore, remote: &'a RemoteClient) -> Self {
        Self { local, remote }
    }

    /// Versions `apply_pending` would apply, in order, without executing anything.
    ///
    /// # Errors
    /// Returns [`SchemaError::Validation`] when the pending changes would be rejected, and
    /// [`SchemaError::Local`] when the persisted version cannot be read.
    pub fn plan(
        &self,
        descriptors: &[SchemaChangeDescriptor],
    ) -> Result<Vec<SchemaVersion>, SchemaError> {
        let current = self.local.version_marker()?.current_schema_version;
        let pending = pending_descriptors(current, descriptors);
        validate_descriptors(pending.iter().copied())?;
        Ok(pending.into_iter().map(|descriptor| descriptor.version).collect())
    }

    /// # Errors
    /// Returns [`SchemaError::Local`] when the persisted version cannot be read.
    pub fn status(
        &self,
        descriptors: &[SchemaChangeDescriptor],
    ) -> Result<SchemaStatus, SchemaError> {
        let current_version = self.local.version_marker()?.current_schema_version;
        let pending_versions = pending_descriptors(current_version, descriptors)
            .into_iter()
            .map(|descriptor| descriptor.version)
            .collect();
        Ok(SchemaStatus {
            current_version,
            target_version: catalog_target(descriptors).max(current_version),
            pending_versions,
        })
    }

    /// Apply every descriptor newer than the persisted version, in ascending order.
    ///
    /// The whole pending list is validated before anything executes. When a forward step
    /// fails its rollback runs once, and the persisted version stays at the last success.
    ///
    /// # Errors
    /// Returns [`SchemaError::Validation`] before any execution, [`SchemaError::Backup`]
    /// when a required backup cannot be captured, [`SchemaError::ForwardFailed`] when a
    /// forward step fails, and [`SchemaError::VersionConflict`] when the persisted version
    /// changed underneath the run.
    #[tracing::instrument(name = "apply_pending", level = "debug", skip_all)]
    pub async fn apply_pending(
        &self,
        descriptors: &[SchemaChangeDescriptor],
    ) -> Result<SchemaReport, SchemaError> {
        let from_version = self.local.version_marker()?.current_schema_version;
        let pending = pending_descriptors(from_version, descriptors);
        validate_descriptors(pending.iter().copied())?;

        let mut report =
            SchemaReport { from_version, to_version: from_version, ..SchemaReport::default() };
        if pending.is_empty() {
            tracing::debug!(version = %from_version, "remote schema is current");
            return Ok(report);
        }

        for descriptor in pending {
            let version = descriptor.version;
            if descriptor.requires_backup {
                let snapshot = self
                    .remote
                    .schema_metadata()
                    .await
                    .map_err(|source| SchemaError::Backup { version, source })?;
                self.local.save_schema_backup(version, &snapshot)?;
                report.backed_up.push(version);
            }

            if let Err(reason) = self.remote.execute_schema_operation(&descriptor.forward).await {
                tracing::error!(
                    version = %version,
                    operation = %descriptor.forward.describe(),
                    error = %reason,
                    "schema change failed"
                );
                let rollback = self.roll_back(descriptor).await;
                return Err(SchemaError::ForwardFailed { version, reason, rollback });
            }

            if !self.local.commit_schema_version(report.to_version, descriptor)? {
                return Err(SchemaError::VersionConflict {
                    expected: report.to_version,
                    target: version,
                });
            }
            tracing::info!(
                version = %version,
                change_type = descriptor.change_type.as_str(),
                risk = descriptor.risk_level.as_str(),
                "schema change applied"
            );
            report.to_version = version;
            report.applied.push(version);
        }
        Ok(report)
    }

    async fn roll_back(&self, descriptor: &SchemaChangeDescriptor) -> RollbackOutcome {
        let Some(rollback) = &descriptor.rollback else {
            tracing::warn!(version = %descriptor.version, "no rollback defined");
            return RollbackOutcome::NotDefined;
        };
        match self.remote.execute_schema_operation(rollback).await {
            Ok(()) => {
                tracing::info!(version = %descriptor.version, "schema change rolled back");
                RollbackOutcome::Succeeded
            }
            Err(err) => {
                tracing::error!(version = %descriptor.version, error = %err, "rollback failed");
                RollbackOutcome::Failed(err.to_string())
            }
        }
    }
}
