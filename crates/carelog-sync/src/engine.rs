use std::sync::Arc;

use carelog_core::{
    schema_catalog, Disposition, EntityBody, EntityKind, EntityRecord, Identity, InitError,
    LocalId, LocalSnapshot, MigrationError, Mutation, MutationEnvelope, MutationError,
    MutationOp, MutationReceipt, RemoteStore, SchemaChangeDescriptor, SchemaError, SchemaStatus,
    SyncError,
};
use carelog_store_sqlite::LocalStore;
use serde::Serialize;
use time::OffsetDateTime;

use crate::config::EngineConfig;
use crate::identity::IdentityResolver;
use crate::migration::{MigrationOrchestrator, MigrationReport};
use crate::queue::{OfflineQueue, PushError};
use crate::reconcile::{ReconcileReport, SyncReconciler};
use crate::remote::RemoteClient;
use crate::schema::{SchemaApplier, SchemaReport};

const OFFLINE: &str = "device is offline";

/// A startup step postponed until connectivity returns.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct DeferredStep {
    pub step: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct InitReport {
    pub online: bool,
    pub identity: Option<Identity>,
    pub migration: Option<MigrationReport>,
    pub schema: Option<SchemaReport>,
    pub reconcile: Option<ReconcileReport>,
    pub deferred: Vec<DeferredStep>,
}

impl InitReport {
    #[must_use]
    pub fn is_deferred(&self, step: &str) -> bool {
        self.deferred.iter().any(|deferred| deferred.step == step)
    }
}

/// The device-side entry point: startup, local-first mutations, and connectivity changes.
pub struct SyncEngine {
    config: EngineConfig,
    local: LocalStore,
    remote: RemoteClient,
    catalog: Vec<SchemaChangeDescriptor>,
    online: bool,
    identity: Option<Identity>,
}

impl SyncEngine {
    #[must_use]
    pub fn new(config: EngineConfig, local: LocalStore, remote: Arc<dyn RemoteStore>) -> Self {
        let remote = RemoteClient::new(remote, config.remote_timeout());
        Self {
            online: config.start_online,
            config,
            local,
            remote,
            catalog: schema_catalog(),
            identity: None,
        }
    }

    /// Replace the built-in schema catalog.
    #[must_use]
    pub fn with_catalog(mut self, catalog: Vec<SchemaChangeDescriptor>) -> Self {
        self.catalog = catalog;
        self
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online
    }

    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    #[must_use]
    pub fn local_store(&self) -> &LocalStore {
        &self.local
    }

    /// Run the startup sequence: migration, schema changes, identity, then reconcile.
    ///
    /// A step that cannot reach the remote store is deferred and the engine continues
    /// offline; [`SyncEngine::on_connectivity_restored`] finishes it later.
    ///
    /// # Errors
    /// Returns [`InitError`] for failures that must block startup: rejected or failed
    /// schema changes and local storage or data corruption.
    #[tracing::instrument(name = "initialize", level = "debug", skip(self))]
    pub async fn initialize(&mut self) -> Result<InitReport, InitError> {
        let mut report = InitReport::default();
        let marker = self.local.version_marker().map_err(SyncError::from)?;

        if !marker.migration_completed {
            if self.online {
                let outcome = MigrationOrchestrator::new(&self.local, &self.remote).migrate().await;
                match outcome {
                    Ok(migration) => {
                        self.identity.clone_from(&migration.identity);
                        report.migration = Some(migration);
                    }
                    Err(err @ (MigrationError::Local(_) | MigrationError::Corrupt(_))) => {
                        return Err(err.into());
                    }
                    Err(err) => {
                        let unavailable = err.is_remote_unavailable();
                        self.defer(&mut report, "migration", err.to_string(), unavailable);
                    }
                }
            } else {
                self.defer(&mut report, "migration", OFFLINE.to_string(), false);
            }
        }

        if self.online {
            let outcome = SchemaApplier::new(&self.local, &self.remote)
                .apply_pending(&self.catalog)
                .await;
            match outcome {
                Ok(schema) => report.schema = Some(schema),
                Err(err) if err.is_remote_unavailable() => {
                    self.defer(&mut report, "schema", err.to_string(), true);
                }
                Err(err) => return Err(err.into()),
            }
        } else if !self.schema_status()?.pending_versions.is_empty() {
            self.defer(&mut report, "schema", OFFLINE.to_string(), false);
        }

        if self.identity.is_none() {
            if self.online {
                let outcome = IdentityResolver::new(&self.local, &self.remote).resolve().await;
                match outcome {
                    Ok(identity) => self.identity = Some(identity),
                    Err(err @ (SyncError::Local(_) | SyncError::Corrupt(_))) => {
                        return Err(err.into());
                    }
                    Err(err) => {
                        let unavailable = err.is_remote_unavailable();
                        self.defer(&mut report, "identity", err.to_string(), unavailable);
                    }
                }
            } else {
                self.defer(&mut report, "identity", OFFLINE.to_string(), false);
            }
        }

        let migrated = self.local.version_marker().map_err(SyncError::from)?.migration_completed;
        match self.identity.clone() {
            Some(identity) if self.online && migrated => {
                let outcome = self.reconciler().reconcile(&identity).await;
                match outcome {
                    Ok(reconciled) => report.reconcile = Some(reconciled),
                    Err(err @ (SyncError::Local(_) | SyncError::Corrupt(_))) => {
                        return Err(err.into());
                    }
                    Err(err) => {
                        let unavailable = err.is_remote_unavailable();
                        self.defer(&mut report, "reconcile", err.to_string(), unavailable);
                    }
                }
            }
            identity => {
                let reason = if !self.online {
                    OFFLINE
                } else if identity.is_none() {
                    "no identity resolved"
                } else {
                    "migration has not completed"
                };
                self.defer(&mut report, "reconcile", reason.to_string(), false);
            }
        }

        report.online = self.online;
        report.identity.clone_from(&self.identity);
        tracing::info!(
            online = report.online,
            deferred = report.deferred.len(),
            "sync engine initialized"
        );
        Ok(report)
    }

    fn defer(
        &mut self,
        report: &mut InitReport,
        step: &'static str,
        reason: String,
        unavailable: bool,
    ) {
        if unavailable {
            self.online = false;
        }
        tracing::warn!(step, reason = %reason, "startup step deferred");
        report.deferred.push(DeferredStep { step, reason });
    }

    /// # Errors
    /// Returns [`SyncError::Local`] when the local database cannot be read.
    pub fn snapshot(&self) -> Result<LocalSnapshot, SyncError> {
        Ok(self.local.snapshot()?)
    }

    /// # Errors
    /// Returns [`SchemaError::Local`] when the persisted version cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus, SchemaError> {
        SchemaApplier::new(&self.local, &self.remote).status(&self.catalog)
    }

    /// Apply a mutation locally, then mirror it to the remote store or queue it.
    ///
    /// Remote failures never fail the call: the mutation is queued and the receipt carries
    /// the remote error.
    ///
    /// # Errors
    /// Returns [`MutationError`] when the mutation is invalid or cannot be applied locally.
    #[tracing::instrument(
        name = "mutate",
        level = "debug",
        skip_all,
        fields(kind = %mutation.kind())
    )]
    pub async fn mutate(&mut self, mutation: Mutation) -> Result<MutationReceipt, MutationError> {
        let now = OffsetDateTime::now_utc();
        let envelope = match mutation {
            Mutation::Create(body) => {
                body.validate()?;
                self.check_parent(&body)?;
                let record = EntityRecord::new_local(body.clone(), now);
                self.local.insert_record(&record)?;
                MutationEnvelope {
                    kind: record.kind(),
                    op: MutationOp::Create,
                    local_id: record.header.local_id,
                    remote_id: None,
                    payload: Some(body),
                }
            }
            Mutation::Update { local_id, body } => {
                body.validate()?;
                let existing = self.existing(&local_id, body.kind())?;
                self.check_parent(&body)?;
                self.local.update_record_body(&local_id, &body, now)?;
                MutationEnvelope {
                    kind: body.kind(),
                    op: MutationOp::Update,
                    local_id,
                    remote_id: existing.header.remote_id,
                    payload: Some(body),
                }
            }
            Mutation::Delete { kind, local_id } => {
                let existing = self.existing(&local_id, kind)?;
                self.delete_locally(&existing)?;
                if existing.header.remote_id.is_none() {
                    let discarded = self.local.discard_queued_for(&local_id)?;
                    tracing::debug!(
                        local_id = %local_id,
                        discarded,
                        "deleted record never left this device"
                    );
                    return Ok(receipt(kind, local_id, Disposition::LocalOnly, None));
                }
                MutationEnvelope {
                    kind,
                    op: MutationOp::Delete,
                    local_id,
                    remote_id: existing.header.remote_id,
                    payload: None,
                }
            }
        };
        self.route(envelope).await
    }

    async fn route(
        &mut self,
        mut envelope: MutationEnvelope,
    ) -> Result<MutationReceipt, MutationError> {
        let migrated = self.local.version_marker()?.migration_completed;
        if envelope.remote_id.is_none() {
            if !migrated {
                // The migration run carries unbound records.
                return Ok(receipt(envelope.kind, envelope.local_id, Disposition::LocalOnly, None));
            }
            if envelope.op == MutationOp::Update && !self.local.has_queued(&envelope.local_id)? {
                envelope.op = MutationOp::Create;
            }
        }

        let identity = match &self.identity {
            Some(identity) if self.online => identity.clone(),
            _ => return self.enqueue(envelope, None),
        };
        if self.local.queue_len()? > 0 {
            // Earlier writes are still queued; this one goes out behind them.
            return self.enqueue_and_drain(envelope, &identity).await;
        }

        let pushed = self.offline_queue().push(&envelope, &identity).await;
        match pushed {
            Ok(_) => {
                tracing::debug!(
                    kind = %envelope.kind,
                    local_id = %envelope.local_id,
                    "mutation mirrored"
                );
                Ok(receipt(envelope.kind, envelope.local_id, Disposition::Mirrored, None))
            }
            Err(PushError::Blocked(reason)) => {
                tracing::debug!(reason = %reason, "mutation waits for its parent");
                self.enqueue(envelope, None)
            }
            Err(PushError::Remote(err)) => {
                if err.is_unavailable() {
                    tracing::warn!(error = %err, "remote store unreachable; going offline");
                    self.online = false;
                }
                self.enqueue(envelope, Some(err.to_string()))
            }
            Err(PushError::Local(err)) => Err(local_failure(err)),
        }
    }

    fn enqueue(
        &self,
        envelope: MutationEnvelope,
        remote_error: Option<String>,
    ) -> Result<MutationReceipt, MutationError> {
        self.offline_queue().enqueue(&envelope).map_err(local_failure)?;
        Ok(receipt(envelope.kind, envelope.local_id, Disposition::Queued, remote_error))
    }

    async fn enqueue_and_drain(
        &mut self,
        envelope: MutationEnvelope,
        identity: &Identity,
    ) -> Result<MutationReceipt, MutationError> {
        self.offline_queue().enqueue(&envelope).map_err(local_failure)?;
        let drained = self.offline_queue().drain(identity).await;
        let remote_error = match drained {
            Ok(_) => None,
            Err(err @ (SyncError::Local(_) | SyncError::Corrupt(_))) => {
                return Err(local_failure(err));
            }
            Err(err) => {
                if err.is_remote_unavailable() {
                    tracing::warn!(error = %err, "remote store unreachable; going offline");
                    self.online = false;
                }
                match err {
                    SyncError::DrainIncomplete { last_error, .. } => last_error,
                    other => Some(other.to_string()),
                }
            }
        };

        if self.local.has_queued(&envelope.local_id)? {
            return Ok(receipt(envelope.kind, envelope.local_id, Disposition::Queued, remote_error));
        }
        Ok(receipt(envelope.kind, envelope.local_id, Disposition::Mirrored, None))
    }

    fn existing(
        &self,
        local_id: &LocalId,
        expected: EntityKind,
    ) -> Result<EntityRecord, MutationError> {
        let record =
            self.local.record(local_id)?.ok_or_else(|| MutationError::NotFound(local_id.clone()))?;
        if record.kind() != expected {
            return Err(MutationError::KindMismatch {
                local_id: local_id.clone(),
                expected,
                actual: record.kind(),
            });
        }
        Ok(record)
    }

    fn check_parent(&self, body: &EntityBody) -> Result<(), MutationError> {
        let Some(parent) = body.parent() else {
            return Ok(());
        };
        match self.local.record(parent)? {
            Some(record) if record.kind() == EntityKind::ChildProfile => Ok(()),
            _ => Err(MutationError::UnknownParent(parent.clone())),
        }
    }

    /// Remove a record and, for a profile, its dependents. The remote store cascades on
    /// its own, so queued writes for the dependents are dropped.
    fn delete_locally(&self, record: &EntityRecord) -> Result<(), MutationError> {
        if record.kind() == EntityKind::ChildProfile {
            for dependent in self.local.dependents_of(record.local_id())? {
                self.local.discard_queued_for(dependent.local_id())?;
                self.local.delete_record(dependent.local_id())?;
            }
        }
        self.local.delete_record(record.local_id())?;
        Ok(())
    }

    /// Finish deferred startup steps, then drain and pull.
    ///
    /// # Errors
    /// Returns [`SyncError::Deferred`] when a startup step still cannot complete, and the
    /// reconcile error otherwise. Local state is kept whenever the pull does not run.
    #[tracing::instrument(name = "on_connectivity_restored", level = "debug", skip(self))]
    pub async fn on_connectivity_restored(&mut self) -> Result<ReconcileReport, SyncError> {
        self.online = true;
        tracing::info!("connectivity restored");
        self.finish_startup().await?;

        let Some(identity) = self.identity.clone() else {
            return Err(SyncError::Deferred {
                step: "identity",
                reason: "no identity resolved".to_string(),
            });
        };
        let outcome = self.reconciler().reconcile(&identity).await;
        if outcome.as_ref().is_err_and(SyncError::is_remote_unavailable) {
            self.online = false;
        }
        outcome
    }

    pub fn on_connectivity_lost(&mut self) {
        if self.online {
            tracing::info!("connectivity lost");
        }
        self.online = false;
    }

    async fn finish_startup(&mut self) -> Result<(), SyncError> {
        if !self.local.version_marker()?.migration_completed {
            let outcome = MigrationOrchestrator::new(&self.local, &self.remote).migrate().await;
            match outcome {
                Ok(migration) => {
                    if migration.identity.is_some() {
                        self.identity = migration.identity;
                    }
                }
                Err(MigrationError::Local(err)) => return Err(SyncError::Local(err)),
                Err(MigrationError::Corrupt(err)) => return Err(SyncError::Corrupt(err)),
                Err(err) => {
                    let unavailable = err.is_remote_unavailable();
                    return Err(self.still_deferred("migration", err.to_string(), unavailable));
                }
            }
        }

        let outcome =
            SchemaApplier::new(&self.local, &self.remote).apply_pending(&self.catalog).await;
        match outcome {
            Ok(_) => {}
            Err(SchemaError::Local(err)) => return Err(SyncError::Local(err)),
            Err(err) => {
                let unavailable = err.is_remote_unavailable();
                return Err(self.still_deferred("schema", err.to_string(), unavailable));
            }
        }

        if self.identity.is_none() {
            let outcome = IdentityResolver::new(&self.local, &self.remote).resolve().await;
            match outcome {
                Ok(identity) => self.identity = Some(identity),
                Err(err @ (SyncError::Local(_) | SyncError::Corrupt(_))) => return Err(err),
                Err(err) => {
                    let unavailable = err.is_remote_unavailable();
                    return Err(self.still_deferred("identity", err.to_string(), unavailable));
                }
            }
        }
        Ok(())
    }

    fn still_deferred(
        &mut self,
        step: &'static str,
        reason: String,
        unavailable: bool,
    ) -> SyncError {
        if unavailable {
            self.online = false;
        }
        tracing::warn!(step, reason = %reason, "deferred startup step failed again");
        SyncError::Deferred { step, reason }
    }

    fn offline_queue(&self) -> OfflineQueue<'_> {
        OfflineQueue::new(&self.local, &self.remote)
            .with_attempt_threshold(self.config.max_attempts_logged)
    }

    fn reconciler(&self) -> SyncReconciler<'_> {
        SyncReconciler::new(&self.local, &self.remote)
            .with_attempt_threshold(self.config.max_attempts_logged)
    }
}

fn receipt(
    kind: EntityKind,
    local_id: LocalId,
    disposition: Disposition,
    remote_error: Option<String>,
) -> MutationReceipt {
    MutationReceipt { kind, local_id, disposition, remote_error }
}

fn local_failure(err: SyncError) -> MutationError {
    match err {
        SyncError::Corrupt(err) => MutationError::Corrupt(err),
        SyncError::Local(err) => MutationError::Local(err),
        other => MutationError::Local(anyhow::Error::new(other)),
    }
}
