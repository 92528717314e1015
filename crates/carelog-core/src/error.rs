//! Error taxonomy shared by the stores and the sync engine.
//!
//! Every engine-facing error exposes a stable `code()` for callers that branch on it and a
//! `retryable()` hint: transient connectivity failures are retryable, structural failures
//! are not.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::entity::EntityKind;
use crate::ids::LocalId;
use crate::schema::{ChangeType, RiskLevel};
use crate::version::SchemaVersion;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("invalid schema version {0:?}; expected major.minor.patch")]
pub struct VersionParseError(pub String);

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RowError {
    #[error("row is missing column {0}")]
    MissingColumn(&'static str),
    #[error("{0} row has no parent profile reference")]
    MissingParent(EntityKind),
    #[error("malformed row: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ValidationError {
    #[error("schema version {0} is declared more than once")]
    DuplicateVersion(SchemaVersion),
    #[error("schema change {version} declares {change_type:?} but its forward step is {operation}")]
    ChangeTypeMismatch { version: SchemaVersion, change_type: ChangeType, operation: String },
    #[error("schema change {version} is malformed: {reason}")]
    InvalidOperation { version: SchemaVersion, reason: String },
    #[error("schema change {version} ({operation}) is destructive but classified {risk_level:?}")]
    UnguardedDestructive { version: SchemaVersion, operation: String, risk_level: RiskLevel },
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

impl ValidationError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateVersion(_) => "VALIDATION_DUPLICATE_VERSION",
            Self::ChangeTypeMismatch { .. } => "VALIDATION_CHANGE_TYPE_MISMATCH",
            Self::InvalidOperation { .. } => "VALIDATION_INVALID_OPERATION",
            Self::UnguardedDestructive { .. } => "VALIDATION_UNGUARDED_DESTRUCTIVE",
            Self::InvalidRecord(_) => "VALIDATION_INVALID_RECORD",
        }
    }
}

/// Failure reported by a remote store client.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RemoteError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    #[error("remote store rejected the request: {0}")]
    Rejected(String),
    #[error("remote row {table}/{id} not found")]
    NotFound { table: String, id: String },
}

impl RemoteError {
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "REMOTE_UNAVAILABLE",
            Self::Rejected(_) => "REMOTE_REJECTED",
            Self::NotFound { .. } => "REMOTE_NOT_FOUND",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),
    #[error(transparent)]
    Remote(RemoteError),
    #[error("offline queue drain incomplete: {applied} applied, {remaining} still queued")]
    DrainIncomplete {
        applied: usize,
        remaining: usize,
        last_error: Option<String>,
        /// The drain stopped because the remote store could not be reached.
        unreachable: bool,
    },
    #[error("offline queue holds {0} mutation(s); local snapshot left in place")]
    QueueNotEmpty(usize),
    #[error("{step} has not completed: {reason}")]
    Deferred { step: &'static str, reason: String },
    #[error("corrupt record data: {0}")]
    Corrupt(#[from] RowError),
    #[error("local storage failure: {0:#}")]
    Local(#[from] anyhow::Error),
}

impl From<RemoteError> for SyncError {
    fn from(value: RemoteError) -> Self {
        match value {
            RemoteError::Unavailable(reason) => Self::RemoteUnavailable(reason),
            other => Self::Remote(other),
        }
    }
}

impl SyncError {
    #[must_use]
    pub fn is_remote_unavailable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_) | Self::DrainIncomplete { unreachable: true, .. })
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::RemoteUnavailable(_) => "SYNC_REMOTE_UNAVAILABLE",
            Self::Remote(err) => err.code(),
            Self::DrainIncomplete { .. } => "SYNC_DRAIN_INCOMPLETE",
            Self::QueueNotEmpty(_) => "SYNC_QUEUE_NOT_EMPTY",
            Self::Deferred { .. } => "SYNC_STEP_DEFERRED",
            Self::Corrupt(_) => "SYNC_CORRUPT_RECORD",
            Self::Local(_) => "SYNC_LOCAL_STORAGE",
        }
    }

    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RemoteUnavailable(_)
                | Self::DrainIncomplete { .. }
                | Self::QueueNotEmpty(_)
                | Self::Deferred { .. }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("could not resolve the remote identity: {0}")]
    Identity(#[source] SyncError),
    #[error("migrating {kind} {local_id} failed: {source}")]
    Remote { kind: EntityKind, local_id: LocalId, source: RemoteError },
    #[error("corrupt local record: {0}")]
    Corrupt(#[from] RowError),
    #[error("local storage failure: {0:#}")]
    Local(#[from] anyhow::Error),
}

impl MigrationError {
    #[must_use]
    pub fn is_remote_unavailable(&self) -> bool {
        match self {
            Self::Identity(err) => err.is_remote_unavailable(),
            Self::Remote { source, .. } => source.is_unavailable(),
            Self::Corrupt(_) | Self::Local(_) => false,
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Identity(_) => "MIGRATION_IDENTITY",
            Self::Remote { .. } => "MIGRATION_REMOTE_INSERT",
            Self::Corrupt(_) => "MIGRATION_CORRUPT_RECORD",
            Self::Local(_) => "MIGRATION_LOCAL_STORAGE",
        }
    }

    /// Every migration failure leaves the completion flag unset, so the next startup
    /// retries; only local corruption needs outside help.
    #[must_use]
    pub fn retryable(&self) -> bool {
        !matches!(self, Self::Corrupt(_))
    }
}

/// What happened to a descriptor's rollback step after its forward step failed.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum RollbackOutcome {
    NotDefined,
    Succeeded,
    Failed(String),
}

impl Display for RollbackOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotDefined => f.write_str("no rollback defined"),
            Self::Succeeded => f.write_str("rolled back"),
            Self::Failed(reason) => write!(f, "rollback failed: {reason}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("schema changes rejected before execution: {0}")]
    Validation(#[from] ValidationError),
    #[error("backup before schema change {version} failed: {source}")]
    Backup { version: SchemaVersion, source: RemoteError },
    #[error("schema change {version} failed: {reason} ({rollback})")]
    ForwardFailed {
        version: SchemaVersion,
        #[source]
        reason: RemoteError,
        rollback: RollbackOutcome,
    },
    #[error("schema version moved underneath the applier: expected {expected}, wanted {target}")]
    VersionConflict { expected: SchemaVersion, target: SchemaVersion },
    #[error("local storage failure: {0:#}")]
    Local(#[from] anyhow::Error),
}

impl SchemaError {
    #[must_use]
    pub fn is_remote_unavailable(&self) -> bool {
        match self {
            Self::Backup { source, .. } => source.is_unavailable(),
            Self::ForwardFailed { reason, .. } => reason.is_unavailable(),
            Self::Validation(_) | Self::VersionConflict { .. } | Self::Local(_) => false,
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(err) => err.code(),
            Self::Backup { .. } => "SCHEMA_BACKUP_FAILED",
            Self::ForwardFailed { .. } => "SCHEMA_FORWARD_FAILED",
            Self::VersionConflict { .. } => "SCHEMA_VERSION_CONFLICT",
            Self::Local(_) => "SCHEMA_LOCAL_STORAGE",
        }
    }

    #[must_use]
    pub fn retryable(&self) -> bool {
        self.is_remote_unavailable() || matches!(self, Self::VersionConflict { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("record {0} not found")]
    NotFound(LocalId),
    #[error("record {local_id} is a {actual}, not a {expected}")]
    KindMismatch { local_id: LocalId, expected: EntityKind, actual: EntityKind },
    #[error("parent profile {0} not found")]
    UnknownParent(LocalId),
    #[error("corrupt record data: {0}")]
    Corrupt(#[from] RowError),
    #[error("local storage failure: {0:#}")]
    Local(#[from] anyhow::Error),
}

impl MutationError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Invalid(err) => err.code(),
            Self::NotFound(_) => "MUTATION_NOT_FOUND",
            Self::KindMismatch { .. } => "MUTATION_KIND_MISMATCH",
            Self::UnknownParent(_) => "MUTATION_UNKNOWN_PARENT",
            Self::Corrupt(_) => "MUTATION_CORRUPT_RECORD",
            Self::Local(_) => "MUTATION_LOCAL_STORAGE",
        }
    }

    /// Remote failures never surface here; they queue the mutation instead.
    #[must_use]
    pub fn retryable(&self) -> bool {
        false
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl InitError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Schema(err) => err.code(),
            Self::Migration(err) => err.code(),
            Self::Sync(err) => err.code(),
        }
    }

    #[must_use]
    pub fn retryable(&self) -> bool {
        match self {
            Self::Schema(err) => err.retryable(),
            Self::Migration(err) => err.retryable(),
            Self::Sync(err) => err.retryable(),
        }
    }
}
