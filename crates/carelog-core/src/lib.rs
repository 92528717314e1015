//! Domain types for the carelog sync engine: record identity, entity bodies, schema
//! change descriptors, queued mutations, and the error taxonomy. No I/O happens here.

mod catalog;
mod entity;
mod error;
mod guard;
mod ids;
mod mutation;
mod remote;
pub mod row;
mod schema;
mod snapshot;
mod version;

pub use catalog::{catalog_target, schema_catalog};
pub use entity::{
    CalendarEntry, ChildProfile, EntityBody, EntityKind, EntityRecord, GrowthMemory, Observation,
    RecordHeader,
};
pub use error::{
    InitError, MigrationError, MutationError, RemoteError, RollbackOutcome, RowError,
    SchemaError, SyncError, ValidationError, VersionParseError,
};
pub use guard::{check_destructive, is_destructive, is_destructive_statement, validate_descriptors};
pub use ids::{idempotency_key, DeviceToken, Identity, LocalId, RemoteId};
pub use mutation::{
    Disposition, Mutation, MutationEnvelope, MutationOp, MutationReceipt, QueuedMutation,
};
pub use remote::RemoteStore;
pub use row::RemoteRow;
pub use schema::{
    pending_descriptors, ChangeType, ColumnDef, ColumnType, RiskLevel, SchemaChangeDescriptor,
    SchemaObject, SchemaOperation, SchemaSnapshot, SchemaStatus,
};
pub use snapshot::LocalSnapshot;
pub use version::{SchemaVersion, VersionMarker};
