//! Local-first sync engine: one-time migration of device records, versioned remote schema
//! changes, an offline mutation queue, and drain-then-pull reconciliation.
//!
//! The engine never installs a tracing subscriber; the host application does.

mod config;
mod engine;
mod identity;
mod migration;
mod queue;
mod reconcile;
mod remote;
mod schema;

pub use config::EngineConfig;
pub use engine::{DeferredStep, InitReport, SyncEngine};
pub use identity::IdentityResolver;
pub use migration::{DroppedRecord, MigrationOrchestrator, MigrationReport, RemapTable};
pub use queue::{DrainReport, OfflineQueue};
pub use reconcile::{ReconcileReport, SyncReconciler};
pub use remote::RemoteClient;
pub use schema::{SchemaApplier, SchemaReport};
