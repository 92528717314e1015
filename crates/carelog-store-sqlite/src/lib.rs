//! SQLite persistence for the carelog sync engine.
//!
//! [`LocalStore`] is the device's own database. [`SqliteRemoteStore`] implements the
//! remote store contract on SQLite, for single-host deployments and tests.

mod local;
mod remote;
mod support;

pub use local::LocalStore;
pub use remote::SqliteRemoteStore;
