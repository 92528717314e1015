//! Shared fixtures for the engine integration tests: a fault-injecting remote store over
//! SQLite and a context holding the temporary databases.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use carelog_core::{
    CalendarEntry, ChildProfile, EntityBody, EntityRecord, GrowthMemory, Identity, LocalId,
    Observation, RemoteError, RemoteId, RemoteRow, RemoteStore, SchemaOperation, SchemaSnapshot,
};
use carelog_store_sqlite::{LocalStore, SqliteRemoteStore};
use carelog_sync::{EngineConfig, RemoteClient, SyncEngine};
use parking_lot::Mutex;
use tempfile::TempDir;
use time::OffsetDateTime;

/// One call observed by [`FlakyRemote`], recorded before any fault is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub table: String,
    /// Target row of an update or delete.
    pub id: Option<RemoteId>,
}

#[derive(Default)]
struct Faults {
    offline: bool,
    delay: Option<Duration>,
    counters: HashMap<&'static str, usize>,
    planned: Vec<(&'static str, usize, RemoteError)>,
    lost: Vec<usize>,
    calls: Vec<Call>,
}

struct Admitted {
    delay: Option<Duration>,
    lose_response: bool,
}

/// Remote store that forwards to a real [`SqliteRemoteStore`] unless told to misbehave.
pub struct FlakyRemote {
    inner: SqliteRemoteStore,
    faults: Mutex<Faults>,
}

#[allow(dead_code)]
impl FlakyRemote {
    pub fn new(inner: SqliteRemoteStore) -> Self {
        Self { inner, faults: Mutex::new(Faults::default()) }
    }

    pub fn inner(&self) -> &SqliteRemoteStore {
        &self.inner
    }

    /// Every call fails with `Unavailable` while offline.
    pub fn set_offline(&self, offline: bool) {
        self.faults.lock().offline = offline;
    }

    /// Every call sleeps this long before reaching the database.
    pub fn stall(&self, delay: Option<Duration>) {
        self.faults.lock().delay = delay;
    }

    /// Fail the `nth` call of `op` from now on (1-based), once.
    pub fn fail_call(&self, op: &'static str, nth: usize, error: RemoteError) {
        let mut faults = self.faults.lock();
        let seen = faults.counters.get(op).copied().unwrap_or(0);
        faults.planned.push((op, seen + nth, error));
    }

    /// Let the `nth` insert from now on (1-based) reach the database, then report it as
    /// unavailable, as if the response was lost in transit.
    pub fn lose_insert_response(&self, nth: usize) {
        let mut faults = self.faults.lock();
        let seen = faults.counters.get("insert").copied().unwrap_or(0);
        faults.lost.push(seen + nth);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.faults.lock().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.faults.lock().calls.iter().filter(|call| call.op == op).count()
    }

    /// Inserts, updates and deletes observed so far.
    pub fn writes(&self) -> usize {
        self.count("insert") + self.count("update") + self.count("delete")
    }

    pub fn clear_calls(&self) {
        self.faults.lock().calls.clear();
    }

    pub fn rows(&self, table: &str) -> usize {
        self.inner.row_count(table).unwrap_or_else(|err| panic!("count {table}: {err:#}"))
    }

    /// Row ids targeted by `op` on `table`, in call order.
    pub fn targets(&self, op: &str, table: &str) -> Vec<RemoteId> {
        self.faults
            .lock()
            .calls
            .iter()
            .filter(|call| call.op == op && call.table == table)
            .filter_map(|call| call.id.clone())
            .collect()
    }

    fn gate(
        &self,
        op: &'static str,
        table: &str,
        id: Option<&RemoteId>,
    ) -> Result<Admitted, RemoteError> {
        let mut faults = self.faults.lock();
        faults.calls.push(Call { op, table: table.to_string(), id: id.cloned() });
        let seen = {
            let counter = faults.counters.entry(op).or_insert(0);
            *counter += 1;
            *counter
        };
        if faults.offline {
            return Err(RemoteError::Unavailable("network is down".to_string()));
        }
        if let Some(position) =
            faults.planned.iter().position(|(planned, nth, _)| *planned == op && *nth == seen)
        {
            let (_, _, error) = faults.planned.remove(position);
            return Err(error);
        }
        let lose_response = op == "insert" && faults.lost.contains(&seen);
        faults.lost.retain(|nth| !(lose_response && *nth == seen));
        Ok(Admitted { delay: faults.delay, lose_response })
    }

    async fn enter(
        &self,
        op: &'static str,
        table: &str,
        id: Option<&RemoteId>,
    ) -> Result<bool, RemoteError> {
        let admitted = self.gate(op, table, id)?;
        if let Some(delay) = admitted.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(admitted.lose_response)
    }
}

#[async_trait]
impl RemoteStore for FlakyRemote {
    async fn insert(&self, table: &str, row: RemoteRow) -> Result<RemoteId, RemoteError> {
        let lose_response = self.enter("insert", table, None).await?;
        let id = self.inner.insert(table, row).await?;
        if lose_response {
            return Err(RemoteError::Unavailable("connection reset after insert".to_string()));
        }
        Ok(id)
    }

    async fn update(
        &self,
        table: &str,
        id: &RemoteId,
        columns: RemoteRow,
    ) -> Result<(), RemoteError> {
        self.enter("update", table, Some(id)).await?;
        self.inner.update(table, id, columns).await
    }

    async fn delete(&self, table: &str, id: &RemoteId) -> Result<(), RemoteError> {
        self.enter("delete", table, Some(id)).await?;
        self.inner.delete(table, id).await
    }

    async fn select_all(
        &self,
        table: &str,
        owner: &Identity,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        self.enter("select_all", table, None).await?;
        self.inner.select_all(table, owner).await
    }

    async fn exists(&self, table: &str, id: &RemoteId) -> Result<bool, RemoteError> {
        self.enter("exists", table, Some(id)).await?;
        self.inner.exists(table, id).await
    }

    async fn execute_schema_operation(
        &self,
        operation: &SchemaOperation,
    ) -> Result<(), RemoteError> {
        self.enter("execute_schema_operation", operation.table().unwrap_or(""), None).await?;
        self.inner.execute_schema_operation(operation).await
    }

    async fn schema_metadata(&self) -> Result<SchemaSnapshot, RemoteError> {
        self.enter("schema_metadata", "", None).await?;
        self.inner.schema_metadata().await
    }
}

/// Temporary local and remote databases for one test.
#[allow(dead_code)]
pub struct TestContext {
    pub temp_dir: TempDir,
    pub local_path: PathBuf,
    pub remote: Arc<FlakyRemote>,
}

#[allow(dead_code)]
impl TestContext {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let local_path = temp_dir.path().join("local.sqlite3");
        let remote = SqliteRemoteStore::open(&temp_dir.path().join("remote.sqlite3"))?;
        Ok(Self { temp_dir, local_path, remote: Arc::new(FlakyRemote::new(remote)) })
    }

    /// A fresh connection to the device database.
    pub fn local(&self) -> Result<LocalStore> {
        LocalStore::open(&self.local_path)
    }

    pub fn client(&self) -> RemoteClient {
        RemoteClient::new(self.remote.clone(), Duration::from_secs(5))
    }

    pub fn engine(&self) -> Result<SyncEngine> {
        self.engine_with(EngineConfig::default())
    }

    pub fn engine_with(&self, config: EngineConfig) -> Result<SyncEngine> {
        Ok(SyncEngine::new(config, self.local()?, self.remote.clone()))
    }

    /// Store records on the device as if they predate the remote store.
    pub fn seed(&self, records: &[EntityRecord]) -> Result<()> {
        let local = self.local()?;
        for record in records {
            local.insert_record(record)?;
        }
        Ok(())
    }
}

#[allow(dead_code)]
pub fn fixture_time() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(1_700_000_000)
}

#[allow(dead_code)]
pub fn profile(name: &str) -> EntityBody {
    EntityBody::ChildProfile(ChildProfile {
        name: name.to_string(),
        birth_date: Some("2021-04-02".to_string()),
        notes: None,
        avatar_url: None,
    })
}

#[allow(dead_code)]
pub fn observation(child: &LocalId, category: &str) -> EntityBody {
    EntityBody::Observation(Observation {
        child: child.clone(),
        category: category.to_string(),
        value: Some("ok".to_string()),
        notes: None,
        observed_at: fixture_time(),
    })
}

#[allow(dead_code)]
pub fn calendar_entry(child: &LocalId, title: &str) -> EntityBody {
    EntityBody::CalendarEntry(CalendarEntry {
        child: child.clone(),
        title: title.to_string(),
        notes: None,
        scheduled_for: fixture_time(),
    })
}

#[allow(dead_code)]
pub fn growth_memory(child: &LocalId, title: &str) -> EntityBody {
    EntityBody::GrowthMemory(GrowthMemory {
        child: child.clone(),
        title: title.to_string(),
        content: "first steps".to_string(),
        occurred_on: "2023-05-01".to_string(),
    })
}

#[allow(dead_code)]
pub fn record(body: EntityBody) -> EntityRecord {
    EntityRecord::new_local(body, fixture_time())
}
