use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use carelog_core::{
    DeviceToken, EntityBody, EntityKind, EntityRecord, Identity, LocalId, LocalSnapshot,
    MutationEnvelope, MutationOp, QueuedMutation, RecordHeader, RemoteId, SchemaChangeDescriptor,
    SchemaSnapshot, SchemaVersion, VersionMarker,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;

use crate::support::{
    configure, current_schema_version, now_rfc3339, parse_rfc3339, record_schema_version,
    rfc3339, table_exists, table_has_column, CREATE_SCHEMA_MIGRATIONS_SQL,
};

const LATEST_LOCAL_SCHEMA_VERSION: i64 = 2;

const MIGRATION_COMPLETED_KEY: &str = "migration_completed";
const SCHEMA_VERSION_KEY: &str = "schema_version";
const DEVICE_TOKEN_KEY: &str = "device_token";
const IDENTITY_KEY: &str = "identity";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

INSERT OR IGNORE INTO settings(key, value, updated_at)
VALUES ('migration_completed', 'false', strftime('%Y-%m-%dT%H:%M:%SZ', 'now'));

INSERT OR IGNORE INTO settings(key, value, updated_at)
VALUES ('schema_version', '0.0.0', strftime('%Y-%m-%dT%H:%M:%SZ', 'now'));

CREATE TABLE IF NOT EXISTS local_records (
  local_id TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK(kind IN ('child_profile', 'observation', 'calendar_entry', 'growth_memory')),
  parent_local_id TEXT,
  remote_id TEXT UNIQUE,
  owner_id TEXT,
  body_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_local_records_kind ON local_records(kind, created_at);
CREATE INDEX IF NOT EXISTS idx_local_records_parent ON local_records(parent_local_id);

CREATE TABLE IF NOT EXISTS offline_queue (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  kind TEXT NOT NULL,
  op TEXT NOT NULL CHECK(op IN ('create', 'update', 'delete')),
  local_id TEXT NOT NULL,
  remote_id TEXT,
  payload_json TEXT,
  enqueued_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_offline_queue_kind ON offline_queue(kind, seq);

CREATE TABLE IF NOT EXISTS schema_backups (
  version TEXT PRIMARY KEY,
  snapshot_json TEXT NOT NULL,
  captured_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS remote_schema_history (
  version TEXT PRIMARY KEY,
  change_type TEXT NOT NULL,
  description TEXT NOT NULL,
  applied_at TEXT NOT NULL
);
";

const RECORD_COLUMNS: &str = "local_id, remote_id, owner_id, body_json, created_at, updated_at";
const QUEUE_COLUMNS: &str =
    "seq, kind, op, local_id, remote_id, payload_json, enqueued_at, attempts, last_error";

/// The device's own database: version marker, cached identity, local snapshot, offline
/// queue, and remote schema bookkeeping.
pub struct LocalStore {
    conn: Connection,
}

struct RawRecord {
    local_id: String,
    remote_id: Option<String>,
    owner_id: Option<String>,
    body_json: String,
    created_at: String,
    updated_at: String,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            local_id: row.get(0)?,
            remote_id: row.get(1)?,
            owner_id: row.get(2)?,
            body_json: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<EntityRecord> {
        let body = serde_json::from_str::<EntityBody>(&self.body_json)
            .with_context(|| format!("failed to decode body of local record {}", self.local_id))?;
        Ok(EntityRecord {
            header: RecordHeader {
                local_id: LocalId(self.local_id),
                remote_id: self.remote_id.map(RemoteId),
                owner_id: self.owner_id.map(Identity),
                created_at: parse_rfc3339(&self.created_at)?,
                updated_at: parse_rfc3339(&self.updated_at)?,
            },
            body,
        })
    }
}

struct RawQueued {
    seq: i64,
    kind: String,
    op: String,
    local_id: String,
    remote_id: Option<String>,
    payload_json: Option<String>,
    enqueued_at: String,
    attempts: i64,
    last_error: Option<String>,
}

impl RawQueued {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            kind: row.get(1)?,
            op: row.get(2)?,
            local_id: row.get(3)?,
            remote_id: row.get(4)?,
            payload_json: row.get(5)?,
            enqueued_at: row.get(6)?,
            attempts: row.get(7)?,
            last_error: row.get(8)?,
        })
    }

    fn into_mutation(self) -> Result<QueuedMutation> {
        let kind = EntityKind::parse(&self.kind)
            .ok_or_else(|| anyhow!("queue entry {} has unknown kind {}", self.seq, self.kind))?;
        let op = MutationOp::parse(&self.op)
            .ok_or_else(|| anyhow!("queue entry {} has unknown op {}", self.seq, self.op))?;
        let payload = self
            .payload_json
            .as_deref()
            .map(serde_json::from_str::<EntityBody>)
            .transpose()
            .with_context(|| format!("failed to decode payload of queue entry {}", self.seq))?;
        Ok(QueuedMutation {
            seq: self.seq,
            kind,
            op,
            local_id: LocalId(self.local_id),
            remote_id: self.remote_id.map(RemoteId),
            payload,
            enqueued_at: parse_rfc3339(&self.enqueued_at)?,
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            last_error: self.last_error,
        })
    }
}

impl LocalStore {
    /// Open (or create) the local database and bring its layout up to date.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened, pragmas cannot be applied, or a
    /// layout migration fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        configure(&conn)?;

        let mut store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// # Errors
    /// See [`LocalStore::open`].
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    /// Apply all forward layout migrations up to the latest supported version.
    ///
    /// # Errors
    /// Returns an error when bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            apply_migration_2(&self.conn)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_LOCAL_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported local schema version {version}; expected {LATEST_LOCAL_SCHEMA_VERSION}"
            ));
        }
        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "offline_queue")? {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        // Tables exist without migration rows: infer the layout from the queue columns.
        record_schema_version(&self.conn, 1)?;
        if table_has_column(&self.conn, "offline_queue", "attempts")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }
        Ok(1)
    }

    /// # Errors
    /// Returns an error when the migrations table cannot be read.
    pub fn local_schema_version(&self) -> Result<i64> {
        current_schema_version(&self.conn)
    }

    fn setting(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .with_context(|| format!("failed to read setting {key}"))
    }

    fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings(key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now_rfc3339()?],
            )
            .with_context(|| format!("failed to write setting {key}"))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the marker cannot be read or holds an unparseable version.
    pub fn version_marker(&self) -> Result<VersionMarker> {
        let migration_completed =
            self.setting(MIGRATION_COMPLETED_KEY)?.is_some_and(|value| value == "true");
        let current_schema_version = match self.setting(SCHEMA_VERSION_KEY)? {
            Some(raw) => raw
                .parse::<SchemaVersion>()
                .with_context(|| format!("stored schema version {raw:?} is invalid"))?,
            None => SchemaVersion::ZERO,
        };
        Ok(VersionMarker { migration_completed, current_schema_version })
    }

    /// Compare-and-set the migration flag from false to true.
    ///
    /// Returns `false` when the flag was already set.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn mark_migration_completed(&self) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE settings SET value = 'true', updated_at = ?1
                 WHERE key = ?2 AND value = 'false'",
                params![now_rfc3339()?, MIGRATION_COMPLETED_KEY],
            )
            .context("failed to mark migration completed")?;
        Ok(changed == 1)
    }

    /// Compare-and-set the schema version from `expected` to the descriptor's version and
    /// append the descriptor to the applied history, in one transaction.
    ///
    /// Returns `false` without writing when the stored version is not `expected`.
    ///
    /// # Errors
    /// Returns an error when the transaction fails.
    pub fn commit_schema_version(
        &self,
        expected: SchemaVersion,
        descriptor: &SchemaChangeDescriptor,
    ) -> Result<bool> {
        let tx = self.conn.unchecked_transaction().context("failed to begin transaction")?;
        let now = now_rfc3339()?;
        let changed = tx
            .execute(
                "UPDATE settings SET value = ?1, updated_at = ?2 WHERE key = ?3 AND value = ?4",
                params![
                    descriptor.version.to_string(),
                    now,
                    SCHEMA_VERSION_KEY,
                    expected.to_string()
                ],
            )
            .context("failed to advance schema version")?;
        if changed != 1 {
            return Ok(false);
        }

        tx.execute(
            "INSERT OR REPLACE INTO remote_schema_history(version, change_type, description, applied_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                descriptor.version.to_string(),
                descriptor.change_type.as_str(),
                descriptor.description,
                now
            ],
        )
        .context("failed to record applied schema change")?;
        tx.commit().context("failed to commit schema version")?;
        Ok(true)
    }

    /// Versions recorded as applied, ascending.
    ///
    /// # Errors
    /// Returns an error when the history cannot be read.
    pub fn applied_schema_versions(&self) -> Result<Vec<SchemaVersion>> {
        let mut stmt = self.conn.prepare("SELECT version FROM remote_schema_history")?;
        let raw = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read applied schema history")?;
        let mut versions = raw
            .iter()
            .map(|value| {
                value
                    .parse::<SchemaVersion>()
                    .with_context(|| format!("schema history holds invalid version {value:?}"))
            })
            .collect::<Result<Vec<_>>>()?;
        versions.sort();
        Ok(versions)
    }

    /// # Errors
    /// Returns an error when the snapshot cannot be encoded or written.
    pub fn save_schema_backup(
        &self,
        version: SchemaVersion,
        snapshot: &SchemaSnapshot,
    ) -> Result<()> {
        let snapshot_json =
            serde_json::to_string(snapshot).context("failed to encode schema backup")?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO schema_backups(version, snapshot_json, captured_at)
                 VALUES (?1, ?2, ?3)",
                params![version.to_string(), snapshot_json, rfc3339(snapshot.captured_at)?],
            )
            .with_context(|| format!("failed to store schema backup for {version}"))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the backup cannot be read or decoded.
    pub fn schema_backup(&self, version: SchemaVersion) -> Result<Option<SchemaSnapshot>> {
        let raw = self
            .conn
            .query_row(
                "SELECT snapshot_json FROM schema_backups WHERE version = ?1",
                params![version.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to read schema backup for {version}"))?;
        raw.map(|json| serde_json::from_str(&json).context("failed to decode schema backup"))
            .transpose()
    }

    /// Device token, generated and persisted on first use.
    ///
    /// # Errors
    /// Returns an error when the token cannot be written or the stored value is invalid.
    pub fn device_token(&self) -> Result<DeviceToken> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO settings(key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![DEVICE_TOKEN_KEY, DeviceToken::new().to_string(), now_rfc3339()?],
            )
            .context("failed to persist device token")?;
        let raw = self
            .setting(DEVICE_TOKEN_KEY)?
            .ok_or_else(|| anyhow!("device token missing after insert"))?;
        DeviceToken::parse(&raw).ok_or_else(|| anyhow!("stored device token {raw:?} is invalid"))
    }

    /// # Errors
    /// Returns an error when the setting cannot be read.
    pub fn cached_identity(&self) -> Result<Option<Identity>> {
        Ok(self.setting(IDENTITY_KEY)?.map(Identity))
    }

    /// # Errors
    /// Returns an error when the setting cannot be written.
    pub fn store_identity(&self, identity: &Identity) -> Result<()> {
        self.put_setting(IDENTITY_KEY, identity.as_str())
    }

    /// # Errors
    /// Returns an error when the body cannot be encoded or the local id already exists.
    pub fn insert_record(&self, record: &EntityRecord) -> Result<()> {
        insert_record_with(&self.conn, record)
    }

    /// Replace the body of an existing record. Returns `false` when the record is unknown.
    ///
    /// # Errors
    /// Returns an error when the body cannot be encoded or written.
    pub fn update_record_body(
        &self,
        local_id: &LocalId,
        body: &EntityBody,
        updated_at: OffsetDateTime,
    ) -> Result<bool> {
        let body_json = serde_json::to_string(body).context("failed to encode record body")?;
        let changed = self
            .conn
            .execute(
                "UPDATE local_records SET body_json = ?1, parent_local_id = ?2, updated_at = ?3
                 WHERE local_id = ?4",
                params![
                    body_json,
                    body.parent().map(LocalId::as_str),
                    rfc3339(updated_at)?,
                    local_id.as_str()
                ],
            )
            .with_context(|| format!("failed to update local record {local_id}"))?;
        Ok(changed == 1)
    }

    /// # Errors
    /// Returns an error when the record cannot be read or decoded.
    pub fn record(&self, local_id: &LocalId) -> Result<Option<EntityRecord>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM local_records WHERE local_id = ?1"),
                params![local_id.as_str()],
                RawRecord::from_row,
            )
            .optional()
            .with_context(|| format!("failed to read local record {local_id}"))?;
        raw.map(RawRecord::into_record).transpose()
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_record(&self, local_id: &LocalId) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM local_records WHERE local_id = ?1", params![local_id.as_str()])
            .with_context(|| format!("failed to delete local record {local_id}"))?;
        Ok(changed == 1)
    }

    /// Records whose body references `parent`.
    ///
    /// # Errors
    /// Returns an error when the records cannot be read or decoded.
    pub fn dependents_of(&self, parent: &LocalId) -> Result<Vec<EntityRecord>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM local_records
                 WHERE parent_local_id = ?1 ORDER BY created_at, local_id"
            ),
            params![parent.as_str()],
        )
    }

    /// Attach the remote id and owner assigned by the remote store.
    ///
    /// # Errors
    /// Returns an error when the record does not exist or the write fails.
    pub fn bind_remote(
        &self,
        local_id: &LocalId,
        remote_id: &RemoteId,
        owner: &Identity,
    ) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE local_records SET remote_id = ?1, owner_id = ?2 WHERE local_id = ?3",
                params![remote_id.as_str(), owner.as_str(), local_id.as_str()],
            )
            .with_context(|| format!("failed to bind remote id to local record {local_id}"))?;
        if changed != 1 {
            return Err(anyhow!("local record {local_id} not found while binding remote id"));
        }
        Ok(())
    }

    /// Records of `kind` that have never been written remotely, oldest first.
    ///
    /// # Errors
    /// Returns an error when the records cannot be read or decoded.
    pub fn records_without_remote(&self, kind: EntityKind) -> Result<Vec<EntityRecord>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM local_records
                 WHERE kind = ?1 AND remote_id IS NULL ORDER BY created_at, local_id"
            ),
            params![kind.as_str()],
        )
    }

    /// # Errors
    /// Returns an error when the records cannot be read or decoded.
    pub fn list_records(&self) -> Result<Vec<EntityRecord>> {
        self.query_records(
            &format!("SELECT {RECORD_COLUMNS} FROM local_records ORDER BY created_at, local_id"),
            [],
        )
    }

    /// # Errors
    /// Returns an error when the records cannot be read or decoded.
    pub fn snapshot(&self) -> Result<LocalSnapshot> {
        Ok(LocalSnapshot::from_records(self.list_records()?))
    }

    /// Replace every local record with `records` in one transaction.
    ///
    /// # Errors
    /// Returns an error when any write fails; the previous snapshot is then kept.
    pub fn replace_snapshot(&self, records: &[EntityRecord]) -> Result<()> {
        let tx = self.conn.unchecked_transaction().context("failed to begin transaction")?;
        tx.execute("DELETE FROM local_records", []).context("failed to clear local records")?;
        for record in records {
            insert_record_with(&tx, record)?;
        }
        tx.commit().context("failed to commit local snapshot")?;
        Ok(())
    }

    /// Map of every known remote id to the local id holding it.
    ///
    /// # Errors
    /// Returns an error when the records cannot be read.
    pub fn remote_index(&self) -> Result<BTreeMap<RemoteId, LocalId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT remote_id, local_id FROM local_records WHERE remote_id IS NOT NULL")?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read remote id index")?;
        Ok(pairs.into_iter().map(|(remote, local)| (RemoteId(remote), LocalId(local))).collect())
    }

    fn query_records<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<EntityRecord>> {
        let mut stmt = self.conn.prepare(sql).context("failed to prepare record query")?;
        let raw = stmt
            .query_map(params, RawRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read local records")?;
        raw.into_iter().map(RawRecord::into_record).collect()
    }

    /// Append a mutation to the offline queue and return its sequence number.
    ///
    /// # Errors
    /// Returns an error when the payload cannot be encoded or written.
    pub fn enqueue(&self, envelope: &MutationEnvelope) -> Result<i64> {
        let payload_json = envelope
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to encode queued payload")?;
        self.conn
            .execute(
                "INSERT INTO offline_queue(kind, op, local_id, remote_id, payload_json, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    envelope.kind.as_str(),
                    envelope.op.as_str(),
                    envelope.local_id.as_str(),
                    envelope.remote_id.as_ref().map(RemoteId::as_str),
                    payload_json,
                    now_rfc3339()?
                ],
            )
            .context("failed to enqueue mutation")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Every queued mutation in enqueue order.
    ///
    /// # Errors
    /// Returns an error when the queue cannot be read or decoded.
    pub fn queued(&self) -> Result<Vec<QueuedMutation>> {
        self.query_queue(&format!("SELECT {QUEUE_COLUMNS} FROM offline_queue ORDER BY seq"), [])
    }

    /// Queued mutations of one kind in enqueue order.
    ///
    /// # Errors
    /// Returns an error when the queue cannot be read or decoded.
    pub fn queued_for_kind(&self, kind: EntityKind) -> Result<Vec<QueuedMutation>> {
        self.query_queue(
            &format!("SELECT {QUEUE_COLUMNS} FROM offline_queue WHERE kind = ?1 ORDER BY seq"),
            params![kind.as_str()],
        )
    }

    fn query_queue<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<QueuedMutation>> {
        let mut stmt = self.conn.prepare(sql).context("failed to prepare queue query")?;
        let raw = stmt
            .query_map(params, RawQueued::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read offline queue")?;
        raw.into_iter().map(RawQueued::into_mutation).collect()
    }

    /// # Errors
    /// Returns an error when the queue cannot be read.
    pub fn queue_len(&self) -> Result<usize> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM offline_queue", [], |row| row.get::<_, i64>(0))
            .context("failed to count offline queue")?;
        Ok(usize::try_from(count).unwrap_or(usize::MAX))
    }

    /// Remove an entry after the remote store acknowledged it.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn acknowledge(&self, seq: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM offline_queue WHERE seq = ?1", params![seq])
            .with_context(|| format!("failed to acknowledge queue entry {seq}"))?;
        Ok(())
    }

    /// Record a failed attempt and return the new attempt count.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn record_attempt_failure(&self, seq: i64, error: &str) -> Result<u32> {
        let attempts = self
            .conn
            .query_row(
                "UPDATE offline_queue SET attempts = attempts + 1, last_error = ?1
                 WHERE seq = ?2 RETURNING attempts",
                params![error, seq],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .with_context(|| format!("failed to record attempt for queue entry {seq}"))?
            .ok_or_else(|| anyhow!("queue entry {seq} not found"))?;
        Ok(u32::try_from(attempts).unwrap_or(u32::MAX))
    }

    /// # Errors
    /// Returns an error when the queue cannot be read.
    pub fn has_queued(&self, local_id: &LocalId) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM offline_queue WHERE local_id = ?1)",
                params![local_id.as_str()],
                |row| row.get::<_, bool>(0),
            )
            .with_context(|| format!("failed to look up queued mutations for {local_id}"))
    }

    /// Drop every queued mutation of a record that never reached the remote store.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn discard_queued_for(&self, local_id: &LocalId) -> Result<usize> {
        self.conn
            .execute("DELETE FROM offline_queue WHERE local_id = ?1", params![local_id.as_str()])
            .with_context(|| format!("failed to discard queued mutations for {local_id}"))
    }
}

fn insert_record_with(conn: &Connection, record: &EntityRecord) -> Result<()> {
    let body_json = serde_json::to_string(&record.body).context("failed to encode record body")?;
    conn.execute(
        "INSERT INTO local_records(
           local_id, kind, parent_local_id, remote_id, owner_id, body_json, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.header.local_id.as_str(),
            record.kind().as_str(),
            record.body.parent().map(LocalId::as_str),
            record.header.remote_id.as_ref().map(RemoteId::as_str),
            record.header.owner_id.as_ref().map(Identity::as_str),
            body_json,
            rfc3339(record.header.created_at)?,
            rfc3339(record.header.updated_at)?
        ],
    )
    .with_context(|| format!("failed to insert local record {}", record.header.local_id))?;
    Ok(())
}

fn apply_migration_2(conn: &Connection) -> Result<()> {
    if !table_has_column(conn, "offline_queue", "attempts")? {
        conn.execute_batch(
            "ALTER TABLE offline_queue ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;",
        )
        .context("failed to add offline_queue.attempts")?;
    }
    if !table_has_column(conn, "offline_queue", "last_error")? {
        conn.execute_batch("ALTER TABLE offline_queue ADD COLUMN last_error TEXT;")
            .context("failed to add offline_queue.last_error")?;
    }
    record_schema_version(conn, 2)
}
