//! Conversion between entity records and remote table rows.
//!
//! Bodies carry the parent profile by local id (`child`); remote rows carry the parent's
//! remote id (`child_id`). Header fields travel as reserved columns.

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::entity::{
    CalendarEntry, ChildProfile, EntityBody, EntityKind, EntityRecord, GrowthMemory, Observation,
    RecordHeader,
};
use crate::error::RowError;
use crate::ids::{Identity, LocalId, RemoteId};

/// A remote row, keyed by column name.
pub type RemoteRow = serde_json::Map<String, Value>;

pub const IDENTITY_TABLE: &str = "identities";
pub const ID_COLUMN: &str = "id";
pub const IDEMPOTENCY_KEY_COLUMN: &str = "idempotency_key";
pub const OWNER_COLUMN: &str = "owner_id";
pub const PARENT_COLUMN: &str = "child_id";
pub const CREATED_AT_COLUMN: &str = "created_at";
pub const UPDATED_AT_COLUMN: &str = "updated_at";
pub const AVATAR_URL_COLUMN: &str = "avatar_url";

const PARENT_FIELD: &str = "child";

/// Format a timestamp the way every remote row stores it.
///
/// # Errors
/// Returns [`RowError::Malformed`] when the timestamp cannot be represented in RFC 3339.
pub fn format_timestamp(value: OffsetDateTime) -> Result<String, RowError> {
    value.format(&Rfc3339).map_err(|err| RowError::Malformed(format!("timestamp: {err}")))
}

fn parse_timestamp(column: &'static str, value: &str) -> Result<OffsetDateTime, RowError> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| RowError::Malformed(format!("{column}: {err}")))
}

/// The writable columns of a body, with the parent reference resolved to a remote id.
///
/// # Errors
/// Returns [`RowError::MissingParent`] when a dependent body has no parent remote id, and
/// [`RowError::Malformed`] when the body cannot be encoded.
pub fn body_columns(
    body: &EntityBody,
    parent_remote: Option<&RemoteId>,
) -> Result<RemoteRow, RowError> {
    let encoded = match body {
        EntityBody::ChildProfile(profile) => serde_json::to_value(profile),
        EntityBody::Observation(observation) => serde_json::to_value(observation),
        EntityBody::CalendarEntry(entry) => serde_json::to_value(entry),
        EntityBody::GrowthMemory(memory) => serde_json::to_value(memory),
    }
    .map_err(|err| RowError::Malformed(err.to_string()))?;
    let Value::Object(mut columns) = encoded else {
        return Err(RowError::Malformed(format!("{} body is not an object", body.kind())));
    };

    if body.kind().is_dependent() {
        columns.remove(PARENT_FIELD);
        let parent = parent_remote.ok_or(RowError::MissingParent(body.kind()))?;
        columns.insert(PARENT_COLUMN.to_string(), Value::String(parent.to_string()));
    }
    Ok(columns)
}

/// Full row for a first-time insert of `record` under `owner`.
///
/// # Errors
/// See [`body_columns`] and [`format_timestamp`].
pub fn insert_row(
    record: &EntityRecord,
    owner: &Identity,
    idempotency_key: &str,
    parent_remote: Option<&RemoteId>,
) -> Result<RemoteRow, RowError> {
    let mut row = body_columns(&record.body, parent_remote)?;
    row.insert(IDEMPOTENCY_KEY_COLUMN.to_string(), Value::String(idempotency_key.to_string()));
    row.insert(OWNER_COLUMN.to_string(), Value::String(owner.to_string()));
    row.insert(
        CREATED_AT_COLUMN.to_string(),
        Value::String(format_timestamp(record.header.created_at)?),
    );
    row.insert(
        UPDATED_AT_COLUMN.to_string(),
        Value::String(format_timestamp(record.header.updated_at)?),
    );
    Ok(row)
}

/// Columns sent when an existing remote row is overwritten with a newer body.
///
/// Inserts omit an unset profile avatar, since the column arrives with schema 1.2.0 and
/// migration runs before it. Updates always carry it so a cleared avatar reaches the row.
///
/// # Errors
/// See [`body_columns`] and [`format_timestamp`].
pub fn update_columns(
    body: &EntityBody,
    parent_remote: Option<&RemoteId>,
    updated_at: OffsetDateTime,
) -> Result<RemoteRow, RowError> {
    let mut row = body_columns(body, parent_remote)?;
    if matches!(body, EntityBody::ChildProfile(_)) {
        row.entry(AVATAR_URL_COLUMN).or_insert(Value::Null);
    }
    row.insert(UPDATED_AT_COLUMN.to_string(), Value::String(format_timestamp(updated_at)?));
    Ok(row)
}

fn text_column<'a>(row: &'a RemoteRow, column: &'static str) -> Result<&'a str, RowError> {
    row.get(column).and_then(Value::as_str).ok_or(RowError::MissingColumn(column))
}

/// Remote id carried by a row.
///
/// # Errors
/// Returns [`RowError::MissingColumn`] when the row has no textual `id`.
pub fn row_id(row: &RemoteRow) -> Result<RemoteId, RowError> {
    text_column(row, ID_COLUMN).map(RemoteId::from)
}

/// Remote id of the parent profile referenced by a dependent row.
#[must_use]
pub fn row_parent(row: &RemoteRow) -> Option<RemoteId> {
    row.get(PARENT_COLUMN).and_then(Value::as_str).map(RemoteId::from)
}

/// Rebuild a local record from a pulled row.
///
/// `parent_local` is the local id of the row's parent profile and is required for
/// dependent kinds.
///
/// # Errors
/// Returns a [`RowError`] when reserved columns are missing or the row does not decode
/// into a body of `kind`.
pub fn record_from_row(
    kind: EntityKind,
    row: &RemoteRow,
    local_id: LocalId,
    parent_local: Option<LocalId>,
) -> Result<EntityRecord, RowError> {
    let remote_id = row_id(row)?;
    let owner = text_column(row, OWNER_COLUMN)?;
    let created_at = parse_timestamp(CREATED_AT_COLUMN, text_column(row, CREATED_AT_COLUMN)?)?;
    let updated_at = match row.get(UPDATED_AT_COLUMN).and_then(Value::as_str) {
        Some(value) => parse_timestamp(UPDATED_AT_COLUMN, value)?,
        None => created_at,
    };

    let mut fields = row.clone();
    for reserved in [
        ID_COLUMN,
        IDEMPOTENCY_KEY_COLUMN,
        OWNER_COLUMN,
        PARENT_COLUMN,
        CREATED_AT_COLUMN,
        UPDATED_AT_COLUMN,
    ] {
        fields.remove(reserved);
    }
    if kind.is_dependent() {
        let parent = parent_local.ok_or(RowError::MissingParent(kind))?;
        fields.insert(PARENT_FIELD.to_string(), Value::String(parent.0));
    }

    let fields = Value::Object(fields);
    let decoded = match kind {
        EntityKind::ChildProfile => {
            serde_json::from_value::<ChildProfile>(fields).map(EntityBody::ChildProfile)
        }
        EntityKind::Observation => {
            serde_json::from_value::<Observation>(fields).map(EntityBody::Observation)
        }
        EntityKind::CalendarEntry => {
            serde_json::from_value::<CalendarEntry>(fields).map(EntityBody::CalendarEntry)
        }
        EntityKind::GrowthMemory => {
            serde_json::from_value::<GrowthMemory>(fields).map(EntityBody::GrowthMemory)
        }
    };
    let body =
        decoded.map_err(|err| RowError::Malformed(format!("{kind} row {remote_id}: {err}")))?;

    Ok(EntityRecord {
        header: RecordHeader {
            local_id,
            remote_id: Some(remote_id),
            owner_id: Some(Identity(owner.to_string())),
            created_at,
            updated_at,
        },
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::idempotency_key;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(1_700_000_000)
    }

    fn observation_record() -> EntityRecord {
        EntityRecord {
            header: RecordHeader {
                local_id: LocalId::from("o1"),
                remote_id: None,
                owner_id: None,
                created_at: fixture_time(),
                updated_at: fixture_time(),
            },
            body: EntityBody::Observation(Observation {
                child: LocalId::from("p1"),
                category: "sleep".to_string(),
                value: Some("9h".to_string()),
                notes: None,
                observed_at: fixture_time(),
            }),
        }
    }

    #[test]
    fn dependent_insert_row_swaps_local_parent_for_remote_id() -> Result<(), RowError> {
        let owner = Identity("U1".to_string());
        let record = observation_record();
        let key = idempotency_key(EntityKind::Observation, record.local_id(), &owner);
        let row = insert_row(&record, &owner, &key, Some(&RemoteId::from("R1")))?;

        assert_eq!(row.get(PARENT_COLUMN), Some(&Value::String("R1".to_string())));
        assert!(row.get(PARENT_FIELD).is_none());
        assert_eq!(row.get(OWNER_COLUMN), Some(&Value::String("U1".to_string())));
        assert_eq!(row.get(IDEMPOTENCY_KEY_COLUMN), Some(&Value::String(key)));
        Ok(())
    }

    #[test]
    fn profile_update_clears_avatar_that_inserts_omit() -> Result<(), RowError> {
        let owner = Identity("U1".to_string());
        let body = EntityBody::ChildProfile(ChildProfile {
            name: "Ada".to_string(),
            birth_date: None,
            notes: None,
            avatar_url: None,
        });
        let record = EntityRecord::new_local(body.clone(), fixture_time());
        let key = idempotency_key(EntityKind::ChildProfile, record.local_id(), &owner);

        let inserted = insert_row(&record, &owner, &key, None)?;
        assert!(inserted.get(AVATAR_URL_COLUMN).is_none());
        assert_eq!(inserted.get("notes"), Some(&Value::Null));

        let updated = update_columns(&body, None, fixture_time())?;
        assert_eq!(updated.get(AVATAR_URL_COLUMN), Some(&Value::Null));
        Ok(())
    }

    #[test]
    fn dependent_without_parent_is_rejected() {
        let record = observation_record();
        assert_eq!(
            body_columns(&record.body, None),
            Err(RowError::MissingParent(EntityKind::Observation))
        );
    }

    #[test]
    fn pulled_row_maps_back_to_local_parent() -> Result<(), RowError> {
        let owner = Identity("U1".to_string());
        let record = observation_record();
        let mut row = insert_row(&record, &owner, "key", Some(&RemoteId::from("R1")))?;
        row.insert(ID_COLUMN.to_string(), Value::String("R9".to_string()));
        row.insert("unknown_future_column".to_string(), Value::Bool(true));

        let pulled = record_from_row(
            EntityKind::Observation,
            &row,
            LocalId::from("o1"),
            Some(LocalId::from("p1")),
        )?;
        assert_eq!(pulled.header.remote_id, Some(RemoteId::from("R9")));
        assert_eq!(pulled.header.owner_id, Some(owner));
        assert_eq!(pulled.body, record.body);
        Ok(())
    }

    #[test]
    fn row_without_id_is_rejected() {
        let row = RemoteRow::new();
        assert_eq!(row_id(&row), Err(RowError::MissingColumn(ID_COLUMN)));
    }
}
