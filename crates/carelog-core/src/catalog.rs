use crate::schema::{
    ChangeType, ColumnDef, ColumnType, RiskLevel, SchemaChangeDescriptor, SchemaOperation,
};
use crate::version::SchemaVersion;

fn index(table: &str, name: &str, columns: &[&str]) -> SchemaOperation {
    SchemaOperation::AddIndex {
        table: table.to_string(),
        name: name.to_string(),
        columns: columns.iter().map(ToString::to_string).collect(),
        unique: false,
    }
}

fn drop_index(name: &str) -> SchemaOperation {
    SchemaOperation::DropIndex { name: name.to_string() }
}

/// Schema changes shipped with this build, in ascending version order.
///
/// The baseline tables are provisioned by the remote store itself; every entry here is
/// applied on top of them.
#[must_use]
pub fn schema_catalog() -> Vec<SchemaChangeDescriptor> {
    vec![
        SchemaChangeDescriptor {
            version: SchemaVersion::new(1, 0, 0),
            change_type: ChangeType::AddIndex,
            forward: index("child_profiles", "idx_child_profiles_owner", &["owner_id"]),
            rollback: Some(drop_index("idx_child_profiles_owner")),
            risk_level: RiskLevel::Low,
            requires_backup: false,
            description: "index profiles by owner".to_string(),
        },
        SchemaChangeDescriptor {
            version: SchemaVersion::new(1, 1, 0),
            change_type: ChangeType::AddIndex,
            forward: index(
                "observations",
                "idx_observations_owner_observed",
                &["owner_id", "observed_at"],
            ),
            rollback: Some(drop_index("idx_observations_owner_observed")),
            risk_level: RiskLevel::Low,
            requires_backup: false,
            description: "index observations by owner and time".to_string(),
        },
        SchemaChangeDescriptor {
            version: SchemaVersion::new(1, 2, 0),
            change_type: ChangeType::AddColumn,
            forward: SchemaOperation::AddColumn {
                table: "child_profiles".to_string(),
                column: ColumnDef::new("avatar_url", ColumnType::Text),
            },
            rollback: Some(SchemaOperation::DropColumn {
                table: "child_profiles".to_string(),
                column: "avatar_url".to_string(),
            }),
            risk_level: RiskLevel::Low,
            requires_backup: false,
            description: "optional avatar for child profiles".to_string(),
        },
        SchemaChangeDescriptor {
            version: SchemaVersion::new(1, 3, 0),
            change_type: ChangeType::AddTable,
            forward: SchemaOperation::AddTable {
                table: "care_reminders".to_string(),
                columns: vec![
                    ColumnDef::new("id", ColumnType::Text).primary_key(),
                    ColumnDef::new("idempotency_key", ColumnType::Text).required().unique(),
                    ColumnDef::new("owner_id", ColumnType::Text)
                        .required()
                        .references("identities"),
                    ColumnDef::new("child_id", ColumnType::Text)
                        .required()
                        .references("child_profiles"),
                    ColumnDef::new("title", ColumnType::Text).required(),
                    ColumnDef::new("remind_at", ColumnType::Timestamp).required(),
                    ColumnDef::new("created_at", ColumnType::Timestamp).required(),
                    ColumnDef::new("updated_at", ColumnType::Timestamp).required(),
                ],
            },
            rollback: Some(SchemaOperation::DropTable { table: "care_reminders".to_string() }),
            risk_level: RiskLevel::Medium,
            requires_backup: true,
            description: "reminders attached to a child profile".to_string(),
        },
        SchemaChangeDescriptor {
            version: SchemaVersion::new(1, 3, 1),
            change_type: ChangeType::AddIndex,
            forward: index(
                "calendar_entries",
                "idx_calendar_entries_owner_scheduled",
                &["owner_id", "scheduled_for"],
            ),
            rollback: Some(drop_index("idx_calendar_entries_owner_scheduled")),
            risk_level: RiskLevel::Low,
            requires_backup: false,
            description: "index calendar entries by owner and time".to_string(),
        },
    ]
}

/// Highest version in the catalog, or zero when it is empty.
#[must_use]
pub fn catalog_target(descriptors: &[SchemaChangeDescriptor]) -> SchemaVersion {
    descriptors.iter().map(|descriptor| descriptor.version).max().unwrap_or(SchemaVersion::ZERO)
}
