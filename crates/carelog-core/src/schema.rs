use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::version::SchemaVersion;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    AddColumn,
    AddTable,
    AddIndex,
    ModifyColumn,
    DropColumn,
    RenameTable,
    Restructure,
}

impl ChangeType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddColumn => "add_column",
            Self::AddTable => "add_table",
            Self::AddIndex => "add_index",
            Self::ModifyColumn => "modify_column",
            Self::DropColumn => "drop_column",
            Self::RenameTable => "rename_table",
            Self::Restructure => "restructure",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
    Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
    /// Referenced table; the reference targets its `id` column and cascades on delete.
    #[serde(default)]
    pub references: Option<String>,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    #[must_use]
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            nullable: true,
            primary_key: false,
            unique: false,
            references: None,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    #[must_use]
    pub fn references(mut self, table: &str) -> Self {
        self.references = Some(table.to_string());
        self
    }
}

/// A typed structural change, interpreted by a store-specific executor.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaOperation {
    AddColumn { table: String, column: ColumnDef },
    AddTable { table: String, columns: Vec<ColumnDef> },
    AddIndex { table: String, name: String, columns: Vec<String>, unique: bool },
    ModifyColumn { table: String, column: ColumnDef },
    DropColumn { table: String, column: String },
    DropTable { table: String },
    DropIndex { name: String },
    RenameTable { from: String, to: String },
    Restructure { statements: Vec<String> },
}

impl SchemaOperation {
    /// Whether this operation is an acceptable forward step for a descriptor of the
    /// given change type. Table and index drops are only expressible as restructures.
    #[must_use]
    pub fn matches(&self, change_type: ChangeType) -> bool {
        match self {
            Self::AddColumn { .. } => change_type == ChangeType::AddColumn,
            Self::AddTable { .. } => change_type == ChangeType::AddTable,
            Self::AddIndex { .. } => change_type == ChangeType::AddIndex,
            Self::ModifyColumn { .. } => change_type == ChangeType::ModifyColumn,
            Self::DropColumn { .. } => change_type == ChangeType::DropColumn,
            Self::RenameTable { .. } => change_type == ChangeType::RenameTable,
            Self::DropTable { .. } | Self::DropIndex { .. } | Self::Restructure { .. } => {
                change_type == ChangeType::Restructure
            }
        }
    }

    /// Primary table touched by the operation, when there is a single one.
    #[must_use]
    pub fn table(&self) -> Option<&str> {
        match self {
            Self::AddColumn { table, .. }
            | Self::AddTable { table, .. }
            | Self::AddIndex { table, .. }
            | Self::ModifyColumn { table, .. }
            | Self::DropColumn { table, .. }
            | Self::DropTable { table } => Some(table),
            Self::RenameTable { from, .. } => Some(from),
            Self::DropIndex { .. } | Self::Restructure { .. } => None,
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::AddColumn { table, column } => format!("add column {table}.{}", column.name),
            Self::AddTable { table, .. } => format!("add table {table}"),
            Self::AddIndex { table, name, .. } => format!("add index {name} on {table}"),
            Self::ModifyColumn { table, column } => {
                format!("modify column {table}.{}", column.name)
            }
            Self::DropColumn { table, column } => format!("drop column {table}.{column}"),
            Self::DropTable { table } => format!("drop table {table}"),
            Self::DropIndex { name } => format!("drop index {name}"),
            Self::RenameTable { from, to } => format!("rename table {from} to {to}"),
            Self::Restructure { statements } => {
                format!("restructure ({} statement(s))", statements.len())
            }
        }
    }
}

/// One versioned, risk-classified change to the remote schema.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SchemaChangeDescriptor {
    pub version: SchemaVersion,
    pub change_type: ChangeType,
    pub forward: SchemaOperation,
    pub rollback: Option<SchemaOperation>,
    pub risk_level: RiskLevel,
    pub requires_backup: bool,
    pub description: String,
}

/// One object of the remote schema as reported by the store.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SchemaObject {
    pub object_type: String,
    pub name: String,
    pub table: String,
    pub definition: String,
}

/// Remote schema metadata captured before a change that requires a backup.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SchemaSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
    pub objects: Vec<SchemaObject>,
}

impl SchemaSnapshot {
    #[must_use]
    pub fn object(&self, name: &str) -> Option<&SchemaObject> {
        self.objects.iter().find(|object| object.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SchemaStatus {
    pub current_version: SchemaVersion,
    pub target_version: SchemaVersion,
    pub pending_versions: Vec<SchemaVersion>,
}

/// Descriptors with a version strictly above `current`, in ascending version order.
#[must_use]
pub fn pending_descriptors(
    current: SchemaVersion,
    descriptors: &[SchemaChangeDescriptor],
) -> Vec<&SchemaChangeDescriptor> {
    let mut pending =
        descriptors.iter().filter(|descriptor| descriptor.version > current).collect::<Vec<_>>();
    pending.sort_by_key(|descriptor| descriptor.version);
    pending
}
