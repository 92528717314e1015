use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex_lite::Regex;

use crate::error::ValidationError;
use crate::schema::{RiskLevel, SchemaChangeDescriptor, SchemaOperation};

const DROP_PATTERNS: [&str; 3] = [
    r"(?i)\bdrop\s+(table|column|index|view|trigger)\b",
    // SQLite accepts `ALTER TABLE t DROP c` without the COLUMN keyword.
    r"(?i)\balter\s+table\b[^;]*\bdrop\b",
    r"(?i)\btruncate\b",
];

struct StatementRules {
    drops: Vec<Regex>,
    delete_from: Regex,
    where_clause: Regex,
}

static RULES: Lazy<Option<StatementRules>> = Lazy::new(|| {
    let drops =
        DROP_PATTERNS.iter().map(|pattern| Regex::new(pattern)).collect::<Result<Vec<_>, _>>();
    Some(StatementRules {
        drops: drops.ok()?,
        delete_from: Regex::new(r"(?i)\bdelete\s+from\b").ok()?,
        where_clause: Regex::new(r"(?i)\bwhere\b").ok()?,
    })
});

/// Whether a free-form statement drops structure or deletes every row of a table.
///
/// Every statement counts as destructive if the rules failed to compile.
#[must_use]
pub fn is_destructive_statement(statement: &str) -> bool {
    let Some(rules) = RULES.as_ref() else {
        return true;
    };
    statement.split(';').any(|fragment| {
        if rules.drops.iter().any(|pattern| pattern.is_match(fragment)) {
            return true;
        }
        rules.delete_from.is_match(fragment) && !rules.where_clause.is_match(fragment)
    })
}

#[must_use]
pub fn is_destructive(operation: &SchemaOperation) -> bool {
    match operation {
        SchemaOperation::DropColumn { .. }
        | SchemaOperation::DropTable { .. }
        | SchemaOperation::DropIndex { .. } => true,
        SchemaOperation::Restructure { statements } => {
            statements.iter().any(|statement| is_destructive_statement(statement))
        }
        SchemaOperation::AddColumn { .. }
        | SchemaOperation::AddTable { .. }
        | SchemaOperation::AddIndex { .. }
        | SchemaOperation::ModifyColumn { .. }
        | SchemaOperation::RenameTable { .. } => false,
    }
}

/// Reject a destructive forward operation unless the descriptor is classified high risk.
///
/// # Errors
/// Returns [`ValidationError::UnguardedDestructive`] for a destructive forward operation
/// below [`RiskLevel::High`].
pub fn check_destructive(descriptor: &SchemaChangeDescriptor) -> Result<(), ValidationError> {
    if is_destructive(&descriptor.forward) && descriptor.risk_level != RiskLevel::High {
        return Err(ValidationError::UnguardedDestructive {
            version: descriptor.version,
            operation: descriptor.forward.describe(),
            risk_level: descriptor.risk_level,
        });
    }
    Ok(())
}

/// Validate a batch of descriptors before any of them executes.
///
/// # Errors
/// Returns the first [`ValidationError`] found: a repeated version, a forward operation
/// that does not match the declared change type, a malformed operation, or an unguarded
/// destructive change.
pub fn validate_descriptors<'a>(
    descriptors: impl IntoIterator<Item = &'a SchemaChangeDescriptor>,
) -> Result<(), ValidationError> {
    let mut seen = BTreeSet::new();
    for descriptor in descriptors {
        if !seen.insert(descriptor.version) {
            return Err(ValidationError::DuplicateVersion(descriptor.version));
        }
        if !descriptor.forward.matches(descriptor.change_type) {
            return Err(ValidationError::ChangeTypeMismatch {
                version: descriptor.version,
                change_type: descriptor.change_type,
                operation: descriptor.forward.describe(),
            });
        }
        check_operation_shape(descriptor)?;
        check_destructive(descriptor)?;
    }
    Ok(())
}

fn check_operation_shape(descriptor: &SchemaChangeDescriptor) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidOperation {
        version: descriptor.version,
        reason: reason.to_string(),
    };
    match &descriptor.forward {
        SchemaOperation::AddColumn { column, .. } if !column.nullable || column.primary_key => {
            Err(invalid("added columns MUST be nullable and not part of the primary key"))
        }
        SchemaOperation::AddTable { columns, .. } if columns.is_empty() => {
            Err(invalid("a new table MUST declare at least one column"))
        }
        SchemaOperation::AddIndex { columns, .. } if columns.is_empty() => {
            Err(invalid("an index MUST cover at least one column"))
        }
        SchemaOperation::Restructure { statements }
            if statements.iter().all(|statement| statement.trim().is_empty()) =>
        {
            Err(invalid("a restructure MUST carry at least one statement"))
        }
        _ => Ok(()),
    }
}
