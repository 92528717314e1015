mod common;

use anyhow::{anyhow, Result};
use carelog_core::{
    ChangeType, ColumnDef, ColumnType, RemoteError, RiskLevel, RollbackOutcome,
    SchemaChangeDescriptor, SchemaError, SchemaOperation, SchemaVersion, ValidationError,
};
use carelog_sync::SchemaApplier;
use common::TestContext;

fn v(major: u32, minor: u32, patch: u32) -> SchemaVersion {
    SchemaVersion::new(major, minor, patch)
}

fn profiles_index() -> SchemaChangeDescriptor {
    SchemaChangeDescriptor {
        version: v(1, 0, 0),
        change_type: ChangeType::AddIndex,
        forward: SchemaOperation::AddIndex {
            table: "child_profiles".to_string(),
            name: "idx_profiles_owner".to_string(),
            columns: vec!["owner_id".to_string()],
            unique: false,
        },
        rollback: Some(SchemaOperation::DropIndex { name: "idx_profiles_owner".to_string() }),
        risk_level: RiskLevel::Low,
        requires_backup: false,
        description: "index profiles by owner".to_string(),
    }
}

fn add_nickname() -> SchemaChangeDescriptor {
    SchemaChangeDescriptor {
        version: v(1, 1, 0),
        change_type: ChangeType::AddColumn,
        forward: SchemaOperation::AddColumn {
            table: "child_profiles".to_string(),
            column: ColumnDef::new("nickname", ColumnType::Text),
        },
        rollback: Some(SchemaOperation::DropColumn {
            table: "child_profiles".to_string(),
            column: "nickname".to_string(),
        }),
        risk_level: RiskLevel::Low,
        requires_backup: false,
        description: "nickname for profiles".to_string(),
    }
}

fn add_care_notes() -> SchemaChangeDescriptor {
    SchemaChangeDescriptor {
        version: v(1, 2, 0),
        change_type: ChangeType::AddTable,
        forward: SchemaOperation::AddTable {
            table: "care_notes".to_string(),
            columns: vec![
                ColumnDef::new("id", ColumnType::Text).primary_key(),
                ColumnDef::new("owner_id", ColumnType::Text).required().references("identities"),
                ColumnDef::new("body", ColumnType::Text).required(),
            ],
        },
        rollback: Some(SchemaOperation::DropTable { table: "care_notes".to_string() }),
        risk_level: RiskLevel::Medium,
        requires_backup: true,
        description: "free-form care notes".to_string(),
    }
}

fn restructure(
    version: SchemaVersion,
    statement: &str,
    risk_level: RiskLevel,
) -> SchemaChangeDescriptor {
    SchemaChangeDescriptor {
        version,
        change_type: ChangeType::Restructure,
        forward: SchemaOperation::Restructure { statements: vec![statement.to_string()] },
        rollback: None,
        risk_level,
        requires_backup: false,
        description: "restructure".to_string(),
    }
}

#[tokio::test]
async fn applies_pending_changes_in_order_from_current_version() -> Result<()> {
    let ctx = TestContext::new()?;
    let local = ctx.local()?;
    let client = ctx.client();
    let applier = SchemaApplier::new(&local, &client);
    applier.apply_pending(&[profiles_index()]).await?;

    let catalog = vec![profiles_index(), add_nickname(), add_care_notes()];
    assert_eq!(applier.plan(&catalog)?, vec![v(1, 1, 0), v(1, 2, 0)]);
    let report = applier.apply_pending(&catalog).await?;

    assert_eq!(report.from_version, v(1, 0, 0));
    assert_eq!(report.to_version, v(1, 2, 0));
    assert_eq!(report.applied, vec![v(1, 1, 0), v(1, 2, 0)]);
    assert_eq!(report.backed_up, vec![v(1, 2, 0)]);
    assert_eq!(local.version_marker()?.current_schema_version, v(1, 2, 0));
    assert_eq!(local.applied_schema_versions()?, vec![v(1, 0, 0), v(1, 1, 0), v(1, 2, 0)]);

    assert!(ctx.remote.inner().columns("child_profiles")?.iter().any(|name| name == "nickname"));
    assert!(!ctx.remote.inner().columns("care_notes")?.is_empty());
    let Some(backup) = local.schema_backup(v(1, 2, 0))? else {
        return Err(anyhow!("no backup captured before the table change"));
    };
    assert!(backup.object("child_profiles").is_some());
    assert!(backup.object("care_notes").is_none());
    Ok(())
}

#[tokio::test]
async fn failed_change_rolls_back_once_and_keeps_last_good_version() -> Result<()> {
    let ctx = TestContext::new()?;
    let local = ctx.local()?;
    let client = ctx.client();
    let applier = SchemaApplier::new(&local, &client);
    applier.apply_pending(&[profiles_index()]).await?;

    let catalog = vec![profiles_index(), add_nickname(), add_care_notes()];
    ctx.remote.fail_call(
        "execute_schema_operation",
        2,
        RemoteError::Rejected("disk full".to_string()),
    );
    ctx.remote.clear_calls();

    let Err(err) = applier.apply_pending(&catalog).await else {
        return Err(anyhow!("schema change succeeded despite a failing forward step"));
    };
    let SchemaError::ForwardFailed { version, rollback, .. } = &err else {
        return Err(anyhow!("unexpected schema error: {err}"));
    };
    assert_eq!(*version, v(1, 2, 0));
    assert_eq!(*rollback, RollbackOutcome::Succeeded);
    assert!(!err.retryable());

    // 1.1.0 forward, 1.2.0 forward, 1.2.0 rollback.
    let calls = ctx.remote.calls();
    let schema_calls =
        calls.iter().filter(|call| call.op == "execute_schema_operation").collect::<Vec<_>>();
    assert_eq!(schema_calls.len(), 3);
    assert_eq!(schema_calls[2].table, "care_notes");
    assert_eq!(local.version_marker()?.current_schema_version, v(1, 1, 0));
    assert_eq!(local.applied_schema_versions()?, vec![v(1, 0, 0), v(1, 1, 0)]);

    let retried = applier.apply_pending(&catalog).await?;
    assert_eq!(retried.applied, vec![v(1, 2, 0)]);
    Ok(())
}

#[tokio::test]
async fn application_is_monotonic_regardless_of_declaration_order() -> Result<()> {
    let ctx = TestContext::new()?;
    let local = ctx.local()?;
    let client = ctx.client();
    let applier = SchemaApplier::new(&local, &client);

    let shuffled = vec![add_care_notes(), profiles_index(), add_nickname()];
    let report = applier.apply_pending(&shuffled).await?;
    assert_eq!(report.applied, vec![v(1, 0, 0), v(1, 1, 0), v(1, 2, 0)]);

    let mut late = add_nickname();
    late.version = v(1, 0, 5);
    let mut with_late = shuffled.clone();
    with_late.push(late);
    assert!(applier.plan(&with_late)?.is_empty());

    ctx.remote.clear_calls();
    let again = applier.apply_pending(&with_late).await?;
    assert!(again.applied.is_empty());
    assert_eq!(again.to_version, v(1, 2, 0));
    assert!(ctx.remote.calls().is_empty());

    let status = applier.status(&with_late)?;
    assert_eq!(status.current_version, v(1, 2, 0));
    assert_eq!(status.target_version, v(1, 2, 0));
    assert!(status.pending_versions.is_empty());
    Ok(())
}

#[tokio::test]
async fn unguarded_destructive_change_rejects_the_whole_batch() -> Result<()> {
    let ctx = TestContext::new()?;
    let local = ctx.local()?;
    let client = ctx.client();
    let applier = SchemaApplier::new(&local, &client);

    let catalog = vec![
        profiles_index(),
        restructure(v(1, 1, 0), "delete from observations", RiskLevel::Medium),
    ];
    let Err(err) = applier.apply_pending(&catalog).await else {
        return Err(anyhow!("destructive change was accepted"));
    };
    assert!(matches!(
        err,
        SchemaError::Validation(ValidationError::UnguardedDestructive { .. })
    ));
    assert_eq!(ctx.remote.count("execute_schema_operation"), 0);
    assert_eq!(local.version_marker()?.current_schema_version, SchemaVersion::ZERO);
    Ok(())
}

#[tokio::test]
async fn column_drop_without_column_keyword_is_still_guarded() -> Result<()> {
    let ctx = TestContext::new()?;
    let local = ctx.local()?;
    let client = ctx.client();
    let applier = SchemaApplier::new(&local, &client);
    applier.apply_pending(&[profiles_index()]).await?;

    let catalog = vec![
        profiles_index(),
        restructure(v(1, 1, 0), "ALTER TABLE child_profiles DROP notes", RiskLevel::Low),
    ];
    let Err(err) = applier.apply_pending(&catalog).await else {
        return Err(anyhow!("column drop was accepted at low risk"));
    };
    assert!(matches!(
        err,
        SchemaError::Validation(ValidationError::UnguardedDestructive { .. })
    ));
    assert!(ctx.remote.inner().columns("child_profiles")?.iter().any(|name| name == "notes"));
    assert_eq!(local.version_marker()?.current_schema_version, v(1, 0, 0));
    Ok(())
}

#[tokio::test]
async fn high_risk_destructive_change_runs() -> Result<()> {
    let ctx = TestContext::new()?;
    let local = ctx.local()?;
    let client = ctx.client();
    let applier = SchemaApplier::new(&local, &client);

    let catalog = vec![
        restructure(v(1, 0, 0), "CREATE TABLE scratch (id TEXT PRIMARY KEY)", RiskLevel::Low),
        restructure(v(1, 1, 0), "DROP TABLE scratch", RiskLevel::High),
    ];
    let report = applier.apply_pending(&catalog).await?;
    assert_eq!(report.to_version, v(1, 1, 0));
    assert!(ctx.remote.inner().columns("scratch")?.is_empty());
    Ok(())
}

#[tokio::test]
async fn unreachable_remote_fails_backup_before_any_change() -> Result<()> {
    let ctx = TestContext::new()?;
    let local = ctx.local()?;
    let client = ctx.client();
    let applier = SchemaApplier::new(&local, &client);
    applier.apply_pending(&[profiles_index(), add_nickname()]).await?;

    ctx.remote.set_offline(true);
    let Err(err) = applier.apply_pending(&[add_care_notes()]).await else {
        return Err(anyhow!("schema change succeeded while offline"));
    };
    assert!(matches!(err, SchemaError::Backup { .. }));
    assert!(err.is_remote_unavailable());
    assert!(err.retryable());
    assert_eq!(local.version_marker()?.current_schema_version, v(1, 1, 0));
    assert!(local.schema_backup(v(1, 2, 0))?.is_none());
    Ok(())
}
