mod common;

use anyhow::{anyhow, Result};
use carelog_core::row::row_parent;
use carelog_core::{
    EntityBody, EntityKind, EntityRecord, Identity, MutationEnvelope, MutationOp, RemoteError,
    RemoteStore, SyncError,
};
use carelog_store_sqlite::LocalStore;
use carelog_sync::{MigrationOrchestrator, OfflineQueue, RemoteClient};
use common::{observation, profile, record, TestContext};

async fn migrated(local: &LocalStore, client: &RemoteClient) -> Result<Identity> {
    let report = MigrationOrchestrator::new(local, client).migrate().await?;
    report.identity.ok_or_else(|| anyhow!("migration resolved no identity"))
}

fn create(record: &EntityRecord) -> MutationEnvelope {
    MutationEnvelope {
        kind: record.kind(),
        op: MutationOp::Create,
        local_id: record.local_id().clone(),
        remote_id: None,
        payload: Some(record.body.clone()),
    }
}

fn update(record: &EntityRecord, body: EntityBody) -> MutationEnvelope {
    MutationEnvelope {
        kind: record.kind(),
        op: MutationOp::Update,
        local_id: record.local_id().clone(),
        remote_id: record.header.remote_id.clone(),
        payload: Some(body),
    }
}

fn bound(local: &LocalStore, record: &EntityRecord) -> Result<EntityRecord> {
    local.record(record.local_id())?.ok_or_else(|| anyhow!("record {} missing", record.local_id()))
}

#[tokio::test]
async fn drain_sends_parents_first_and_binds_created_records() -> Result<()> {
    let ctx = TestContext::new()?;
    let local = ctx.local()?;
    let client = ctx.client();
    let identity = migrated(&local, &client).await?;

    let parent = record(profile("Ada"));
    let child = record(observation(parent.local_id(), "sleep"));
    local.insert_record(&parent)?;
    local.insert_record(&child)?;

    let queue = OfflineQueue::new(&local, &client);
    queue.enqueue(&create(&child))?;
    queue.enqueue(&create(&parent))?;
    let report = queue.drain(&identity).await?;

    assert_eq!(report.applied, 2);
    assert!(queue.is_empty()?);
    let parent_remote = bound(&local, &parent)?.header.remote_id;
    assert!(parent_remote.is_some());
    assert!(bound(&local, &child)?.header.remote_id.is_some());

    let rows = ctx.remote.select_all("observations", &identity).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(row_parent(&rows[0]), parent_remote);
    Ok(())
}

#[tokio::test]
async fn failing_entry_holds_back_only_its_own_kind() -> Result<()> {
    let ctx = TestContext::new()?;
    let existing = record(profile("Bea"));
    let existing_obs = record(observation(existing.local_id(), "meal"));
    ctx.seed(&[existing.clone(), existing_obs.clone()])?;

    let local = ctx.local()?;
    let client = ctx.client();
    let identity = migrated(&local, &client).await?;
    let existing_obs = bound(&local, &existing_obs)?;

    let first = record(profile("Cy"));
    let second = record(profile("Dee"));
    local.insert_record(&first)?;
    local.insert_record(&second)?;

    let queue = OfflineQueue::new(&local, &client);
    let first_seq = queue.enqueue(&create(&first))?;
    queue.enqueue(&create(&second))?;
    queue.enqueue(&update(&existing_obs, observation(existing.local_id(), "snack")))?;

    ctx.remote.fail_call("insert", 1, RemoteError::Rejected("name too long".to_string()));
    let Err(SyncError::DrainIncomplete { applied, remaining, last_error, unreachable }) =
        queue.drain(&identity).await
    else {
        return Err(anyhow!("drain should stop at the rejected profile"));
    };
    assert_eq!(applied, 1);
    assert_eq!(remaining, 2);
    assert!(last_error.is_some_and(|reason| reason.contains("name too long")));
    assert!(!unreachable);

    let queued = local.queued()?;
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[0].seq, first_seq);
    assert_eq!(queued[0].attempts, 1);
    assert!(queued[0].last_error.is_some());
    assert_eq!(queued[1].attempts, 0);

    let report = queue.drain(&identity).await?;
    assert_eq!(report.applied, 2);
    assert_eq!(ctx.remote.rows("child_profiles"), 3);
    Ok(())
}

#[tokio::test]
async fn unreachable_remote_stops_the_whole_drain() -> Result<()> {
    let ctx = TestContext::new()?;
    let local = ctx.local()?;
    let client = ctx.client();
    let identity = migrated(&local, &client).await?;

    let parent = record(profile("Ada"));
    let other = record(profile("Bo"));
    local.insert_record(&parent)?;
    local.insert_record(&other)?;
    let queue = OfflineQueue::new(&local, &client);
    queue.enqueue(&create(&parent))?;
    queue.enqueue(&create(&other))?;

    ctx.remote.set_offline(true);
    ctx.remote.clear_calls();
    let Err(err) = queue.drain(&identity).await else {
        return Err(anyhow!("drain succeeded while offline"));
    };
    assert!(matches!(
        err,
        SyncError::DrainIncomplete { applied: 0, remaining: 2, unreachable: true, .. }
    ));
    assert!(err.is_remote_unavailable());
    assert!(err.retryable());
    assert_eq!(ctx.remote.calls().len(), 1);
    assert_eq!(local.queued()?[0].attempts, 1);
    Ok(())
}

#[tokio::test]
async fn dependent_create_waits_for_its_parent_without_counting_attempts() -> Result<()> {
    let ctx = TestContext::new()?;
    let local = ctx.local()?;
    let client = ctx.client();
    let identity = migrated(&local, &client).await?;

    let parent = record(profile("Ada"));
    let child = record(observation(parent.local_id(), "sleep"));
    local.insert_record(&parent)?;
    local.insert_record(&child)?;
    let queue = OfflineQueue::new(&local, &client);
    queue.enqueue(&create(&parent))?;
    queue.enqueue(&create(&child))?;

    ctx.remote.fail_call("insert", 1, RemoteError::Rejected("try later".to_string()));
    let Err(SyncError::DrainIncomplete { remaining, .. }) = queue.drain(&identity).await else {
        return Err(anyhow!("drain should be incomplete"));
    };
    assert_eq!(remaining, 2);
    let waiting = local.queued_for_kind(EntityKind::Observation)?;
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].attempts, 0);
    assert_eq!(ctx.remote.rows("observations"), 0);

    queue.drain(&identity).await?;
    assert_eq!(ctx.remote.rows("observations"), 1);
    Ok(())
}

#[tokio::test]
async fn rows_already_gone_remotely_count_as_acknowledged() -> Result<()> {
    let ctx = TestContext::new()?;
    let parent = record(profile("Ada"));
    let child = record(observation(parent.local_id(), "sleep"));
    ctx.seed(&[parent.clone(), child.clone()])?;

    let local = ctx.local()?;
    let client = ctx.client();
    let identity = migrated(&local, &client).await?;
    let child = bound(&local, &child)?;
    let Some(child_remote) = child.header.remote_id.clone() else {
        return Err(anyhow!("observation was not migrated"));
    };
    ctx.remote.inner().delete("observations", &child_remote).await?;

    let queue = OfflineQueue::new(&local, &client);
    queue.enqueue(&update(&child, observation(parent.local_id(), "nap")))?;
    queue.enqueue(&MutationEnvelope {
        kind: EntityKind::Observation,
        op: MutationOp::Delete,
        local_id: child.local_id().clone(),
        remote_id: Some(child_remote),
        payload: None,
    })?;

    let report = queue.drain(&identity).await?;
    assert_eq!(report.applied, 0);
    assert_eq!(report.already_gone, 2);
    assert!(queue.is_empty()?);
    Ok(())
}

#[tokio::test]
async fn queued_entries_survive_a_restart() -> Result<()> {
    let ctx = TestContext::new()?;
    let parent = record(profile("Ada"));
    {
        let local = ctx.local()?;
        local.insert_record(&parent)?;
        let client = ctx.client();
        OfflineQueue::new(&local, &client).enqueue(&create(&parent))?;
    }

    let reopened = ctx.local()?;
    let queued = reopened.queued()?;
    assert_eq!(queued.len(), 1);
    assert_eq!(&queued[0].local_id, parent.local_id());
    assert_eq!(queued[0].payload.as_ref(), Some(&parent.body));
    Ok(())
}
