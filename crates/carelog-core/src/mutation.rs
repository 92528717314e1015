use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::entity::{EntityBody, EntityKind};
use crate::ids::{LocalId, RemoteId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

impl MutationOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// A user-initiated change to one record.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    Create(EntityBody),
    Update { local_id: LocalId, body: EntityBody },
    Delete { kind: EntityKind, local_id: LocalId },
}

impl Mutation {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Create(body) | Self::Update { body, .. } => body.kind(),
            Self::Delete { kind, .. } => *kind,
        }
    }
}

/// A mutation waiting for its remote write, before the queue has assigned it a slot.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MutationEnvelope {
    pub kind: EntityKind,
    pub op: MutationOp,
    pub local_id: LocalId,
    pub remote_id: Option<RemoteId>,
    pub payload: Option<EntityBody>,
}

/// A durable entry of the offline queue.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct QueuedMutation {
    pub seq: i64,
    pub kind: EntityKind,
    pub op: MutationOp,
    pub local_id: LocalId,
    pub remote_id: Option<RemoteId>,
    pub payload: Option<EntityBody>,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl QueuedMutation {
    #[must_use]
    pub fn envelope(&self) -> MutationEnvelope {
        MutationEnvelope {
            kind: self.kind,
            op: self.op,
            local_id: self.local_id.clone(),
            remote_id: self.remote_id.clone(),
            payload: self.payload.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Written to the remote store before `mutate` returned.
    Mirrored,
    /// Waiting in the offline queue.
    Queued,
    /// Kept on this device only.
    LocalOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MutationReceipt {
    pub kind: EntityKind,
    pub local_id: LocalId,
    pub disposition: Disposition,
    /// Remote failure that sent the mutation to the queue, if any.
    pub remote_error: Option<String>,
}
