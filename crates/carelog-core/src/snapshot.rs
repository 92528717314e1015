use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entity::{EntityKind, EntityRecord};
use crate::ids::{LocalId, RemoteId};

/// Best-known state of every record, grouped by kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct LocalSnapshot {
    records: BTreeMap<EntityKind, Vec<EntityRecord>>,
}

impl LocalSnapshot {
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = EntityRecord>) -> Self {
        let mut snapshot = Self::default();
        for record in records {
            snapshot.records.entry(record.kind()).or_default().push(record);
        }
        snapshot
    }

    #[must_use]
    pub fn records(&self, kind: EntityKind) -> &[EntityRecord] {
        self.records.get(&kind).map_or(&[], Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.values().flatten()
    }

    #[must_use]
    pub fn find(&self, local_id: &LocalId) -> Option<&EntityRecord> {
        self.iter().find(|record| record.local_id() == local_id)
    }

    #[must_use]
    pub fn find_remote(&self, remote_id: &RemoteId) -> Option<&EntityRecord> {
        self.iter().find(|record| record.header.remote_id.as_ref() == Some(remote_id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
