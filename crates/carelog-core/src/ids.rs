use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;

use crate::entity::EntityKind;

/// Device-local identifier of a record. Stable for the lifetime of the local database.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct LocalId(pub String);

impl LocalId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LocalId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Display for LocalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier assigned by the remote store on insert.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RemoteId(pub String);

impl RemoteId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RemoteId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&Identity> for RemoteId {
    fn from(value: &Identity) -> Self {
        Self(value.0.clone())
    }
}

impl Display for RemoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable remote identity that owns every record this device writes.
///
/// It is the remote id of the device's row in the `identities` table.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Identity(pub String);

impl Identity {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<RemoteId> for Identity {
    fn from(value: RemoteId) -> Self {
        Self(value.0)
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token generated once per local database, used as the idempotency key when the
/// device registers its identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceToken(pub Ulid);

impl DeviceToken {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok().map(Self)
    }
}

impl Default for DeviceToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DeviceToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic key attached to every remote insert of a record.
///
/// The same `(kind, local id, owner)` triple always yields the same key, so a retried
/// insert resolves to the row created the first time.
#[must_use]
pub fn idempotency_key(kind: EntityKind, local_id: &LocalId, owner: &Identity) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(local_id.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(owner.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_stable_per_owner_and_kind() {
        let owner = Identity("01J0IDENTITY".to_string());
        let other_owner = Identity("01J0OTHER".to_string());
        let local = LocalId::from("p1");

        let first = idempotency_key(EntityKind::ChildProfile, &local, &owner);
        assert_eq!(first, idempotency_key(EntityKind::ChildProfile, &local, &owner));
        assert_eq!(first.len(), 64);
        assert_ne!(first, idempotency_key(EntityKind::Observation, &local, &owner));
        assert_ne!(first, idempotency_key(EntityKind::ChildProfile, &local, &other_owner));
    }

    #[test]
    fn device_token_parses_its_display_form() {
        let token = DeviceToken::new();
        assert_eq!(DeviceToken::parse(&token.to_string()), Some(token));
        assert_eq!(DeviceToken::parse("not-a-ulid"), None);
    }
}
