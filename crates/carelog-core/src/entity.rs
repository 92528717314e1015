use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::error::ValidationError;
use crate::ids::{Identity, LocalId, RemoteId};

/// The closed set of record kinds the engine synchronizes.
///
/// Declaration order is the processing order: the parent kind comes first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    ChildProfile,
    Observation,
    CalendarEntry,
    GrowthMemory,
}

impl EntityKind {
    pub const ALL: [Self; 4] =
        [Self::ChildProfile, Self::Observation, Self::CalendarEntry, Self::GrowthMemory];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChildProfile => "child_profile",
            Self::Observation => "observation",
            Self::CalendarEntry => "calendar_entry",
            Self::GrowthMemory => "growth_memory",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "child_profile" => Some(Self::ChildProfile),
            "observation" => Some(Self::Observation),
            "calendar_entry" => Some(Self::CalendarEntry),
            "growth_memory" => Some(Self::GrowthMemory),
            _ => None,
        }
    }

    /// Remote table holding rows of this kind.
    #[must_use]
    pub fn table(self) -> &'static str {
        match self {
            Self::ChildProfile => "child_profiles",
            Self::Observation => "observations",
            Self::CalendarEntry => "calendar_entries",
            Self::GrowthMemory => "growth_memories",
        }
    }

    #[must_use]
    pub fn is_dependent(self) -> bool {
        !matches!(self, Self::ChildProfile)
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChildProfile {
    pub name: String,
    #[serde(default)]
    pub birth_date: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Observation {
    pub child: LocalId,
    pub category: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CalendarEntry {
    pub child: LocalId,
    pub title: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_for: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GrowthMemory {
    pub child: LocalId,
    pub title: String,
    pub content: String,
    pub occurred_on: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "fields", rename_all = "snake_case")]
pub enum EntityBody {
    ChildProfile(ChildProfile),
    Observation(Observation),
    CalendarEntry(CalendarEntry),
    GrowthMemory(GrowthMemory),
}

impl EntityBody {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::ChildProfile(_) => EntityKind::ChildProfile,
            Self::Observation(_) => EntityKind::Observation,
            Self::CalendarEntry(_) => EntityKind::CalendarEntry,
            Self::GrowthMemory(_) => EntityKind::GrowthMemory,
        }
    }

    /// Local id of the owning profile, for dependent kinds.
    #[must_use]
    pub fn parent(&self) -> Option<&LocalId> {
        match self {
            Self::ChildProfile(_) => None,
            Self::Observation(body) => Some(&body.child),
            Self::CalendarEntry(body) => Some(&body.child),
            Self::GrowthMemory(body) => Some(&body.child),
        }
    }

    /// Validate the user-editable fields of a record body.
    ///
    /// # Errors
    /// Returns [`ValidationError::InvalidRecord`] when a required field is blank or a
    /// calendar date is not formatted as `YYYY-MM-DD`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::ChildProfile(profile) => {
                require_text(EntityKind::ChildProfile, "name", &profile.name)?;
                if let Some(birth_date) = &profile.birth_date {
                    require_date(EntityKind::ChildProfile, "birth_date", birth_date)?;
                }
            }
            Self::Observation(observation) => {
                require_text(EntityKind::Observation, "child", observation.child.as_str())?;
                require_text(EntityKind::Observation, "category", &observation.category)?;
            }
            Self::CalendarEntry(entry) => {
                require_text(EntityKind::CalendarEntry, "child", entry.child.as_str())?;
                require_text(EntityKind::CalendarEntry, "title", &entry.title)?;
            }
            Self::GrowthMemory(memory) => {
                require_text(EntityKind::GrowthMemory, "child", memory.child.as_str())?;
                require_text(EntityKind::GrowthMemory, "title", &memory.title)?;
                require_text(EntityKind::GrowthMemory, "content", &memory.content)?;
                require_date(EntityKind::GrowthMemory, "occurred_on", &memory.occurred_on)?;
            }
        }
        Ok(())
    }
}

fn require_text(kind: EntityKind, field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::InvalidRecord(format!("{kind}.{field} MUST be non-empty")));
    }
    Ok(())
}

fn require_date(kind: EntityKind, field: &str, value: &str) -> Result<(), ValidationError> {
    if parse_calendar_date(value).is_none() {
        return Err(ValidationError::InvalidRecord(format!(
            "{kind}.{field} MUST be a calendar date formatted as YYYY-MM-DD, got {value:?}"
        )));
    }
    Ok(())
}

fn parse_calendar_date(value: &str) -> Option<Date> {
    let format = time::format_description::parse("[year]-[month]-[day]").ok()?;
    Date::parse(value, &format).ok()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordHeader {
    pub local_id: LocalId,
    pub remote_id: Option<RemoteId>,
    pub owner_id: Option<Identity>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EntityRecord {
    pub header: RecordHeader,
    pub body: EntityBody,
}

impl EntityRecord {
    /// A record that exists only on this device.
    #[must_use]
    pub fn new_local(body: EntityBody, now: OffsetDateTime) -> Self {
        Self {
            header: RecordHeader {
                local_id: LocalId::generate(),
                remote_id: None,
                owner_id: None,
                created_at: now,
                updated_at: now,
            },
            body,
        }
    }

    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.body.kind()
    }

    #[must_use]
    pub fn local_id(&self) -> &LocalId {
        &self.header.local_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(1_700_000_000)
    }

    #[test]
    fn kind_names_round_trip_and_parent_comes_first() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityKind::ALL[0], EntityKind::ChildProfile);
        assert!(EntityKind::ALL.iter().skip(1).all(|kind| kind.is_dependent()));
        assert!(EntityKind::ChildProfile < EntityKind::Observation);
    }

    #[test]
    fn validate_rejects_blank_fields_and_bad_dates() {
        let blank_name = EntityBody::ChildProfile(ChildProfile {
            name: "  ".to_string(),
            birth_date: None,
            notes: None,
            avatar_url: None,
        });
        assert!(matches!(blank_name.validate(), Err(ValidationError::InvalidRecord(_))));

        let bad_date = EntityBody::GrowthMemory(GrowthMemory {
            child: LocalId::from("p1"),
            title: "First steps".to_string(),
            content: "Walked across the room".to_string(),
            occurred_on: "03/04/2024".to_string(),
        });
        assert!(bad_date.validate().is_err());

        let observation = EntityBody::Observation(Observation {
            child: LocalId::from("p1"),
            category: "sleep".to_string(),
            value: Some("9h".to_string()),
            notes: None,
            observed_at: fixture_time(),
        });
        assert!(observation.validate().is_ok());
        assert_eq!(observation.parent(), Some(&LocalId::from("p1")));
    }

    #[test]
    fn body_serializes_with_kind_tag() -> Result<(), serde_json::Error> {
        let body = EntityBody::ChildProfile(ChildProfile {
            name: "Ada".to_string(),
            birth_date: Some("2021-05-01".to_string()),
            notes: None,
            avatar_url: None,
        });
        let value = serde_json::to_value(&body)?;
        assert_eq!(value["kind"], "child_profile");
        assert_eq!(value["fields"]["name"], "Ada");
        assert!(value["fields"].get("avatar_url").is_none());
        assert_eq!(serde_json::from_value::<EntityBody>(value)?, body);
        Ok(())
    }
}
