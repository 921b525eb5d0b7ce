use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest tag name accepted, in characters.
const MAX_TAG_LENGTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Tag {
    pub id: Uuid,
    pub trip_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Tag {
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.trim())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct NewTag {
    pub id: Uuid,
    pub trip_id: Uuid,
    pub name: String,
}

impl NewTag {
    pub fn to_tag(&self, now: DateTime<Utc>) -> Tag {
        Tag {
            id: self.id,
            trip_id: self.trip_id,
            name: self.name.clone(),
            created_at: now,
        }
    }
}

/// Trim and collapse inner whitespace. Returns `None` for empty or
/// over-long names.
pub fn normalize_tag_name(name: &str) -> Option<String> {
    let normalized = name.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() || normalized.chars().count() > MAX_TAG_LENGTH {
        None
    } else {
        Some(normalized)
    }
}
