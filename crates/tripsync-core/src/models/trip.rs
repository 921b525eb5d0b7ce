use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Trip {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub starts_on: Option<NaiveDate>,
    #[serde(default)]
    pub ends_on: Option<NaiveDate>,
    #[serde(default)]
    pub cover_image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trip {
    /// Apply a partial update in place. Fields left as `None` are untouched.
    pub fn apply(&mut self, patch: &TripPatch) {
        if let Some(ref name) = patch.name {
            self.name = name.clone();
        }
        if let Some(ref destination) = patch.destination {
            self.destination = Some(destination.clone());
        }
        if let Some(ref description) = patch.description {
            self.description = Some(description.clone());
        }
        if let Some(starts_on) = patch.starts_on {
            self.starts_on = Some(starts_on);
        }
        if let Some(ends_on) = patch.ends_on {
            self.ends_on = Some(ends_on);
        }
        if let Some(ref url) = patch.cover_image_url {
            self.cover_image_url = Some(url.clone());
        }
    }

    /// Number of calendar days the trip spans, inclusive of both ends.
    pub fn duration_days(&self) -> Option<i64> {
        match (self.starts_on, self.ends_on) {
            (Some(start), Some(end)) if end >= start => Some((end - start).num_days() + 1),
            _ => None,
        }
    }

    pub fn date_range_display(&self) -> String {
        match (self.starts_on, self.ends_on) {
            (Some(start), Some(end)) => crate::utils::format_date_range(start, end),
            (Some(start), None) => format!("from {}", start.format("%b %-d, %Y")),
            (None, Some(end)) => format!("until {}", end.format("%b %-d, %Y")),
            (None, None) => "Dates not set".to_string(),
        }
    }
}

/// Partial trip update. Serializes only the fields that are set so it can
/// be sent as a PATCH body directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct TripPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starts_on: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_on: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_image_url: Option<String>,
}

impl TripPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
