use serde::{Deserialize, Serialize};

use crate::models::{Itinerary, Member, Tag, Trip};

/// One independently fetched and cached unit of trip data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slice {
    Trip,
    Itinerary,
    Members,
    Tags,
}

impl Slice {
    pub const ALL: [Slice; 4] = [Slice::Trip, Slice::Itinerary, Slice::Members, Slice::Tags];

    pub fn name(&self) -> &'static str {
        match self {
            Slice::Trip => "trip",
            Slice::Itinerary => "itinerary",
            Slice::Members => "members",
            Slice::Tags => "tags",
        }
    }

    /// Map a backend table to the slice whose cache it invalidates.
    pub fn for_table(table: &str) -> Option<Slice> {
        match table {
            "trips" => Some(Slice::Trip),
            "itinerary_sections" | "itinerary_items" => Some(Slice::Itinerary),
            "trip_members" => Some(Slice::Members),
            "trip_tags" => Some(Slice::Tags),
            _ => None,
        }
    }

    /// Backend tables feeding this slice.
    pub fn tables(&self) -> &'static [&'static str] {
        match self {
            Slice::Trip => &["trips"],
            Slice::Itinerary => &["itinerary_sections", "itinerary_items"],
            Slice::Members => &["trip_members"],
            Slice::Tags => &["trip_tags"],
        }
    }
}

impl std::fmt::Display for Slice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Data of one slice, as held by the store and persisted by the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "slice", content = "data", rename_all = "lowercase")]
pub enum SliceData {
    Trip(Trip),
    Itinerary(Itinerary),
    Members(Vec<Member>),
    Tags(Vec<Tag>),
}

impl SliceData {
    pub fn slice(&self) -> Slice {
        match self {
            SliceData::Trip(_) => Slice::Trip,
            SliceData::Itinerary(_) => Slice::Itinerary,
            SliceData::Members(_) => Slice::Members,
            SliceData::Tags(_) => Slice::Tags,
        }
    }

    pub fn as_trip_mut(&mut self) -> Option<&mut Trip> {
        match self {
            SliceData::Trip(trip) => Some(trip),
            _ => None,
        }
    }

    pub fn as_itinerary_mut(&mut self) -> Option<&mut Itinerary> {
        match self {
            SliceData::Itinerary(itinerary) => Some(itinerary),
            _ => None,
        }
    }

    pub fn as_members_mut(&mut self) -> Option<&mut Vec<Member>> {
        match self {
            SliceData::Members(members) => Some(members),
            _ => None,
        }
    }

    pub fn as_tags_mut(&mut self) -> Option<&mut Vec<Tag>> {
        match self {
            SliceData::Tags(tags) => Some(tags),
            _ => None,
        }
    }
}
