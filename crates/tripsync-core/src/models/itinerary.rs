//! Itinerary sections and items.
//!
//! Rows are kept in the shape the backend returns them. Ordering inside a
//! section is by `(position, created_at)`; positions written by this crate
//! are always dense (`0..n`) within the sections it touches, but rows
//! written by other clients may leave gaps, which is fine.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ItineraryError {
    #[error("Unknown itinerary item: {0}")]
    UnknownItem(Uuid),

    #[error("Unknown itinerary section: {0}")]
    UnknownSection(Uuid),

    #[error("Itinerary item already exists: {0}")]
    DuplicateItem(Uuid),

    #[error("Itinerary section already exists: {0}")]
    DuplicateSection(Uuid),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Section {
    pub id: Uuid,
    pub trip_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub day: Option<NaiveDate>,
    pub position: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct NewSection {
    pub id: Uuid,
    pub trip_id: Uuid,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day: Option<NaiveDate>,
    pub position: i32,
}

impl NewSection {
    /// The row as it is expected to come back from the server.
    pub fn to_section(&self, now: DateTime<Utc>) -> Section {
        Section {
            id: self.id,
            trip_id: self.trip_id,
            title: self.title.clone(),
            day: self.day,
            position: self.position,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SectionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Item {
    pub id: Uuid,
    pub trip_id: Uuid,
    pub section_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    pub position: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn apply(&mut self, patch: &ItemPatch) {
        if let Some(ref title) = patch.title {
            self.title = title.clone();
        }
        if let Some(ref notes) = patch.notes {
            self.notes = Some(notes.clone());
        }
        if let Some(ref location) = patch.location {
            self.location = Some(location.clone());
        }
        if let Some(starts_at) = patch.starts_at {
            self.starts_at = Some(starts_at);
        }
        if let Some(ends_at) = patch.ends_at {
            self.ends_at = Some(ends_at);
        }
    }

    /// "09:30" / "09:30-11:00" / empty when no time is set.
    pub fn time_display(&self) -> String {
        match (self.starts_at, self.ends_at) {
            (Some(start), Some(end)) => {
                format!("{}-{}", start.format("%H:%M"), end.format("%H:%M"))
            }
            (Some(start), None) => start.format("%H:%M").to_string(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct NewItem {
    pub id: Uuid,
    pub trip_id: Uuid,
    pub section_id: Uuid,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
    pub position: i32,
}

impl NewItem {
    pub fn to_item(&self, now: DateTime<Utc>) -> Item {
        Item {
            id: self.id,
            trip_id: self.trip_id,
            section_id: self.section_id,
            title: self.title.clone(),
            notes: self.notes.clone(),
            location: self.location.clone(),
            starts_at: self.starts_at,
            ends_at: self.ends_at,
            position: self.position,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ItemPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
}

/// One row of a reorder request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ItemPosition {
    pub id: Uuid,
    pub section_id: Uuid,
    pub position: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SectionPosition {
    pub id: Uuid,
    pub position: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Itinerary {
    pub sections: Vec<Section>,
    pub items: Vec<Item>,
}

impl Itinerary {
    /// Build from raw rows, sorting sections and items into display order.
    pub fn from_rows(sections: Vec<Section>, items: Vec<Item>) -> Self {
        let mut itinerary = Self { sections, items };
        itinerary.sort();
        itinerary
    }

    pub fn sort(&mut self) {
        self.sections
            .sort_by(|a, b| (a.position, a.created_at).cmp(&(b.position, b.created_at)));
        self.items
            .sort_by(|a, b| (a.position, a.created_at).cmp(&(b.position, b.created_at)));
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty() && self.items.is_empty()
    }

    pub fn section(&self, id: Uuid) -> Option<&Section> {
        self.sections.iter().find(|s| s.id == id)
    }

    pub fn item(&self, id: Uuid) -> Option<&Item> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Items of one section in display order.
    pub fn items_in(&self, section_id: Uuid) -> Vec<&Item> {
        let mut items: Vec<&Item> = self
            .items
            .iter()
            .filter(|i| i.section_id == section_id)
            .collect();
        items.sort_by(|a, b| (a.position, a.created_at).cmp(&(b.position, b.created_at)));
        items
    }

    /// Sections in display order, each paired with its ordered items.
    pub fn grouped(&self) -> Vec<(&Section, Vec<&Item>)> {
        let mut sections: Vec<&Section> = self.sections.iter().collect();
        sections.sort_by(|a, b| (a.position, a.created_at).cmp(&(b.position, b.created_at)));
        sections
            .into_iter()
            .map(|s| (s, self.items_in(s.id)))
            .collect()
    }

    /// Position for an item appended to the end of a section.
    pub fn next_item_position(&self, section_id: Uuid) -> i32 {
        self.items
            .iter()
            .filter(|i| i.section_id == section_id)
            .map(|i| i.position + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn next_section_position(&self) -> i32 {
        self.sections
            .iter()
            .map(|s| s.position + 1)
            .max()
            .unwrap_or(0)
    }

    // ===== Items =====

    pub fn insert_item(&mut self, item: Item) -> Result<(), ItineraryError> {
        if self.section(item.section_id).is_none() {
            return Err(ItineraryError::UnknownSection(item.section_id));
        }
        if self.item(item.id).is_some() {
            return Err(ItineraryError::DuplicateItem(item.id));
        }
        self.items.push(item);
        Ok(())
    }

    pub fn remove_item(&mut self, id: Uuid) -> Result<Item, ItineraryError> {
        let index = self
            .items
            .iter()
            .position(|i| i.id == id)
            .ok_or(ItineraryError::UnknownItem(id))?;
        Ok(self.items.remove(index))
    }

    pub fn patch_item(&mut self, id: Uuid, patch: &ItemPatch) -> Result<(), ItineraryError> {
        let item = self
            .items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(ItineraryError::UnknownItem(id))?;
        item.apply(patch);
        Ok(())
    }

    /// Move an item to `to_index` within `to_section` (which may be its
    /// current section). The index is clamped to the end of the section.
    ///
    /// Both touched sections are renumbered densely and the rows whose
    /// `(section_id, position)` changed are returned, ready to be sent as a
    /// reorder request. Nothing is modified when an id is unknown.
    pub fn move_item(
        &mut self,
        item_id: Uuid,
        to_section: Uuid,
        to_index: usize,
    ) -> Result<Vec<ItemPosition>, ItineraryError> {
        let from_section = self
            .item(item_id)
            .map(|i| i.section_id)
            .ok_or(ItineraryError::UnknownItem(item_id))?;
        if self.section(to_section).is_none() {
            return Err(ItineraryError::UnknownSection(to_section));
        }

        let mut source: Vec<Uuid> = self
            .items_in(from_section)
            .into_iter()
            .map(|i| i.id)
            .filter(|id| *id != item_id)
            .collect();

        let mut changes = Vec::new();
        if from_section == to_section {
            let index = to_index.min(source.len());
            source.insert(index, item_id);
            self.renumber_items(to_section, &source, &mut changes);
        } else {
            let mut target: Vec<Uuid> = self.items_in(to_section).into_iter().map(|i| i.id).collect();
            let index = to_index.min(target.len());
            target.insert(index, item_id);
            self.renumber_items(from_section, &source, &mut changes);
            self.renumber_items(to_section, &target, &mut changes);
        }

        self.sort();
        Ok(changes)
    }

    fn renumber_items(&mut self, section_id: Uuid, order: &[Uuid], changes: &mut Vec<ItemPosition>) {
        for (position, id) in order.iter().enumerate() {
            let position = position as i32;
            if let Some(item) = self.items.iter_mut().find(|i| i.id == *id) {
                if item.section_id != section_id || item.position != position {
                    item.section_id = section_id;
                    item.position = position;
                    changes.push(ItemPosition {
                        id: item.id,
                        section_id,
                        position,
                    });
                }
            }
        }
    }

    /// Apply reorder rows received from elsewhere (e.g. replaying a request).
    pub fn apply_item_positions(&mut self, positions: &[ItemPosition]) {
        for p in positions {
            if let Some(item) = self.items.iter_mut().find(|i| i.id == p.id) {
                item.section_id = p.section_id;
                item.position = p.position;
            }
        }
        self.sort();
    }

    // ===== Sections =====

    pub fn insert_section(&mut self, section: Section) -> Result<(), ItineraryError> {
        if self.section(section.id).is_some() {
            return Err(ItineraryError::DuplicateSection(section.id));
        }
        self.sections.push(section);
        self.sort();
        Ok(())
    }

    /// Remove a section together with its items (the backend cascades).
    pub fn remove_section(&mut self, id: Uuid) -> Result<(Section, Vec<Item>), ItineraryError> {
        let index = self
            .sections
            .iter()
            .position(|s| s.id == id)
            .ok_or(ItineraryError::UnknownSection(id))?;
        let section = self.sections.remove(index);
        let (removed, kept): (Vec<Item>, Vec<Item>) =
            self.items.drain(..).partition(|i| i.section_id == id);
        self.items = kept;
        Ok((section, removed))
    }

    pub fn patch_section(&mut self, id: Uuid, patch: &SectionPatch) -> Result<(), ItineraryError> {
        let section = self
            .sections
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(ItineraryError::UnknownSection(id))?;
        if let Some(ref title) = patch.title {
            section.title = title.clone();
        }
        if let Some(day) = patch.day {
            section.day = Some(day);
        }
        Ok(())
    }

    /// Section counterpart of [`Itinerary::move_item`].
    pub fn move_section(
        &mut self,
        section_id: Uuid,
        to_index: usize,
    ) -> Result<Vec<SectionPosition>, ItineraryError> {
        if self.section(section_id).is_none() {
            return Err(ItineraryError::UnknownSection(section_id));
        }
        self.sort();
        let mut order: Vec<Uuid> = self
            .sections
            .iter()
            .map(|s| s.id)
            .filter(|id| *id != section_id)
            .collect();
        let index = to_index.min(order.len());
        order.insert(index, section_id);

        let mut changes = Vec::new();
        for (position, id) in order.iter().enumerate() {
            let position = position as i32;
            if let Some(section) = self.sections.iter_mut().find(|s| s.id == *id) {
                if section.position != position {
                    section.position = position;
                    changes.push(SectionPosition { id: *id, position });
                }
            }
        }
        self.sort();
        Ok(changes)
    }
}

// ============================================================================
// Tests
// ============================================================================
