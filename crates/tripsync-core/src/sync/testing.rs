//! In-memory backend for unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, RwLockWriteGuard};
use uuid::Uuid;

use crate::api::ApiError;
use crate::models::{
    Item, ItemPatch, ItemPosition, Itinerary, Member, MemberRole, NewItem, NewMember, NewSection,
    NewTag, Section, SectionPatch, SectionPosition, Tag, Trip, TripPatch,
};

use super::{Slice, TripBackend};

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Server,
    Unauthorized,
    Conflict,
}

impl Failure {
    fn error(self) -> anyhow::Error {
        match self {
            Failure::Server => ApiError::ServerError("injected failure".into()).into(),
            Failure::Unauthorized => ApiError::Unauthorized.into(),
            Failure::Conflict => ApiError::Conflict("injected conflict".into()).into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Db {
    pub trip: Trip,
    pub itinerary: Itinerary,
    pub members: Vec<Member>,
    pub tags: Vec<Tag>,
}

pub struct MemoryBackend {
    trip_id: Uuid,
    db: Mutex<Db>,
    fetches: Mutex<HashMap<Slice, usize>>,
    writes: Mutex<Vec<&'static str>>,
    fetch_failure: Mutex<Option<Failure>>,
    write_failure: Mutex<Option<Failure>>,
    fetch_gate: RwLock<()>,
    write_gate: RwLock<()>,
}

impl MemoryBackend {
    /// A trip with two sections ("Day 1": a, b; "Day 2": c), an owner and
    /// an editor, and one tag ("food").
    pub fn seeded() -> Self {
        let trip_id = Uuid::new_v4();
        let now = Utc::now();
        let trip = Trip {
            id: trip_id,
            owner_id: Uuid::new_v4(),
            name: "Kyoto".to_string(),
            destination: Some("Japan".to_string()),
            description: None,
            starts_on: None,
            ends_on: None,
            cover_image_url: None,
            created_at: now,
            updated_at: now,
        };
        let section = |title: &str, position| Section {
            id: Uuid::new_v4(),
            trip_id,
            title: title.to_string(),
            day: None,
            position,
            created_at: now,
        };
        let day1 = section("Day 1", 0);
        let day2 = section("Day 2", 1);
        let item = |section_id, title: &str, position| Item {
            id: Uuid::new_v4(),
            trip_id,
            section_id,
            title: title.to_string(),
            notes: None,
            location: None,
            starts_at: None,
            ends_at: None,
            position,
            created_at: now,
            updated_at: now,
        };
        let items = vec![item(day1.id, "a", 0), item(day1.id, "b", 1), item(day2.id, "c", 0)];
        let members = vec![
            Member {
                id: Uuid::new_v4(),
                trip_id,
                user_id: Some(trip.owner_id),
                role: MemberRole::Owner,
                display_name: Some("Owner".to_string()),
                email: Some("owner@example.com".to_string()),
                joined_at: Some(now),
            },
            Member {
                id: Uuid::new_v4(),
                trip_id,
                user_id: Some(Uuid::new_v4()),
                role: MemberRole::Editor,
                display_name: Some("Editor".to_string()),
                email: Some("editor@example.com".to_string()),
                joined_at: Some(now),
            },
        ];
        let tags = vec![Tag {
            id: Uuid::new_v4(),
            trip_id,
            name: "food".to_string(),
            created_at: now,
        }];

        Self {
            trip_id,
            db: Mutex::new(Db {
                trip,
                itinerary: Itinerary::from_rows(vec![day1, day2], items),
                members,
                tags,
            }),
            fetches: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            fetch_failure: Mutex::new(None),
            write_failure: Mutex::new(None),
            fetch_gate: RwLock::new(()),
            write_gate: RwLock::new(()),
        }
    }

    pub fn trip_id(&self) -> Uuid {
        self.trip_id
    }

    pub fn db(&self) -> Db {
        self.db.lock().unwrap().clone()
    }

    pub fn fetch_count(&self, slice: Slice) -> usize {
        self.fetches.lock().unwrap().get(&slice).copied().unwrap_or(0)
    }

    pub fn writes(&self) -> Vec<&'static str> {
        self.writes.lock().unwrap().clone()
    }

    pub fn fail_fetches(&self, failure: Option<Failure>) {
        *self.fetch_failure.lock().unwrap() = failure;
    }

    pub fn fail_writes(&self, failure: Option<Failure>) {
        *self.write_failure.lock().unwrap() = failure;
    }

    /// Fetches block (after being counted and read) until the guard is dropped.
    pub async fn hold_fetches(&self) -> RwLockWriteGuard<'_, ()> {
        self.fetch_gate.write().await
    }

    /// Writes block (after being logged) until the guard is dropped.
    pub async fn hold_writes(&self) -> RwLockWriteGuard<'_, ()> {
        self.write_gate.write().await
    }

    pub async fn wait_for_fetches(&self, slice: Slice, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.fetch_count(slice) < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("timed out waiting for fetches");
    }

    pub async fn wait_for_writes(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.writes().len() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("timed out waiting for writes");
    }

    /// Rows are read when the request arrives; a held fetch answers with
    /// what the server held at that moment.
    async fn fetch<T>(&self, slice: Slice, read: impl FnOnce(&Db) -> T) -> Result<T> {
        *self.fetches.lock().unwrap().entry(slice).or_insert(0) += 1;
        let rows = read(&self.db.lock().unwrap());
        let _gate = self.fetch_gate.read().await;
        let failure = *self.fetch_failure.lock().unwrap();
        if let Some(failure) = failure {
            return Err(failure.error());
        }
        Ok(rows)
    }

    async fn write<T>(&self, name: &'static str, apply: impl FnOnce(&mut Db) -> Result<T>) -> Result<T> {
        self.writes.lock().unwrap().push(name);
        let _gate = self.write_gate.read().await;
        let failure = *self.write_failure.lock().unwrap();
        if let Some(failure) = failure {
            return Err(failure.error());
        }
        apply(&mut self.db.lock().unwrap())
    }
}

#[async_trait]
impl TripBackend for MemoryBackend {
    async fn fetch_trip(&self, _trip_id: Uuid) -> Result<Trip> {
        self.fetch(Slice::Trip, |db| db.trip.clone()).await
    }

    async fn fetch_itinerary(&self, _trip_id: Uuid) -> Result<Itinerary> {
        self.fetch(Slice::Itinerary, |db| db.itinerary.clone()).await
    }

    async fn fetch_members(&self, _trip_id: Uuid) -> Result<Vec<Member>> {
        self.fetch(Slice::Members, |db| db.members.clone()).await
    }

    async fn fetch_tags(&self, _trip_id: Uuid) -> Result<Vec<Tag>> {
        self.fetch(Slice::Tags, |db| db.tags.clone()).await
    }

    async fn update_trip(&self, _trip_id: Uuid, patch: &TripPatch) -> Result<Trip> {
        self.write("update_trip", |db| {
            db.trip.apply(patch);
            db.trip.updated_at = Utc::now();
            Ok(db.trip.clone())
        })
        .await
    }

    async fn create_section(&self, section: &NewSection) -> Result<Section> {
        self.write("create_section", |db| {
            let row = section.to_section(Utc::now());
            db.itinerary.insert_section(row.clone())?;
            Ok(row)
        })
        .await
    }

    async fn update_section(&self, section_id: Uuid, patch: &SectionPatch) -> Result<Section> {
        self.write("update_section", |db| {
            db.itinerary.patch_section(section_id, patch)?;
            match db.itinerary.section(section_id) {
                Some(section) => Ok(section.clone()),
                None => bail!(ApiError::NotFound(section_id.to_string())),
            }
        })
        .await
    }

    async fn delete_section(&self, section_id: Uuid) -> Result<()> {
        self.write("delete_section", |db| {
            db.itinerary.remove_section(section_id)?;
            Ok(())
        })
        .await
    }

    async fn reorder_sections(&self, _trip_id: Uuid, positions: &[SectionPosition]) -> Result<()> {
        self.write("reorder_sections", |db| {
            for p in positions {
                if let Some(section) = db.itinerary.sections.iter_mut().find(|s| s.id == p.id) {
                    section.position = p.position;
                }
            }
            db.itinerary.sort();
            Ok(())
        })
        .await
    }

    async fn create_item(&self, item: &NewItem) -> Result<Item> {
        self.write("create_item", |db| {
            let row = item.to_item(Utc::now());
            db.itinerary.insert_item(row.clone())?;
            db.itinerary.sort();
            Ok(row)
        })
        .await
    }

    async fn update_item(&self, item_id: Uuid, patch: &ItemPatch) -> Result<Item> {
        self.write("update_item", |db| {
            db.itinerary.patch_item(item_id, patch)?;
            match db.itinerary.item(item_id) {
                Some(item) => Ok(item.clone()),
                None => bail!(ApiError::NotFound(item_id.to_string())),
            }
        })
        .await
    }

    async fn delete_item(&self, item_id: Uuid) -> Result<()> {
        self.write("delete_item", |db| {
            db.itinerary.remove_item(item_id)?;
            Ok(())
        })
        .await
    }

    async fn reorder_items(&self, _trip_id: Uuid, positions: &[ItemPosition]) -> Result<()> {
        self.write("reorder_items", |db| {
            db.itinerary.apply_item_positions(positions);
            Ok(())
        })
        .await
    }

    async fn add_tag(&self, tag: &NewTag) -> Result<Tag> {
        self.write("add_tag", |db| {
            if db.tags.iter().any(|t| t.matches(&tag.name)) {
                bail!(ApiError::Conflict(tag.name.clone()));
            }
            let row = tag.to_tag(Utc::now());
            db.tags.push(row.clone());
            Ok(row)
        })
        .await
    }

    async fn remove_tag(&self, tag_id: Uuid) -> Result<()> {
        self.write("remove_tag", |db| {
            db.tags.retain(|t| t.id != tag_id);
            Ok(())
        })
        .await
    }

    async fn invite_member(&self, member: &NewMember) -> Result<Member> {
        self.write("invite_member", |db| {
            let row = member.to_member();
            db.members.push(row.clone());
            Ok(row)
        })
        .await
    }

    async fn update_member_role(&self, member_id: Uuid, role: MemberRole) -> Result<Member> {
        self.write("update_member_role", |db| {
            match db.members.iter_mut().find(|m| m.id == member_id) {
                Some(member) => {
                    member.role = role;
                    Ok(member.clone())
                }
                None => bail!(ApiError::NotFound(member_id.to_string())),
            }
        })
        .await
    }

    async fn remove_member(&self, member_id: Uuid) -> Result<()> {
        self.write("remove_member", |db| {
            db.members.retain(|m| m.id != member_id);
            Ok(())
        })
        .await
    }
}
