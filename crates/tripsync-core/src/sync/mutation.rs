//! Optimistic writes.
//!
//! Each operation edits the cached slice first, then sends the write. When
//! the write settles the slice is revalidated; when it fails the edit is
//! also undone right away so the UI does not keep showing it while the
//! refetch is running.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{
    normalize_tag_name, Item, ItemPatch, Itinerary, Member, MemberRole, NewItem, NewMember,
    NewSection, NewTag, Section, SectionPatch, Tag, Trip, TripPatch,
};

use super::{Revalidator, Slice, SliceData, SyncError, TripBackend, TripStore};

/// Fields for a new itinerary item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemDraft {
    pub title: String,
    pub notes: Option<String>,
    pub location: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl ItemDraft {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }
}

pub struct TripMutations<B> {
    revalidator: Revalidator<B>,
}

impl<B> Clone for TripMutations<B> {
    fn clone(&self) -> Self {
        Self {
            revalidator: self.revalidator.clone(),
        }
    }
}

impl<B: TripBackend> TripMutations<B> {
    pub fn new(revalidator: Revalidator<B>) -> Self {
        Self { revalidator }
    }

    fn store(&self) -> &Arc<TripStore> {
        self.revalidator.store()
    }

    fn trip_id(&self) -> Uuid {
        self.store().trip_id()
    }

    /// Apply `optimistic` to `slice`, then run `write` with its output.
    ///
    /// If `optimistic` refuses, nothing is sent. The write, the settle and
    /// the follow-up revalidation run on a spawned task so that dropping
    /// the returned future cannot leave the slice marked as pending.
    pub async fn mutate<T, O, F, W, Fut>(
        &self,
        slice: Slice,
        operation: &'static str,
        optimistic: F,
        write: W,
    ) -> Result<O, SyncError>
    where
        F: FnOnce(&mut SliceData) -> Result<T, SyncError>,
        W: FnOnce(Arc<B>, T) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
        T: Send + 'static,
        O: Send + 'static,
    {
        let trip_id = self.trip_id();
        let (pending, input) = self.store().begin_mutation(slice, optimistic).await?;
        debug!(%trip_id, %slice, operation, "Applied optimistic change");

        let revalidator = self.revalidator.clone();
        let task = tokio::spawn(async move {
            let result = write(Arc::clone(revalidator.backend()), input).await;
            let rolled_back = revalidator.store().settle(pending, result.is_ok()).await;

            match &result {
                Ok(_) => info!(%trip_id, %slice, operation, "Write confirmed"),
                Err(e) => {
                    error!(%trip_id, %slice, operation, error = %e, "Write failed");
                    if rolled_back {
                        warn!(%trip_id, %slice, operation, "Rolled back optimistic change");
                    }
                }
            }

            if let Err(e) = revalidator.revalidate(slice).await {
                warn!(%trip_id, %slice, operation, error = %e, "Revalidation after write failed");
            }

            result.map_err(|e| SyncError::mutation(operation, &e))
        });

        task.await.map_err(|e| SyncError::Task(e.to_string()))?
    }

    // ===== Trip =====

    pub async fn update_trip(&self, patch: TripPatch) -> Result<Trip, SyncError> {
        if patch.is_empty() {
            return Err(SyncError::Invalid("nothing to update".into()));
        }
        if patch.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(SyncError::Invalid("trip name cannot be empty".into()));
        }
        let trip_id = self.trip_id();
        self.mutate(
            Slice::Trip,
            "update trip",
            |data| {
                trip_mut(data)?.apply(&patch);
                Ok(patch)
            },
            move |backend, patch| async move { backend.update_trip(trip_id, &patch).await },
        )
        .await
    }

    // ===== Sections =====

    pub async fn add_section(&self, title: &str, day: Option<NaiveDate>) -> Result<Section, SyncError> {
        let title = required(title, "section title")?;
        let trip_id = self.trip_id();
        self.mutate(
            Slice::Itinerary,
            "add section",
            |data| {
                let itinerary = itinerary_mut(data)?;
                let section = NewSection {
                    id: Uuid::new_v4(),
                    trip_id,
                    title,
                    day,
                    position: itinerary.next_section_position(),
                };
                itinerary.insert_section(section.to_section(Utc::now()))?;
                Ok(section)
            },
            |backend, section| async move { backend.create_section(&section).await },
        )
        .await
    }

    pub async fn rename_section(&self, section_id: Uuid, title: &str) -> Result<Section, SyncError> {
        let patch = SectionPatch {
            title: Some(required(title, "section title")?),
            day: None,
        };
        self.update_section(section_id, patch).await
    }

    pub async fn update_section(
        &self,
        section_id: Uuid,
        patch: SectionPatch,
    ) -> Result<Section, SyncError> {
        self.mutate(
            Slice::Itinerary,
            "update section",
            |data| {
                itinerary_mut(data)?.patch_section(section_id, &patch)?;
                Ok(patch)
            },
            move |backend, patch| async move { backend.update_section(section_id, &patch).await },
        )
        .await
    }

    /// Delete a section and, like the backend, every item in it.
    pub async fn delete_section(&self, section_id: Uuid) -> Result<(), SyncError> {
        self.mutate(
            Slice::Itinerary,
            "delete section",
            |data| {
                itinerary_mut(data)?.remove_section(section_id)?;
                Ok(())
            },
            move |backend, ()| async move { backend.delete_section(section_id).await },
        )
        .await
    }

    pub async fn move_section(&self, section_id: Uuid, to_index: usize) -> Result<(), SyncError> {
        let mut preview = self.loaded_itinerary().await?;
        if preview.move_section(section_id, to_index)?.is_empty() {
            debug!(trip_id = %self.trip_id(), %section_id, "Section already in place");
            return Ok(());
        }

        let trip_id = self.trip_id();
        self.mutate(
            Slice::Itinerary,
            "move section",
            |data| Ok(itinerary_mut(data)?.move_section(section_id, to_index)?),
            move |backend, positions| async move {
                if positions.is_empty() {
                    return Ok(());
                }
                backend.reorder_sections(trip_id, &positions).await
            },
        )
        .await
    }

    // ===== Items =====

    pub async fn add_item(&self, section_id: Uuid, draft: ItemDraft) -> Result<Item, SyncError> {
        let title = required(&draft.title, "item title")?;
        check_times(draft.starts_at, draft.ends_at)?;
        let trip_id = self.trip_id();
        self.mutate(
            Slice::Itinerary,
            "add item",
            |data| {
                let itinerary = itinerary_mut(data)?;
                let item = NewItem {
                    id: Uuid::new_v4(),
                    trip_id,
                    section_id,
                    title,
                    notes: draft.notes,
                    location: draft.location,
                    starts_at: draft.starts_at,
                    ends_at: draft.ends_at,
                    position: itinerary.next_item_position(section_id),
                };
                itinerary.insert_item(item.to_item(Utc::now()))?;
                itinerary.sort();
                Ok(item)
            },
            |backend, item| async move { backend.create_item(&item).await },
        )
        .await
    }

    pub async fn update_item(&self, item_id: Uuid, patch: ItemPatch) -> Result<Item, SyncError> {
        if patch.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(SyncError::Invalid("item title cannot be empty".into()));
        }
        self.mutate(
            Slice::Itinerary,
            "update item",
            |data| {
                let itinerary = itinerary_mut(data)?;
                let mut updated = itinerary
                    .item(item_id)
                    .cloned()
                    .ok_or(SyncError::NotFound { kind: "item", id: item_id })?;
                updated.apply(&patch);
                check_times(updated.starts_at, updated.ends_at)?;
                itinerary.patch_item(item_id, &patch)?;
                Ok(patch)
            },
            move |backend, patch| async move { backend.update_item(item_id, &patch).await },
        )
        .await
    }

    pub async fn delete_item(&self, item_id: Uuid) -> Result<(), SyncError> {
        self.mutate(
            Slice::Itinerary,
            "delete item",
            |data| {
                itinerary_mut(data)?.remove_item(item_id)?;
                Ok(())
            },
            move |backend, ()| async move { backend.delete_item(item_id).await },
        )
        .await
    }

    /// Move an item to `to_index` within `to_section`. Only rows whose
    /// position changed are sent.
    pub async fn move_item(
        &self,
        item_id: Uuid,
        to_section: Uuid,
        to_index: usize,
    ) -> Result<(), SyncError> {
        let mut preview = self.loaded_itinerary().await?;
        if preview.move_item(item_id, to_section, to_index)?.is_empty() {
            debug!(trip_id = %self.trip_id(), %item_id, "Item already in place");
            return Ok(());
        }

        let trip_id = self.trip_id();
        self.mutate(
            Slice::Itinerary,
            "move item",
            |data| Ok(itinerary_mut(data)?.move_item(item_id, to_section, to_index)?),
            move |backend, positions| async move {
                if positions.is_empty() {
                    return Ok(());
                }
                backend.reorder_items(trip_id, &positions).await
            },
        )
        .await
    }

    // ===== Tags =====

    pub async fn add_tag(&self, name: &str) -> Result<Tag, SyncError> {
        let name = normalize_tag_name(name)
            .ok_or_else(|| SyncError::Invalid(format!("invalid tag name: {:?}", name)))?;
        let trip_id = self.trip_id();
        self.mutate(
            Slice::Tags,
            "add tag",
            |data| {
                let tags = tags_mut(data)?;
                if tags.iter().any(|t| t.matches(&name)) {
                    return Err(SyncError::Invalid(format!("tag already exists: {}", name)));
                }
                let tag = NewTag {
                    id: Uuid::new_v4(),
                    trip_id,
                    name,
                };
                tags.push(tag.to_tag(Utc::now()));
                Ok(tag)
            },
            |backend, tag| async move { backend.add_tag(&tag).await },
        )
        .await
    }

    pub async fn remove_tag(&self, tag_id: Uuid) -> Result<(), SyncError> {
        self.mutate(
            Slice::Tags,
            "remove tag",
            |data| {
                let tags = tags_mut(data)?;
                let before = tags.len();
                tags.retain(|t| t.id != tag_id);
                if tags.len() == before {
                    return Err(SyncError::NotFound { kind: "tag", id: tag_id });
                }
                Ok(())
            },
            move |backend, ()| async move { backend.remove_tag(tag_id).await },
        )
        .await
    }

    /// Remove a tag by name, ignoring case.
    pub async fn remove_tag_named(&self, name: &str) -> Result<(), SyncError> {
        let tags = self
            .store()
            .tags()
            .await
            .ok_or(SyncError::NotLoaded(Slice::Tags))?;
        let tag = tags
            .iter()
            .find(|t| t.matches(name))
            .ok_or_else(|| SyncError::Invalid(format!("no tag named {:?}", name.trim())))?;
        self.remove_tag(tag.id).await
    }

    // ===== Members =====

    pub async fn invite_member(&self, email: &str, role: MemberRole) -> Result<Member, SyncError> {
        let email = normalize_email(email)?;
        if role == MemberRole::Owner {
            return Err(SyncError::Invalid("a trip has exactly one owner".into()));
        }
        let trip_id = self.trip_id();
        self.mutate(
            Slice::Members,
            "invite member",
            |data| {
                let members = members_mut(data)?;
                let taken = members
                    .iter()
                    .any(|m| m.email.as_deref().is_some_and(|e| e.eq_ignore_ascii_case(&email)));
                if taken {
                    return Err(SyncError::Invalid(format!("{} is already a member", email)));
                }
                let member = NewMember {
                    id: Uuid::new_v4(),
                    trip_id,
                    email,
                    role,
                };
                members.push(member.to_member());
                Ok(member)
            },
            |backend, member| async move { backend.invite_member(&member).await },
        )
        .await
    }

    pub async fn change_member_role(
        &self,
        member_id: Uuid,
        role: MemberRole,
    ) -> Result<Member, SyncError> {
        if role == MemberRole::Owner {
            return Err(SyncError::Invalid("ownership cannot be transferred here".into()));
        }
        self.mutate(
            Slice::Members,
            "change member role",
            |data| {
                let member = find_member(members_mut(data)?, member_id)?;
                member.role = role;
                Ok(())
            },
            move |backend, ()| async move { backend.update_member_role(member_id, role).await },
        )
        .await
    }

    pub async fn remove_member(&self, member_id: Uuid) -> Result<(), SyncError> {
        self.mutate(
            Slice::Members,
            "remove member",
            |data| {
                let members = members_mut(data)?;
                find_member(members, member_id)?;
                members.retain(|m| m.id != member_id);
                Ok(())
            },
            move |backend, ()| async move { backend.remove_member(member_id).await },
        )
        .await
    }

    async fn loaded_itinerary(&self) -> Result<Itinerary, SyncError> {
        self.store()
            .itinerary()
            .await
            .ok_or(SyncError::NotLoaded(Slice::Itinerary))
    }
}

// ===== Helpers =====

fn trip_mut(data: &mut SliceData) -> Result<&mut Trip, SyncError> {
    data.as_trip_mut().ok_or(SyncError::NotLoaded(Slice::Trip))
}

fn itinerary_mut(data: &mut SliceData) -> Result<&mut Itinerary, SyncError> {
    data.as_itinerary_mut().ok_or(SyncError::NotLoaded(Slice::Itinerary))
}

fn members_mut(data: &mut SliceData) -> Result<&mut Vec<Member>, SyncError> {
    data.as_members_mut().ok_or(SyncError::NotLoaded(Slice::Members))
}

fn tags_mut(data: &mut SliceData) -> Result<&mut Vec<Tag>, SyncError> {
    data.as_tags_mut().ok_or(SyncError::NotLoaded(Slice::Tags))
}

/// Find a non-owner member. The owner row is managed by the backend.
fn find_member(members: &mut [Member], member_id: Uuid) -> Result<&mut Member, SyncError> {
    let member = members
        .iter_mut()
        .find(|m| m.id == member_id)
        .ok_or(SyncError::NotFound { kind: "member", id: member_id })?;
    if member.role == MemberRole::Owner {
        return Err(SyncError::Invalid("the trip owner cannot be changed".into()));
    }
    Ok(member)
}

fn required(value: &str, what: &str) -> Result<String, SyncError> {
    let value = value.trim();
    if value.is_empty() {
        Err(SyncError::Invalid(format!("{} cannot be empty", what)))
    } else {
        Ok(value.to_string())
    }
}

fn check_times(starts_at: Option<DateTime<Utc>>, ends_at: Option<DateTime<Utc>>) -> Result<(), SyncError> {
    match (starts_at, ends_at) {
        (Some(start), Some(end)) if end < start => {
            Err(SyncError::Invalid("item ends before it starts".into()))
        }
        _ => Ok(()),
    }
}

fn normalize_email(email: &str) -> Result<String, SyncError> {
    let email = email.trim().to_ascii_lowercase();
    match email.split_once('@') {
        Some((local, domain))
            if !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.') =>
        {
            Ok(email)
        }
        _ => Err(SyncError::Invalid(format!("invalid email address: {:?}", email))),
    }
}

// ============================================================================
// Tests
// ============================================================================
