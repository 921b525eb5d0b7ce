use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    Item, ItemPatch, ItemPosition, Itinerary, Member, MemberRole, NewItem, NewMember, NewSection,
    NewTag, Section, SectionPatch, SectionPosition, Tag, Trip, TripPatch,
};

/// Reads and writes the sync layer needs from the backend.
///
/// `ApiClient` is the production implementation; tests substitute an
/// in-memory one.
#[async_trait]
pub trait TripBackend: Send + Sync + 'static {
    async fn fetch_trip(&self, trip_id: Uuid) -> Result<Trip>;
    async fn fetch_itinerary(&self, trip_id: Uuid) -> Result<Itinerary>;
    async fn fetch_members(&self, trip_id: Uuid) -> Result<Vec<Member>>;
    async fn fetch_tags(&self, trip_id: Uuid) -> Result<Vec<Tag>>;

    async fn update_trip(&self, trip_id: Uuid, patch: &TripPatch) -> Result<Trip>;

    async fn create_section(&self, section: &NewSection) -> Result<Section>;
    async fn update_section(&self, section_id: Uuid, patch: &SectionPatch) -> Result<Section>;
    async fn delete_section(&self, section_id: Uuid) -> Result<()>;
    async fn reorder_sections(&self, trip_id: Uuid, positions: &[SectionPosition]) -> Result<()>;

    async fn create_item(&self, item: &NewItem) -> Result<Item>;
    async fn update_item(&self, item_id: Uuid, patch: &ItemPatch) -> Result<Item>;
    async fn delete_item(&self, item_id: Uuid) -> Result<()>;
    async fn reorder_items(&self, trip_id: Uuid, positions: &[ItemPosition]) -> Result<()>;

    async fn add_tag(&self, tag: &NewTag) -> Result<Tag>;
    async fn remove_tag(&self, tag_id: Uuid) -> Result<()>;

    async fn invite_member(&self, member: &NewMember) -> Result<Member>;
    async fn update_member_role(&self, member_id: Uuid, role: MemberRole) -> Result<Member>;
    async fn remove_member(&self, member_id: Uuid) -> Result<()>;
}
