//! Data models for trip entities.
//!
//! This module contains the data structures mirroring the backend's rows:
//!
//! - `Trip`, `TripPatch`: the trip record itself
//! - `Section`, `Item`, `Itinerary`: itinerary structure and the pure
//!   transforms applied by optimistic updates
//! - `Member`, `MemberRole`: people the trip is shared with
//! - `Tag`: free-form trip labels
//!
//! Enabling the `ts` feature derives TypeScript bindings for the web and
//! mobile clients.

pub mod itinerary;
pub mod member;
pub mod tag;
pub mod trip;

pub use itinerary::{
    Item, ItemPatch, ItemPosition, Itinerary, ItineraryError, NewItem, NewSection, Section,
    SectionPatch, SectionPosition,
};
pub use member::{Member, MemberRole, NewMember};
pub use tag::{normalize_tag_name, NewTag, Tag};
pub use trip::{Trip, TripPatch};
