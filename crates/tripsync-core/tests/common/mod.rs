//! Row fixtures shared by the integration tests.

#![allow(dead_code)]

use serde_json::{json, Value};
use uuid::Uuid;

pub const STAMP: &str = "2026-04-01T10:00:00Z";

pub struct Fixture {
    pub trip_id: Uuid,
    pub owner_id: Uuid,
    pub day1: Uuid,
    pub day2: Uuid,
    pub item_a: Uuid,
    pub item_b: Uuid,
    pub tag_id: Uuid,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            trip_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            day1: Uuid::new_v4(),
            day2: Uuid::new_v4(),
            item_a: Uuid::new_v4(),
            item_b: Uuid::new_v4(),
            tag_id: Uuid::new_v4(),
        }
    }

    pub fn trip(&self) -> Value {
        json!({
            "id": self.trip_id,
            "owner_id": self.owner_id,
            "name": "Lisbon",
            "destination": "Portugal",
            "starts_on": "2026-05-01",
            "ends_on": "2026-05-04",
            "created_at": STAMP,
            "updated_at": STAMP,
        })
    }

    pub fn sections(&self) -> Value {
        json!([
            { "id": self.day1, "trip_id": self.trip_id, "title": "Day 1", "position": 0, "created_at": STAMP },
            { "id": self.day2, "trip_id": self.trip_id, "title": "Day 2", "position": 1, "created_at": STAMP },
        ])
    }

    pub fn items(&self) -> Value {
        json!([
            self.item(self.item_a, self.day1, "Alfama walk", 0),
            self.item(self.item_b, self.day1, "Tram 28", 1),
        ])
    }

    pub fn item(&self, id: Uuid, section_id: Uuid, title: &str, position: i32) -> Value {
        json!({
            "id": id,
            "trip_id": self.trip_id,
            "section_id": section_id,
            "title": title,
            "position": position,
            "created_at": STAMP,
            "updated_at": STAMP,
        })
    }

    pub fn members(&self) -> Value {
        json!([{
            "id": Uuid::new_v4(),
            "trip_id": self.trip_id,
            "user_id": self.owner_id,
            "role": "owner",
            "display_name": "Rui",
            "joined_at": STAMP,
        }])
    }

    pub fn tags(&self) -> Value {
        json!([{ "id": self.tag_id, "trip_id": self.trip_id, "name": "food", "created_at": STAMP }])
    }
}
