//! Plain-text rendering of trip snapshots.

use std::fmt::Write;

use tripsync_core::sync::TripSnapshot;
use tripsync_core::utils::{format_optional, truncate_string};

const TITLE_WIDTH: usize = 48;
const LOCATION_WIDTH: usize = 32;

/// Header, itinerary, members and tags.
pub fn trip(snapshot: &TripSnapshot) -> String {
    let mut out = String::new();
    match &snapshot.trip {
        Some(trip) => {
            let _ = writeln!(out, "{}", trip.name);
            let _ = writeln!(
                out,
                "{} | {}",
                format_optional(&trip.destination, "No destination"),
                trip.date_range_display()
            );
            if let Some(days) = trip.duration_days() {
                let _ = writeln!(out, "{} day{}", days, if days == 1 { "" } else { "s" });
            }
        }
        None => {
            let _ = writeln!(out, "Trip {} (not loaded)", snapshot.trip_id);
        }
    }
    out.push('\n');
    out.push_str(&itinerary(snapshot));
    out.push('\n');
    out.push_str(&people_and_tags(snapshot));
    out
}

pub fn itinerary(snapshot: &TripSnapshot) -> String {
    let mut out = String::new();
    let Some(itinerary) = &snapshot.itinerary else {
        out.push_str("Itinerary not loaded\n");
        return out;
    };
    if itinerary.is_empty() {
        out.push_str("No itinerary yet\n");
        return out;
    }

    for (section, items) in itinerary.grouped() {
        match section.day {
            Some(day) => {
                let _ = writeln!(out, "{} ({})", section.title, day.format("%a %b %-d"));
            }
            None => {
                let _ = writeln!(out, "{}", section.title);
            }
        }
        let _ = writeln!(out, "  [{}]", section.id);
        if items.is_empty() {
            out.push_str("  (empty)\n");
        }
        for (n, item) in items.iter().enumerate() {
            let time = item.time_display();
            let _ = write!(out, "  {:>2}. ", n + 1);
            if !time.is_empty() {
                let _ = write!(out, "{} ", time);
            }
            out.push_str(&truncate_string(&item.title, TITLE_WIDTH));
            if let Some(location) = &item.location {
                let _ = write!(out, " @ {}", truncate_string(location, LOCATION_WIDTH));
            }
            let _ = writeln!(out, "  [{}]", item.id);
        }
    }
    out
}

pub fn people_and_tags(snapshot: &TripSnapshot) -> String {
    let mut out = String::new();
    match &snapshot.members {
        Some(members) => {
            let _ = writeln!(out, "Members ({})", members.len());
            for member in members {
                let _ = write!(out, "  {} - {}", member.name(), member.role);
                if member.is_pending() {
                    out.push_str(" (invited)");
                }
                out.push('\n');
            }
        }
        None => out.push_str("Members not loaded\n"),
    }
    match &snapshot.tags {
        Some(tags) if tags.is_empty() => out.push_str("Tags: none\n"),
        Some(tags) => {
            let names: Vec<&str> = tags.iter().map(|t| t.name.as_str()).collect();
            let _ = writeln!(out, "Tags: {}", names.join(", "));
        }
        None => out.push_str("Tags not loaded\n"),
    }
    out
}
