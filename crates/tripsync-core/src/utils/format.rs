use chrono::{Datelike, NaiveDate};

/// Truncate a string to a maximum length, adding ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}

/// Format an optional string, returning a default if None
pub fn format_optional(value: &Option<String>, default: &str) -> String {
    value.as_deref().unwrap_or(default).to_string()
}

/// Compact date range: "May 1-7, 2026", "Apr 28 - May 3, 2026",
/// "Dec 30, 2026 - Jan 2, 2027".
pub fn format_date_range(start: NaiveDate, end: NaiveDate) -> String {
    if start == end {
        start.format("%b %-d, %Y").to_string()
    } else if start.year() != end.year() {
        format!("{} - {}", start.format("%b %-d, %Y"), end.format("%b %-d, %Y"))
    } else if start.month() != end.month() {
        format!("{} - {}", start.format("%b %-d"), end.format("%b %-d, %Y"))
    } else {
        format!("{}-{}", start.format("%b %-d"), end.format("%-d, %Y"))
    }
}
