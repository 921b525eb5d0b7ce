use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum MemberRole {
    Owner,
    Editor,
    Viewer,
}

impl MemberRole {
    pub fn can_edit(&self) -> bool {
        matches!(self, MemberRole::Owner | MemberRole::Editor)
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" => Some(MemberRole::Owner),
            "editor" => Some(MemberRole::Editor),
            "viewer" => Some(MemberRole::Viewer),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberRole::Owner => write!(f, "Owner"),
            MemberRole::Editor => write!(f, "Editor"),
            MemberRole::Viewer => write!(f, "Viewer"),
        }
    }
}

/// A row of `trip_members`. `user_id` is empty while an invitation is pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Member {
    pub id: Uuid,
    pub trip_id: Uuid,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    pub role: MemberRole,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
}

impl Member {
    pub fn is_pending(&self) -> bool {
        self.user_id.is_none() || self.joined_at.is_none()
    }

    pub fn name(&self) -> String {
        self.display_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| self.email.clone())
            .unwrap_or_else(|| "Invited member".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct NewMember {
    pub id: Uuid,
    pub trip_id: Uuid,
    pub email: String,
    pub role: MemberRole,
}

impl NewMember {
    pub fn to_member(&self) -> Member {
        Member {
            id: self.id,
            trip_id: self.trip_id,
            user_id: None,
            role: self.role,
            display_name: None,
            email: Some(self.email.clone()),
            joined_at: None,
        }
    }
}
