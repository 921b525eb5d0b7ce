//! Application configuration management.
//!
//! Stored at `~/.config/tripsync/config.json` (platform config dir). A few
//! values can be overridden from the environment so the CLI can be pointed
//! at another backend without editing the file:
//!
//! - `TRIPSYNC_URL`, `TRIPSYNC_ANON_KEY`: backend project and public key
//! - `TRIPSYNC_EMAIL`: account to sign in with

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::DEFAULT_STALE_MINUTES;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "tripsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const ENV_URL: &str = "TRIPSYNC_URL";
pub const ENV_ANON_KEY: &str = "TRIPSYNC_ANON_KEY";
pub const ENV_EMAIL: &str = "TRIPSYNC_EMAIL";
pub const ENV_PASSWORD: &str = "TRIPSYNC_PASSWORD";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub dedupe_interval_ms: u64,
    pub stale_minutes: i64,
    /// 0 disables periodic revalidation.
    pub poll_interval_secs: u64,
    pub realtime: bool,
    pub debounce_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            dedupe_interval_ms: 2_000,
            stale_minutes: DEFAULT_STALE_MINUTES,
            poll_interval_secs: 0,
            realtime: true,
            debounce_ms: 150,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend_url: Option<String>,
    pub anon_key: Option<String>,
    pub last_email: Option<String>,
    pub last_trip_id: Option<Uuid>,
    pub offline_mode: bool,
    pub sync: SyncSettings,
}

impl Config {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Override fields from environment lookups. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key| lookup(key).filter(|v: &String| !v.trim().is_empty());
        if let Some(url) = get(ENV_URL) {
            self.backend_url = Some(url);
        }
        if let Some(key) = get(ENV_ANON_KEY) {
            self.anon_key = Some(key);
        }
        if let Some(email) = get(ENV_EMAIL) {
            self.last_email = Some(email);
        }
    }

    /// Backend URL and anon key, or an error naming what is missing.
    pub fn backend(&self) -> Result<(&str, &str)> {
        let url = self
            .backend_url
            .as_deref()
            .with_context(|| format!("No backend URL configured (set {})", ENV_URL))?;
        let key = self
            .anon_key
            .as_deref()
            .with_context(|| format!("No anon key configured (set {})", ENV_ANON_KEY))?;
        Ok((url, key))
    }

    /// Host of the configured backend, used to scope stored credentials.
    pub fn backend_host(&self) -> Option<String> {
        let url = self.backend_url.as_deref()?;
        url::Url::parse(url).ok()?.host_str().map(str::to_string)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Base cache directory; session data lives here.
    pub fn base_cache_dir() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Per-user cache directory for trip data.
    pub fn cache_dir(&self, user_id: Option<Uuid>) -> Result<PathBuf> {
        let mut path = Self::base_cache_dir()?;
        if let Some(user_id) = user_id {
            path = path.join(user_id.to_string());
        }
        Ok(path)
    }
}
