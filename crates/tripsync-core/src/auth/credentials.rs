use anyhow::{Context, Result};
use keyring::Entry;
use tracing::debug;

const DEFAULT_SERVICE: &str = "tripsync";

/// Passwords remembered in the OS keychain, keyed by account email.
///
/// The service name is scoped per backend so that accounts on a staging
/// project do not collide with production ones.
pub struct CredentialStore {
    service: String,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CredentialStore {
    pub fn new(backend_host: Option<&str>) -> Self {
        let service = match backend_host {
            Some(host) if !host.is_empty() => format!("{}:{}", DEFAULT_SERVICE, host),
            _ => DEFAULT_SERVICE.to_string(),
        };
        Self { service }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn entry(&self, email: &str) -> Result<Entry> {
        Entry::new(&self.service, &email.to_ascii_lowercase())
            .context("Failed to create keyring entry")
    }

    pub fn remember(&self, email: &str, password: &str) -> Result<()> {
        self.entry(email)?
            .set_password(password)
            .context("Failed to store password in keychain")
    }

    pub fn recall(&self, email: &str) -> Option<String> {
        match self.entry(email).and_then(|e| {
            e.get_password()
                .context("Failed to retrieve password from keychain")
        }) {
            Ok(password) => Some(password),
            Err(e) => {
                debug!(error = %e, "No stored password");
                None
            }
        }
    }

    pub fn forget(&self, email: &str) -> Result<()> {
        self.entry(email)?
            .delete_credential()
            .context("Failed to delete credential from keychain")
    }
}
