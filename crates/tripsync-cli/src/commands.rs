use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tripsync_core::cache::CacheManager;
use tripsync_core::config::ENV_PASSWORD;
use tripsync_core::sync::{ChangeOrigin, Slice};
use tripsync_core::{
    ApiClient, Config, CredentialStore, ItemDraft, RealtimeConfig, Session, SessionData, SyncError,
    SyncOptions, TripData,
};

use crate::render;

/// Refresh the access token this long before it expires.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 5 * 60;

/// Shared state for one command invocation.
pub struct Context {
    config: Config,
    session: Session,
    session_dir: PathBuf,
    api: ApiClient,
    offline: bool,
}

impl Context {
    pub fn new(offline: bool) -> Result<Self> {
        let config = Config::load()?;
        let session_dir = Config::base_cache_dir()?;
        let mut session = Session::new(session_dir.clone());
        if let Err(e) = session.load() {
            warn!(error = %e, "Ignoring unreadable session file");
        }

        let (url, key) = config.backend()?;
        let api = ApiClient::new(url, key)?;
        let offline = offline || config.offline_mode;

        Ok(Self {
            config,
            session,
            session_dir,
            api,
            offline,
        })
    }

    fn credentials(&self) -> CredentialStore {
        CredentialStore::new(self.config.backend_host().as_deref())
    }

    // ===== Session =====

    pub async fn login(&mut self, email: Option<String>, remember: bool) -> Result<()> {
        if self.offline {
            bail!("Cannot sign in while offline");
        }
        let email = match email.or_else(|| self.config.last_email.clone()) {
            Some(email) => email,
            None => prompt("Email: ")?,
        };
        let password = match std::env::var(ENV_PASSWORD) {
            Ok(password) if !password.is_empty() => password,
            _ => rpassword::prompt_password("Password: ")?,
        };

        let data = self
            .api
            .authenticate(&email, &password)
            .await
            .context("Sign in failed")?;
        info!(user_id = %data.user_id, "Signed in");

        if remember {
            if let Err(e) = self.credentials().remember(&email, &password) {
                warn!(error = %e, "Failed to store credentials");
            }
        }
        println!("Signed in as {}", data.email);
        self.store_session(data);
        self.config.last_email = Some(email);
        self.config.save()?;
        Ok(())
    }

    pub fn logout(&mut self, forget: bool) -> Result<()> {
        let email = self
            .session
            .data
            .as_ref()
            .map(|d| d.email.clone())
            .or_else(|| self.config.last_email.clone());
        self.session.clear()?;
        if forget {
            if let Some(email) = email {
                if let Err(e) = self.credentials().forget(&email) {
                    debug!(error = %e, "No stored password to remove");
                }
            }
        }
        println!("Signed out");
        Ok(())
    }

    fn store_session(&mut self, data: SessionData) {
        self.api.set_token(data.access_token.as_str());
        self.session.update(data);
        if let Err(e) = self.session.save() {
            warn!(error = %e, "Failed to save session");
        }
    }

    /// Make sure the client carries a usable token: reuse the stored one,
    /// refresh it, or sign in again with remembered credentials.
    async fn ensure_session(&mut self) -> Result<()> {
        if let Some(data) = self.session.data.clone() {
            if !data.needs_refresh() {
                self.api.set_token(data.access_token.as_str());
                return Ok(());
            }
            if data.can_refresh() {
                match self.api.refresh(&data.refresh_token).await {
                    Ok(fresh) => {
                        debug!(minutes = fresh.minutes_until_expiry(), "Session refreshed");
                        self.store_session(fresh);
                        return Ok(());
                    }
                    Err(e) => warn!(error = %e, "Session refresh failed"),
                }
            }
        }

        let Some(email) = self.config.last_email.clone() else {
            bail!("Not signed in. Run `tripsync login` first.");
        };
        let password = std::env::var(ENV_PASSWORD)
            .ok()
            .filter(|p| !p.is_empty())
            .or_else(|| self.credentials().recall(&email))
            .ok_or_else(|| anyhow!("Session expired. Run `tripsync login` again."))?;
        let data = self.api.authenticate(&email, &password).await?;
        self.store_session(data);
        Ok(())
    }

    // ===== Trip access =====

    fn cache(&self) -> Result<Arc<CacheManager>> {
        let dir = self.config.cache_dir(self.session.user_id())?;
        let cache = CacheManager::new(dir)?.with_stale_minutes(self.config.sync.stale_minutes);
        Ok(Arc::new(cache))
    }

    async fn open(&mut self, trip_id: Uuid) -> Result<TripData<ApiClient>> {
        if !self.offline {
            self.ensure_session().await?;
        }
        let data = TripData::open(
            Arc::new(self.api.clone()),
            trip_id,
            SyncOptions::from(&self.config.sync),
            Some(self.cache()?),
        )
        .await;

        if self.config.last_trip_id != Some(trip_id) {
            self.config.last_trip_id = Some(trip_id);
            if let Err(e) = self.config.save() {
                warn!(error = %e, "Failed to save config");
            }
        }
        Ok(data)
    }

    /// Open a trip and load it, falling back to cached data when the
    /// backend cannot be reached.
    async fn open_loaded(&mut self, trip_id: Uuid) -> Result<TripData<ApiClient>> {
        let data = self.open(trip_id).await?;
        if self.offline {
            return Ok(data);
        }
        let err = match data.load().await {
            Ok(()) => return Ok(data),
            Err(SyncError::Unauthorized) => return Err(SyncError::Unauthorized.into()),
            Err(e) => e,
        };
        if data.store().is_loaded(Slice::Trip).await {
            eprintln!("warning: {} (showing cached data)", err);
            Ok(data)
        } else {
            data.close().await;
            Err(err.into())
        }
    }

    async fn open_for_edit(&mut self, trip_id: Uuid) -> Result<TripData<ApiClient>> {
        if self.offline {
            bail!("Editing requires a connection; drop --offline");
        }
        let data = self.open(trip_id).await?;
        data.load().await?;
        Ok(data)
    }

    pub async fn show(&mut self, trip_id: Uuid, json: bool) -> Result<()> {
        let data = self.open_loaded(trip_id).await?;
        let snapshot = data.snapshot().await;
        if snapshot.trip.is_none() {
            bail!("Trip {} is not cached; run without --offline first", trip_id);
        }
        if json {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        } else {
            let ages = self.cache()?.cache_ages(trip_id);
            print!("{}", render::trip(&snapshot));
            println!("\nLast updated {}{}", ages.last_updated(), if ages.any_stale { " (stale)" } else { "" });
        }
        data.close().await;
        Ok(())
    }

    pub async fn watch(&mut self, trip_id: Uuid, poll: Option<u64>) -> Result<()> {
        if self.offline {
            bail!("Watching requires a connection; drop --offline");
        }
        let data = self.open_loaded(trip_id).await?;
        print!("{}", render::trip(&data.snapshot().await));

        let (token_tx, token_rx) = watch::channel(self.api.token().map(|t| t.to_string()));
        let refresher = self.spawn_token_refresh(token_tx);

        if self.config.sync.realtime {
            let (url, key) = self.config.backend()?;
            data.start_realtime(RealtimeConfig::new(url, key), token_rx);
        }
        let poll = poll.unwrap_or(self.config.sync.poll_interval_secs);
        if poll > 0 {
            data.start_polling(Duration::from_secs(poll));
        }

        println!("\nWatching for changes (Ctrl-C to stop)");
        let mut events = data.subscribe();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Ok(event) if event.origin == ChangeOrigin::Fetched => {
                        let snapshot = data.snapshot().await;
                        println!("\n--- {} updated ---", event.slice);
                        match event.slice {
                            Slice::Itinerary | Slice::Trip => print!("{}", render::trip(&snapshot)),
                            Slice::Members | Slice::Tags => print!("{}", render::people_and_tags(&snapshot)),
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Missed store events, redrawing");
                        print!("{}", render::trip(&data.snapshot().await));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        refresher.abort();
        data.close().await;
        Ok(())
    }

    /// Keep the access token fresh for a long-running watch, publishing
    /// each new token to the realtime listener.
    fn spawn_token_refresh(&self, tx: watch::Sender<Option<String>>) -> JoinHandle<()> {
        let api = self.api.clone();
        let mut current = self.session.data.clone();
        let session_dir = self.session_dir.clone();
        tokio::spawn(async move {
            loop {
                let Some(data) = current.take().filter(|d| d.can_refresh()) else {
                    return;
                };
                let wait = (data.time_until_expiry().num_seconds() - TOKEN_REFRESH_MARGIN_SECS).max(0);
                tokio::time::sleep(Duration::from_secs(wait as u64)).await;

                match api.refresh(&data.refresh_token).await {
                    Ok(fresh) => {
                        info!(minutes = fresh.minutes_until_expiry(), "Access token refreshed");
                        api.set_token(fresh.access_token.as_str());
                        let _ = tx.send(Some(fresh.access_token.clone()));
                        let mut session = Session::new(session_dir.clone());
                        session.update(fresh.clone());
                        if let Err(e) = session.save() {
                            warn!(error = %e, "Failed to save refreshed session");
                        }
                        current = Some(fresh);
                    }
                    Err(e) => {
                        warn!(error = %e, "Token refresh failed, retrying in a minute");
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        current = Some(data);
                    }
                }
            }
        })
    }

    // ===== Edits =====

    pub async fn move_item(&mut self, trip_id: Uuid, item: Uuid, section: Uuid, index: usize) -> Result<()> {
        let data = self.open_for_edit(trip_id).await?;
        let result = data.mutations().move_item(item, section, index).await;
        data.close().await;
        result?;
        println!("Moved item {} to position {} in section {}", item, index, section);
        Ok(())
    }

    pub async fn add_item(
        &mut self,
        trip_id: Uuid,
        section: Uuid,
        title: String,
        location: Option<String>,
        notes: Option<String>,
    ) -> Result<()> {
        let data = self.open_for_edit(trip_id).await?;
        let draft = ItemDraft {
            title,
            location,
            notes,
            ..Default::default()
        };
        let result = data.mutations().add_item(section, draft).await;
        data.close().await;
        let item = result?;
        println!("Added {} ({})", item.title, item.id);
        Ok(())
    }

    pub async fn add_tag(&mut self, trip_id: Uuid, name: &str) -> Result<()> {
        let data = self.open_for_edit(trip_id).await?;
        let result = data.mutations().add_tag(name).await;
        data.close().await;
        let tag = result?;
        println!("Tagged with {:?}", tag.name);
        Ok(())
    }

    pub async fn remove_tag(&mut self, trip_id: Uuid, name: &str) -> Result<()> {
        let data = self.open_for_edit(trip_id).await?;
        let result = data.mutations().remove_tag_named(name).await;
        data.close().await;
        result?;
        println!("Removed tag {:?}", name.trim());
        Ok(())
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim().to_string();
    if input.is_empty() {
        bail!("No input given");
    }
    Ok(input)
}
