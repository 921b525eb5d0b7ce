//! API client for the trip backend's REST surface.
//!
//! The backend exposes its tables through a PostgREST-style API under
//! `/rest/v1`, password/refresh-token auth under `/auth/v1`, and a couple
//! of RPC functions for bulk reordering. Every request carries the
//! project's public API key; authenticated requests add a bearer token.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, Client, Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::SessionData;
use crate::models::{
    Item, ItemPatch, ItemPosition, Itinerary, Member, MemberRole, NewItem, NewMember, NewSection,
    NewTag, Section, SectionPatch, SectionPosition, Tag, Trip, TripPatch,
};
use crate::sync::TripBackend;

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Makes PostgREST return a single JSON object instead of a one-row array.
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    user: AuthUser,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: Uuid,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReorderItemsRequest<'a> {
    p_trip_id: Uuid,
    p_positions: &'a [ItemPosition],
}

#[derive(Debug, Serialize)]
struct ReorderSectionsRequest<'a> {
    p_trip_id: Uuid,
    p_positions: &'a [SectionPosition],
}

/// API client for the trip backend.
///
/// Clone is cheap: `reqwest::Client` pools connections behind an `Arc` and
/// the bearer token is shared, so a token set on one clone is seen by all.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Arc<str>,
    anon_key: Arc<str>,
    token: Arc<RwLock<Option<Arc<str>>>>,
    initial_backoff: Duration,
}

impl ApiClient {
    /// Create a new API client for a backend project
    pub fn new(base_url: &str, anon_key: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: Arc::from(base_url.trim_end_matches('/')),
            anon_key: Arc::from(anon_key),
            token: Arc::new(RwLock::new(None)),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    /// Override the rate-limit backoff (tests use a few milliseconds).
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&self, token: impl Into<Arc<str>>) {
        match self.token.write() {
            Ok(mut guard) => *guard = Some(token.into()),
            Err(poisoned) => *poisoned.into_inner() = Some(token.into()),
        }
    }

    pub fn clear_token(&self) {
        match self.token.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    pub fn token(&self) -> Option<Arc<str>> {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    // ===== Authentication =====

    /// Sign in with email and password and return session data
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<SessionData> {
        let url = format!("{}/auth/v1/token?grant_type=password", self.base_url);
        let body = serde_json::json!({ "email": email, "password": password });
        let session = self.token_request(&url, &body).await?;
        self.set_token(session.access_token.as_str());
        Ok(session)
    }

    /// Exchange a refresh token for a new session
    pub async fn refresh(&self, refresh_token: &str) -> Result<SessionData> {
        let url = format!("{}/auth/v1/token?grant_type=refresh_token", self.base_url);
        let body = serde_json::json!({ "refresh_token": refresh_token });
        let session = self.token_request(&url, &body).await?;
        self.set_token(session.access_token.as_str());
        Ok(session)
    }

    async fn token_request(&self, url: &str, body: &serde_json::Value) -> Result<SessionData> {
        let response = self
            .client
            .post(url)
            .header("apikey", self.anon_key.as_ref())
            .json(body)
            .send()
            .await
            .context("Failed to send authentication request")?;

        let response = Self::check_response(response).await?;
        let auth: AuthResponse = response.json().await.context("Failed to parse auth response")?;

        Ok(SessionData {
            access_token: auth.access_token,
            refresh_token: auth.refresh_token,
            user_id: auth.user.id,
            email: auth.user.email.unwrap_or_default(),
            expires_at: Utc::now() + chrono::Duration::seconds(auth.expires_in),
        })
    }

    // ===== Request plumbing =====

    fn auth_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        headers.insert("apikey", header::HeaderValue::from_str(&self.anon_key)?);
        let bearer = self.token().unwrap_or_else(|| Arc::clone(&self.anon_key));
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", bearer))?,
        );
        Ok(headers)
    }

    fn rest_url(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, path)
    }

    fn request(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        Ok(self.client.request(method, url).headers(self.auth_headers()?))
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }

    /// Send a request, rebuilding and retrying it with exponential backoff
    /// while the server answers 429.
    async fn send<F>(&self, describe: &str, build: F) -> Result<Response>
    where
        F: Fn() -> Result<RequestBuilder>,
    {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let response = build()?
                .send()
                .await
                .with_context(|| format!("Failed to send {}", describe))?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited.into());
                    }
                    warn!(request = describe, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.rest_url(path);
        let response = self
            .send(&format!("GET {}", path), || self.request(Method::GET, &url))
            .await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse JSON response from {}", path))
    }

    async fn get_one<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.rest_url(path);
        let response = self
            .send(&format!("GET {}", path), || {
                Ok(self
                    .request(Method::GET, &url)?
                    .header(header::ACCEPT, SINGLE_OBJECT))
            })
            .await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse JSON response from {}", path))
    }

    /// POST or PATCH a row and return the stored representation.
    async fn write_one<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = self.rest_url(path);
        let describe = format!("{} {}", method, path);
        let response = self
            .send(&describe, || {
                Ok(self
                    .request(method.clone(), &url)?
                    .header(header::ACCEPT, SINGLE_OBJECT)
                    .header("Prefer", "return=representation")
                    .json(body))
            })
            .await?;
        let text = response
            .text()
            .await
            .with_context(|| format!("Failed to read response body from {}", describe))?;
        if text.trim().is_empty() {
            return Err(ApiError::InvalidResponse(format!("{} returned no row", describe)).into());
        }
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse JSON response from {}", describe))
    }

    async fn delete(&self, table: &str, id: Uuid) -> Result<()> {
        let path = format!("{}?id=eq.{}", table, id);
        let url = self.rest_url(&path);
        self.send(&format!("DELETE {}", path), || self.request(Method::DELETE, &url))
            .await?;
        Ok(())
    }

    async fn rpc<B: Serialize + ?Sized>(&self, function: &str, body: &B) -> Result<()> {
        let url = self.rest_url(&format!("rpc/{}", function));
        self.send(&format!("RPC {}", function), || {
            Ok(self.request(Method::POST, &url)?.json(body))
        })
        .await?;
        Ok(())
    }

    // ===== Data Fetching Methods =====

    pub async fn fetch_trip(&self, trip_id: Uuid) -> Result<Trip> {
        self.get_one(&format!("trips?id=eq.{}&select=*", trip_id))
            .await
            .context("Failed to fetch trip")
    }

    pub async fn fetch_sections(&self, trip_id: Uuid) -> Result<Vec<Section>> {
        self.get(&format!(
            "itinerary_sections?trip_id=eq.{}&select=*&order=position.asc",
            trip_id
        ))
        .await
        .context("Failed to fetch itinerary sections")
    }

    pub async fn fetch_items(&self, trip_id: Uuid) -> Result<Vec<Item>> {
        self.get(&format!(
            "itinerary_items?trip_id=eq.{}&select=*&order=position.asc",
            trip_id
        ))
        .await
        .context("Failed to fetch itinerary items")
    }

    /// Fetch sections and items concurrently and merge them.
    pub async fn fetch_itinerary(&self, trip_id: Uuid) -> Result<Itinerary> {
        let (sections, items) = tokio::join!(self.fetch_sections(trip_id), self.fetch_items(trip_id));
        let (sections, items) = (sections?, items?);

        let orphans = items
            .iter()
            .filter(|i| !sections.iter().any(|s| s.id == i.section_id))
            .count();
        if orphans > 0 {
            // a section was deleted between the two reads
            debug!(trip_id = %trip_id, orphans, "Dropping items without a section");
        }
        let items = items
            .into_iter()
            .filter(|i| sections.iter().any(|s| s.id == i.section_id))
            .collect();

        Ok(Itinerary::from_rows(sections, items))
    }

    pub async fn fetch_members(&self, trip_id: Uuid) -> Result<Vec<Member>> {
        self.get(&format!(
            "trip_members?trip_id=eq.{}&select=*&order=joined_at.asc.nullslast",
            trip_id
        ))
        .await
        .context("Failed to fetch trip members")
    }

    pub async fn fetch_tags(&self, trip_id: Uuid) -> Result<Vec<Tag>> {
        self.get(&format!("trip_tags?trip_id=eq.{}&select=*&order=name.asc", trip_id))
            .await
            .context("Failed to fetch trip tags")
    }

    // ===== Write Methods =====

    pub async fn update_trip(&self, trip_id: Uuid, patch: &TripPatch) -> Result<Trip> {
        if patch.is_empty() {
            return Err(anyhow!("Refusing to send an empty trip update"));
        }
        self.write_one(Method::PATCH, &format!("trips?id=eq.{}", trip_id), patch)
            .await
            .context("Failed to update trip")
    }

    pub async fn create_section(&self, section: &NewSection) -> Result<Section> {
        self.write_one(Method::POST, "itinerary_sections", section)
            .await
            .context("Failed to create section")
    }

    pub async fn update_section(&self, section_id: Uuid, patch: &SectionPatch) -> Result<Section> {
        self.write_one(
            Method::PATCH,
            &format!("itinerary_sections?id=eq.{}", section_id),
            patch,
        )
        .await
        .context("Failed to update section")
    }

    pub async fn delete_section(&self, section_id: Uuid) -> Result<()> {
        self.delete("itinerary_sections", section_id)
            .await
            .context("Failed to delete section")
    }

    pub async fn reorder_sections(&self, trip_id: Uuid, positions: &[SectionPosition]) -> Result<()> {
        let body = ReorderSectionsRequest {
            p_trip_id: trip_id,
            p_positions: positions,
        };
        self.rpc("reorder_itinerary_sections", &body)
            .await
            .context("Failed to reorder sections")
    }

    pub async fn create_item(&self, item: &NewItem) -> Result<Item> {
        self.write_one(Method::POST, "itinerary_items", item)
            .await
            .context("Failed to create itinerary item")
    }

    pub async fn update_item(&self, item_id: Uuid, patch: &ItemPatch) -> Result<Item> {
        self.write_one(Method::PATCH, &format!("itinerary_items?id=eq.{}", item_id), patch)
            .await
            .context("Failed to update itinerary item")
    }

    pub async fn delete_item(&self, item_id: Uuid) -> Result<()> {
        self.delete("itinerary_items", item_id)
            .await
            .context("Failed to delete itinerary item")
    }

    pub async fn reorder_items(&self, trip_id: Uuid, positions: &[ItemPosition]) -> Result<()> {
        let body = ReorderItemsRequest {
            p_trip_id: trip_id,
            p_positions: positions,
        };
        self.rpc("reorder_itinerary_items", &body)
            .await
            .context("Failed to reorder itinerary items")
    }

    pub async fn add_tag(&self, tag: &NewTag) -> Result<Tag> {
        self.write_one(Method::POST, "trip_tags", tag)
            .await
            .context("Failed to add tag")
    }

    pub async fn remove_tag(&self, tag_id: Uuid) -> Result<()> {
        self.delete("trip_tags", tag_id)
            .await
            .context("Failed to remove tag")
    }

    pub async fn invite_member(&self, member: &NewMember) -> Result<Member> {
        self.write_one(Method::POST, "trip_members", member)
            .await
            .context("Failed to invite member")
    }

    pub async fn update_member_role(&self, member_id: Uuid, role: MemberRole) -> Result<Member> {
        let body = serde_json::json!({ "role": role });
        self.write_one(Method::PATCH, &format!("trip_members?id=eq.{}", member_id), &body)
            .await
            .context("Failed to change member role")
    }

    pub async fn remove_member(&self, member_id: Uuid) -> Result<()> {
        self.delete("trip_members", member_id)
            .await
            .context("Failed to remove member")
    }
}

#[async_trait]
impl TripBackend for ApiClient {
    async fn fetch_trip(&self, trip_id: Uuid) -> Result<Trip> {
        ApiClient::fetch_trip(self, trip_id).await
    }

    async fn fetch_itinerary(&self, trip_id: Uuid) -> Result<Itinerary> {
        ApiClient::fetch_itinerary(self, trip_id).await
    }

    async fn fetch_members(&self, trip_id: Uuid) -> Result<Vec<Member>> {
        ApiClient::fetch_members(self, trip_id).await
    }

    async fn fetch_tags(&self, trip_id: Uuid) -> Result<Vec<Tag>> {
        ApiClient::fetch_tags(self, trip_id).await
    }

    async fn update_trip(&self, trip_id: Uuid, patch: &TripPatch) -> Result<Trip> {
        ApiClient::update_trip(self, trip_id, patch).await
    }

    async fn create_section(&self, section: &NewSection) -> Result<Section> {
        ApiClient::create_section(self, section).await
    }

    async fn update_section(&self, section_id: Uuid, patch: &SectionPatch) -> Result<Section> {
        ApiClient::update_section(self, section_id, patch).await
    }

    async fn delete_section(&self, section_id: Uuid) -> Result<()> {
        ApiClient::delete_section(self, section_id).await
    }

    async fn reorder_sections(&self, trip_id: Uuid, positions: &[SectionPosition]) -> Result<()> {
        ApiClient::reorder_sections(self, trip_id, positions).await
    }

    async fn create_item(&self, item: &NewItem) -> Result<Item> {
        ApiClient::create_item(self, item).await
    }

    async fn update_item(&self, item_id: Uuid, patch: &ItemPatch) -> Result<Item> {
        ApiClient::update_item(self, item_id, patch).await
    }

    async fn delete_item(&self, item_id: Uuid) -> Result<()> {
        ApiClient::delete_item(self, item_id).await
    }

    async fn reorder_items(&self, trip_id: Uuid, positions: &[ItemPosition]) -> Result<()> {
        ApiClient::reorder_items(self, trip_id, positions).await
    }

    async fn add_tag(&self, tag: &NewTag) -> Result<Tag> {
        ApiClient::add_tag(self, tag).await
    }

    async fn remove_tag(&self, tag_id: Uuid) -> Result<()> {
        ApiClient::remove_tag(self, tag_id).await
    }

    async fn invite_member(&self, member: &NewMember) -> Result<Member> {
        ApiClient::invite_member(self, member).await
    }

    async fn update_member_role(&self, member_id: Uuid, role: MemberRole) -> Result<Member> {
        ApiClient::update_member_role(self, member_id, role).await
    }

    async fn remove_member(&self, member_id: Uuid) -> Result<()> {
        ApiClient::remove_member(self, member_id).await
    }
}
