//! Realtime invalidation listener.
//!
//! Keeps a WebSocket open to the backend's realtime endpoint, joins the
//! trip's channel and turns every row change into an [`Invalidation`] for
//! the slice that row belongs to. Changes carry no data we apply directly;
//! the affected slice is simply revalidated.
//!
//! Messages use the channel protocol's JSON envelope:
//! `{"topic": .., "event": .., "payload": .., "ref": ..}`.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::Slice;

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(25);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(150);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

const PROTOCOL_VERSION: &str = "1.0.0";
const PHOENIX_TOPIC: &str = "phoenix";

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Invalid realtime URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket connect failed: {0}")]
    Connect(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("WebSocket error: {0}")]
    Socket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("Connection closed by server")]
    Closed,

    #[error("Channel join rejected: {0}")]
    JoinRejected(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Backend project URL (`https://...`), same as the REST client's.
    pub base_url: String,
    pub api_key: String,
    pub heartbeat: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RealtimeConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            heartbeat: DEFAULT_HEARTBEAT,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }

    /// `wss://<host>/realtime/v1/websocket?apikey=<key>&vsn=1.0.0`
    pub fn socket_url(&self) -> Result<Url, RealtimeError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| RealtimeError::InvalidUrl(e.to_string()))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(RealtimeError::InvalidUrl(format!("unsupported scheme {}", other))),
        };
        url.set_scheme(scheme)
            .map_err(|_| RealtimeError::InvalidUrl(self.base_url.clone()))?;

        let path = format!("{}/realtime/v1/websocket", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", &self.api_key)
            .append_pair("vsn", PROTOCOL_VERSION);
        Ok(url)
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change notification.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RowChange {
    pub table: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub record: Option<Value>,
    #[serde(default)]
    pub old_record: Option<Value>,
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl RowChange {
    pub fn slice(&self) -> Option<Slice> {
        Slice::for_table(&self.table)
    }

    /// Id of the changed row; deletes only carry it in `old_record`.
    pub fn row_id(&self) -> Option<Uuid> {
        [&self.record, &self.old_record]
            .into_iter()
            .flatten()
            .find_map(|row| row.get("id")?.as_str()?.parse().ok())
    }
}

/// A decoded server message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Reply {
        reference: Option<String>,
        ok: bool,
        response: Value,
    },
    Change(RowChange),
    /// Status report for the channel's subscriptions.
    System { ok: bool, message: String },
    ChannelError,
    ChannelClosed,
    Other(String),
}

pub fn decode(text: &str) -> Result<Inbound, serde_json::Error> {
    let message: ChannelMessage = serde_json::from_str(text)?;
    let payload = message.payload;
    Ok(match message.event.as_str() {
        "phx_reply" => Inbound::Reply {
            reference: message.reference,
            ok: payload.get("status").and_then(Value::as_str) == Some("ok"),
            response: payload.get("response").cloned().unwrap_or(Value::Null),
        },
        "postgres_changes" => {
            let data = payload.get("data").cloned().unwrap_or(Value::Null);
            Inbound::Change(serde_json::from_value(data)?)
        }
        "system" => Inbound::System {
            ok: payload.get("status").and_then(Value::as_str) == Some("ok"),
            message: payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        "phx_error" => Inbound::ChannelError,
        "phx_close" => Inbound::ChannelClosed,
        other => Inbound::Other(other.to_string()),
    })
}

pub fn trip_topic(trip_id: Uuid) -> String {
    format!("realtime:trip:{}", trip_id)
}

fn change_subscriptions(trip_id: Uuid) -> Vec<Value> {
    Slice::ALL
        .iter()
        .flat_map(|slice| slice.tables().iter())
        .map(|table| {
            let column = if *table == "trips" { "id" } else { "trip_id" };
            json!({
                "event": "*",
                "schema": "public",
                "table": table,
                "filter": format!("{}=eq.{}", column, trip_id),
            })
        })
        .collect()
}

pub fn join_message(trip_id: Uuid, access_token: Option<&str>, reference: &str) -> ChannelMessage {
    let mut payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": change_subscriptions(trip_id),
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }
    ChannelMessage {
        topic: trip_topic(trip_id),
        event: "phx_join".to_string(),
        payload,
        reference: Some(reference.to_string()),
        join_ref: Some(reference.to_string()),
    }
}

pub fn heartbeat_message(reference: &str) -> ChannelMessage {
    ChannelMessage {
        topic: PHOENIX_TOPIC.to_string(),
        event: "heartbeat".to_string(),
        payload: json!({}),
        reference: Some(reference.to_string()),
        join_ref: None,
    }
}

pub fn access_token_message(trip_id: Uuid, access_token: &str, reference: &str) -> ChannelMessage {
    ChannelMessage {
        topic: trip_topic(trip_id),
        event: "access_token".to_string(),
        payload: json!({ "access_token": access_token }),
        reference: Some(reference.to_string()),
        join_ref: None,
    }
}

// ============================================================================
// Invalidations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    Slice(Slice),
    /// Changes may have been missed; revalidate everything.
    Resync,
}

/// Invalidations collected over one debounce window.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct InvalidationBatch {
    slices: BTreeSet<Slice>,
    resync: bool,
}

impl InvalidationBatch {
    pub fn add(&mut self, invalidation: Invalidation) {
        match invalidation {
            Invalidation::Slice(slice) => {
                self.slices.insert(slice);
            }
            Invalidation::Resync => self.resync = true,
        }
    }

    pub fn is_resync(&self) -> bool {
        self.resync
    }

    pub fn slices(&self) -> Vec<Slice> {
        if self.resync {
            Slice::ALL.to_vec()
        } else {
            self.slices.iter().copied().collect()
        }
    }
}

/// Wait for the next invalidation, then keep collecting for `debounce`.
/// Returns `None` once every sender is gone and nothing is buffered.
pub async fn next_batch(
    rx: &mut mpsc::Receiver<Invalidation>,
    debounce: Duration,
) -> Option<InvalidationBatch> {
    let mut batch = InvalidationBatch::default();
    batch.add(rx.recv().await?);

    let window = tokio::time::sleep(debounce);
    tokio::pin!(window);
    loop {
        tokio::select! {
            _ = &mut window => break,
            next = rx.recv() => match next {
                Some(invalidation) => batch.add(invalidation),
                None => break,
            },
        }
    }
    Some(batch)
}

// ============================================================================
// Backoff
// ============================================================================

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay before the next attempt; doubles up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

// ============================================================================
// Listener
// ============================================================================

enum SessionEnd {
    Shutdown,
    ReceiverGone,
}

pub struct RealtimeListener {
    config: RealtimeConfig,
    trip_id: Uuid,
    token: watch::Receiver<Option<String>>,
    invalidations: mpsc::Sender<Invalidation>,
    next_ref: u64,
}

impl RealtimeListener {
    pub fn new(
        config: RealtimeConfig,
        trip_id: Uuid,
        token: watch::Receiver<Option<String>>,
        invalidations: mpsc::Sender<Invalidation>,
    ) -> Self {
        Self {
            config,
            trip_id,
            token,
            invalidations,
            next_ref: 0,
        }
    }

    /// Run until `shutdown` flips to true (or its sender is dropped) or the
    /// invalidation receiver goes away, reconnecting after every failure.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        loop {
            match self.session(&mut shutdown, &mut backoff).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::ReceiverGone) => {
                    debug!(trip_id = %self.trip_id, "Invalidation receiver dropped");
                    break;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        trip_id = %self.trip_id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Realtime connection lost"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        info!(trip_id = %self.trip_id, "Realtime listener stopped");
    }

    fn reference(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    async fn session(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> Result<SessionEnd, RealtimeError> {
        if *shutdown.borrow() {
            return Ok(SessionEnd::Shutdown);
        }

        let url = self.config.socket_url()?;
        debug!(trip_id = %self.trip_id, host = url.host_str().unwrap_or_default(), "Connecting to realtime");
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| RealtimeError::Connect(Box::new(e)))?;

        let join_ref = self.reference();
        let token = self.token.borrow_and_update().clone();
        let join = join_message(self.trip_id, token.as_deref(), &join_ref);
        ws.send(Message::Text(serde_json::to_string(&join)?.into()))
            .await
            .map_err(|e| RealtimeError::Socket(Box::new(e)))?;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat);
        // The first tick completes immediately
        heartbeat.tick().await;
        let mut joined = false;
        let mut token_open = true;
        // Token changed before the join was acknowledged
        let mut token_deferred = false;

        loop {
            let outgoing = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = ws.close(None).await;
                        return Ok(SessionEnd::Shutdown);
                    }
                    None
                }
                _ = heartbeat.tick() => {
                    let reference = self.reference();
                    Some(heartbeat_message(&reference))
                }
                changed = self.token.changed(), if token_open => {
                    if changed.is_err() {
                        token_open = false;
                        None
                    } else {
                        let token = self.token.borrow_and_update().clone();
                        match token {
                            Some(token) if joined => {
                                debug!(trip_id = %self.trip_id, "Pushing refreshed access token");
                                let reference = self.reference();
                                Some(access_token_message(self.trip_id, &token, &reference))
                            }
                            Some(_) => {
                                token_deferred = true;
                                None
                            }
                            None => None,
                        }
                    }
                }
                incoming = ws.next() => {
                    let text = match incoming {
                        None => return Err(RealtimeError::Closed),
                        Some(Err(e)) => return Err(RealtimeError::Socket(Box::new(e))),
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) => return Err(RealtimeError::Closed),
                        Some(Ok(_)) => continue,
                    };
                    let inbound = match decode(text.as_str()) {
                        Ok(inbound) => inbound,
                        Err(e) => {
                            debug!(error = %e, "Ignoring undecodable realtime message");
                            continue;
                        }
                    };
                    if let Some(end) = self.handle(inbound, &join_ref, &mut joined, backoff).await? {
                        return Ok(end);
                    }
                    if joined && token_deferred {
                        token_deferred = false;
                        let token = self.token.borrow().clone();
                        token.map(|token| {
                            debug!(trip_id = %self.trip_id, "Pushing access token refreshed during join");
                            let reference = self.reference();
                            access_token_message(self.trip_id, &token, &reference)
                        })
                    } else {
                        None
                    }
                }
            };

            if let Some(message) = outgoing {
                ws.send(Message::Text(serde_json::to_string(&message)?.into()))
                    .await
                    .map_err(|e| RealtimeError::Socket(Box::new(e)))?;
            }
        }
    }

    async fn handle(
        &mut self,
        inbound: Inbound,
        join_ref: &str,
        joined: &mut bool,
        backoff: &mut Backoff,
    ) -> Result<Option<SessionEnd>, RealtimeError> {
        match inbound {
            Inbound::Reply {
                reference,
                ok,
                response,
            } if reference.as_deref() == Some(join_ref) => {
                if !ok {
                    return Err(RealtimeError::JoinRejected(response.to_string()));
                }
                *joined = true;
                backoff.reset();
                info!(trip_id = %self.trip_id, "Joined realtime channel");
                // Changes made before the subscription was live were not seen
                return Ok(self.emit(Invalidation::Resync).await);
            }
            Inbound::Reply { ok: false, response, .. } => {
                debug!(trip_id = %self.trip_id, %response, "Realtime request failed");
            }
            Inbound::Change(change) => match change.slice() {
                Some(slice) => {
                    debug!(
                        trip_id = %self.trip_id,
                        table = %change.table,
                        kind = ?change.kind,
                        row_id = ?change.row_id(),
                        "Row changed"
                    );
                    return Ok(self.emit(Invalidation::Slice(slice)).await);
                }
                None => debug!(table = %change.table, "Ignoring change to unrelated table"),
            },
            Inbound::System { ok: false, message } => return Err(RealtimeError::Channel(message)),
            Inbound::ChannelError => return Err(RealtimeError::Channel("server reported channel error".into())),
            Inbound::ChannelClosed => return Err(RealtimeError::Closed),
            Inbound::Reply { .. } | Inbound::System { .. } | Inbound::Other(_) => {}
        }
        Ok(None)
    }

    async fn emit(&self, invalidation: Invalidation) -> Option<SessionEnd> {
        match self.invalidations.send(invalidation).await {
            Ok(()) => None,
            Err(_) => Some(SessionEnd::ReceiverGone),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // URL and outgoing messages
    // -------------------------------------------------------------------------

    #[test]
    fn test_socket_url() {
        let config = RealtimeConfig::new("https://abc.example.co", "anon-key");
        assert_eq!(
            config.socket_url().unwrap().as_str(),
            "wss://abc.example.co/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );

        let local = RealtimeConfig::new("http://127.0.0.1:54321/", "k");
        assert_eq!(
            local.socket_url().unwrap().as_str(),
            "ws://127.0.0.1:54321/realtime/v1/websocket?apikey=k&vsn=1.0.0"
        );

        assert!(RealtimeConfig::new("ftp://x", "k").socket_url().is_err());
        assert!(RealtimeConfig::new("not a url", "k").socket_url().is_err());
    }

    #[test]
    fn test_join_message_subscribes_to_every_trip_table() {
        let trip_id = Uuid::new_v4();
        let join = join_message(trip_id, Some("jwt"), "1");
        let encoded: Value = serde_json::to_value(&join).unwrap();

        assert_eq!(encoded["topic"], format!("realtime:trip:{}", trip_id));
        assert_eq!(encoded["event"], "phx_join");
        assert_eq!(encoded["ref"], "1");
        assert_eq!(encoded["payload"]["access_token"], "jwt");

        let changes = encoded["payload"]["config"]["postgres_changes"].as_array().unwrap();
        let filters: Vec<(&str, &str)> = changes
            .iter()
            .map(|c| (c["table"].as_str().unwrap(), c["filter"].as_str().unwrap()))
            .collect();
        assert_eq!(filters.len(), 5);
        assert!(filters.contains(&("trips", format!("id=eq.{}", trip_id).as_str())));
        assert!(filters.contains(&("itinerary_items", format!("trip_id=eq.{}", trip_id).as_str())));
        assert!(filters.contains(&("trip_tags", format!("trip_id=eq.{}", trip_id).as_str())));
    }

    #[test]
    fn test_heartbeat_message() {
        let encoded = serde_json::to_value(heartbeat_message("7")).unwrap();
        assert_eq!(
            encoded,
            json!({"topic": "phoenix", "event": "heartbeat", "payload": {}, "ref": "7"})
        );
    }

    // -------------------------------------------------------------------------
    // Decoding
    // -------------------------------------------------------------------------

    #[test]
    fn test_decode_row_change() {
        let id = Uuid::new_v4();
        let text = json!({
            "topic": "realtime:trip:x",
            "event": "postgres_changes",
            "ref": null,
            "payload": {
                "ids": [1],
                "data": {
                    "schema": "public",
                    "table": "itinerary_items",
                    "type": "DELETE",
                    "commit_timestamp": "2026-03-01T10:00:00Z",
                    "record": null,
                    "old_record": { "id": id.to_string() },
                    "columns": [],
                    "errors": null
                }
            }
        })
        .to_string();

        match decode(&text).unwrap() {
            Inbound::Change(change) => {
                assert_eq!(change.kind, ChangeKind::Delete);
                assert_eq!(change.slice(), Some(Slice::Itinerary));
                assert_eq!(change.row_id(), Some(id));
                assert!(change.commit_timestamp.is_some());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_replies_and_control_events() {
        let ok = r#"{"topic":"realtime:trip:x","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"1"}"#;
        assert!(matches!(
            decode(ok).unwrap(),
            Inbound::Reply { ok: true, reference: Some(r), .. } if r == "1"
        ));

        let rejected = r#"{"topic":"realtime:trip:x","event":"phx_reply","payload":{"status":"error","response":{"reason":"unauthorized"}},"ref":"1"}"#;
        assert!(matches!(decode(rejected).unwrap(), Inbound::Reply { ok: false, .. }));

        let system = r#"{"topic":"realtime:trip:x","event":"system","payload":{"status":"error","message":"bad filter"},"ref":null}"#;
        assert_eq!(
            decode(system).unwrap(),
            Inbound::System { ok: false, message: "bad filter".into() }
        );

        let closed = r#"{"topic":"realtime:trip:x","event":"phx_close","payload":{},"ref":"1"}"#;
        assert_eq!(decode(closed).unwrap(), Inbound::ChannelClosed);

        let presence = r#"{"topic":"realtime:trip:x","event":"presence_state","payload":{},"ref":null}"#;
        assert_eq!(decode(presence).unwrap(), Inbound::Other("presence_state".into()));

        assert!(decode("not json").is_err());
    }

    // -------------------------------------------------------------------------
    // Coalescing and backoff
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_burst_is_coalesced() {
        let (tx, mut rx) = mpsc::channel(16);
        for slice in [Slice::Itinerary, Slice::Tags, Slice::Itinerary, Slice::Itinerary] {
            tx.send(Invalidation::Slice(slice)).await.unwrap();
        }

        let batch = next_batch(&mut rx, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.slices(), vec![Slice::Itinerary, Slice::Tags]);
        assert!(!batch.is_resync());

        tx.send(Invalidation::Resync).await.unwrap();
        let batch = next_batch(&mut rx, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.slices(), Slice::ALL.to_vec());

        drop(tx);
        assert!(next_batch(&mut rx, Duration::from_millis(10)).await.is_none());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    // -------------------------------------------------------------------------
    // Channel replies
    // -------------------------------------------------------------------------

    fn listener(buffer: usize) -> (RealtimeListener, mpsc::Receiver<Invalidation>) {
        let (_token_tx, token_rx) = watch::channel(None);
        let (tx, rx) = mpsc::channel(buffer);
        let config = RealtimeConfig::new("http://127.0.0.1:1", "k");
        (RealtimeListener::new(config, Uuid::new_v4(), token_rx, tx), rx)
    }

    fn used_backoff() -> Backoff {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        backoff.next_delay();
        backoff.next_delay();
        backoff
    }

    fn reply(reference: &str, ok: bool) -> Inbound {
        Inbound::Reply {
            reference: Some(reference.to_string()),
            ok,
            response: json!({}),
        }
    }

    #[tokio::test]
    async fn test_join_reply_resets_backoff_and_resyncs() {
        let (mut listener, mut rx) = listener(4);
        let mut backoff = used_backoff();
        let mut joined = false;

        let end = listener.handle(reply("3", true), "3", &mut joined, &mut backoff).await.unwrap();
        assert!(end.is_none());
        assert!(joined);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(rx.try_recv().unwrap(), Invalidation::Resync);
    }

    #[tokio::test]
    async fn test_rejected_join_keeps_backoff() {
        let (mut listener, mut rx) = listener(4);
        let mut backoff = used_backoff();
        let mut joined = false;

        let result = listener.handle(reply("3", false), "3", &mut joined, &mut backoff).await;
        assert!(matches!(result, Err(RealtimeError::JoinRejected(_))));
        assert!(!joined);
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert!(rx.try_recv().is_err());

        // A failed reply to some other request is not a join failure
        let other = listener.handle(reply("9", false), "3", &mut joined, &mut backoff).await;
        assert!(matches!(other, Ok(None)));
    }

    #[tokio::test]
    async fn test_channel_error_and_close_end_the_session() {
        let (mut listener, _rx) = listener(4);
        let mut backoff = used_backoff();
        let mut joined = true;

        let error = listener.handle(Inbound::ChannelError, "1", &mut joined, &mut backoff).await;
        assert!(matches!(error, Err(RealtimeError::Channel(_))));
        let closed = listener.handle(Inbound::ChannelClosed, "1", &mut joined, &mut backoff).await;
        assert!(matches!(closed, Err(RealtimeError::Closed)));
        let system = Inbound::System { ok: false, message: "bad filter".into() };
        let failed = listener.handle(system, "1", &mut joined, &mut backoff).await;
        assert!(matches!(failed, Err(RealtimeError::Channel(m)) if m == "bad filter"));
    }

    #[tokio::test]
    async fn test_dropped_receiver_ends_the_session() {
        let (mut listener, rx) = listener(4);
        drop(rx);
        let mut joined = false;
        let end = listener
            .handle(reply("1", true), "1", &mut joined, &mut used_backoff())
            .await
            .unwrap();
        assert!(matches!(end, Some(SessionEnd::ReceiverGone)));
    }

    // -------------------------------------------------------------------------
    // Against a local socket
    // -------------------------------------------------------------------------

    mod socket {
        use super::*;
        use tokio::net::{TcpListener, TcpStream};
        use tokio_tungstenite::WebSocketStream;

        type Server = WebSocketStream<TcpStream>;

        const WAIT: Duration = Duration::from_secs(5);

        async fn accept(listener: &TcpListener) -> Server {
            let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
                .await
                .expect("no connection")
                .unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        }

        async fn recv(ws: &mut Server) -> ChannelMessage {
            loop {
                let frame = tokio::time::timeout(WAIT, ws.next())
                    .await
                    .expect("no frame")
                    .expect("socket closed")
                    .unwrap();
                if let Message::Text(text) = frame {
                    let message: ChannelMessage = serde_json::from_str(text.as_str()).unwrap();
                    if message.event != "heartbeat" {
                        return message;
                    }
                }
            }
        }

        async fn send(ws: &mut Server, message: Value) {
            ws.send(Message::Text(message.to_string().into())).await.unwrap();
        }

        async fn next_invalidation(rx: &mut mpsc::Receiver<Invalidation>) -> Invalidation {
            tokio::time::timeout(WAIT, rx.recv())
                .await
                .expect("no invalidation")
                .expect("listener gone")
        }

        fn join_reply(join: &ChannelMessage, status: &str) -> Value {
            json!({
                "topic": join.topic,
                "event": "phx_reply",
                "payload": { "status": status, "response": {} },
                "ref": join.reference,
            })
        }

        #[tokio::test]
        async fn test_listener_session_lifecycle() {
            let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let mut config = RealtimeConfig::new(format!("http://{}", server.local_addr().unwrap()), "anon");
            config.heartbeat = Duration::from_secs(60);
            config.initial_backoff = Duration::from_millis(10);
            config.max_backoff = Duration::from_millis(50);

            let trip_id = Uuid::new_v4();
            let (token_tx, token_rx) = watch::channel(Some("jwt-1".to_string()));
            let (tx, mut rx) = mpsc::channel(16);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(RealtimeListener::new(config, trip_id, token_rx, tx).run(shutdown_rx));

            // Join handshake
            let mut ws = accept(&server).await;
            let join = recv(&mut ws).await;
            assert_eq!(join.event, "phx_join");
            assert_eq!(join.topic, trip_topic(trip_id));
            assert_eq!(join.payload["access_token"], "jwt-1");
            send(&mut ws, join_reply(&join, "ok")).await;
            assert_eq!(next_invalidation(&mut rx).await, Invalidation::Resync);

            // Row change
            send(
                &mut ws,
                json!({
                    "topic": join.topic,
                    "event": "postgres_changes",
                    "payload": { "data": {
                        "table": "trip_tags",
                        "type": "INSERT",
                        "record": { "id": Uuid::new_v4() },
                    }},
                    "ref": null,
                }),
            )
            .await;
            assert_eq!(next_invalidation(&mut rx).await, Invalidation::Slice(Slice::Tags));

            // Token refresh after the join
            token_tx.send(Some("jwt-2".to_string())).unwrap();
            let pushed = recv(&mut ws).await;
            assert_eq!(pushed.event, "access_token");
            assert_eq!(pushed.payload["access_token"], "jwt-2");

            // Lost connection: reconnect, rejoin with the current token, resync
            drop(ws);
            let mut ws = accept(&server).await;
            let rejoin = recv(&mut ws).await;
            assert_eq!(rejoin.event, "phx_join");
            assert_eq!(rejoin.payload["access_token"], "jwt-2");
            send(&mut ws, join_reply(&rejoin, "ok")).await;
            assert_eq!(next_invalidation(&mut rx).await, Invalidation::Resync);

            shutdown_tx.send(true).unwrap();
            tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn test_token_refreshed_during_join_is_pushed_after_reply() {
            let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let mut config = RealtimeConfig::new(format!("http://{}", server.local_addr().unwrap()), "anon");
            config.heartbeat = Duration::from_secs(60);

            let (token_tx, token_rx) = watch::channel(Some("jwt-1".to_string()));
            let (tx, mut rx) = mpsc::channel(16);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(RealtimeListener::new(config, Uuid::new_v4(), token_rx, tx).run(shutdown_rx));

            let mut ws = accept(&server).await;
            let join = recv(&mut ws).await;
            assert_eq!(join.payload["access_token"], "jwt-1");

            token_tx.send(Some("jwt-2".to_string())).unwrap();
            // Let the listener observe the change before the reply arrives
            tokio::time::sleep(Duration::from_millis(50)).await;
            send(&mut ws, join_reply(&join, "ok")).await;
            assert_eq!(next_invalidation(&mut rx).await, Invalidation::Resync);

            let pushed = recv(&mut ws).await;
            assert_eq!(pushed.event, "access_token");
            assert_eq!(pushed.payload["access_token"], "jwt-2");

            shutdown_tx.send(true).unwrap();
            tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn test_rejected_join_reconnects() {
            let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let mut config = RealtimeConfig::new(format!("http://{}", server.local_addr().unwrap()), "anon");
            config.heartbeat = Duration::from_secs(60);
            config.initial_backoff = Duration::from_millis(10);

            let (_token_tx, token_rx) = watch::channel(None);
            let (tx, mut rx) = mpsc::channel(16);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(RealtimeListener::new(config, Uuid::new_v4(), token_rx, tx).run(shutdown_rx));

            let mut ws = accept(&server).await;
            let join = recv(&mut ws).await;
            assert!(join.payload.get("access_token").is_none());
            send(&mut ws, join_reply(&join, "error")).await;

            let mut ws = accept(&server).await;
            let retry = recv(&mut ws).await;
            assert_eq!(retry.event, "phx_join");
            assert_ne!(retry.reference, join.reference);
            assert!(rx.try_recv().is_err());

            shutdown_tx.send(true).unwrap();
            tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        }
    }
}
