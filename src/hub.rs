//! The presence hub: authoritative shared state plus fan-out.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── WebSocket accept ── Roster (id → location) ── BroadcastGroup
//! Client B ──┘         │                    │
//!                  ?participant=…      full snapshot on
//!                  (handshake URI)     every change
//!                                           │
//!                                ┌──────────┼──────────┐
//!                                ▼          ▼          ▼
//!                             Client A   Client B   Client C
//! ```
//!
//! Every report triggers exactly one whole-roster broadcast, reporter
//! included. The O(participants) cost per update is the accepted scaling
//! ceiling of the whole-state design; there is no delta protocol and no
//! debounce. Roster writes are serialized behind a single lock, so each
//! report is an atomic upsert even under concurrent connections.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::BroadcastGroup;
use crate::protocol::{ClientReport, ParticipantId, PresenceSnapshot};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per connection
    pub broadcast_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub reports: u64,
    pub evictions: u64,
}

/// Participant-map bookkeeping.
///
/// The sole owner of the authoritative id → location mapping. Every
/// mutation hands back a fresh immutable snapshot for fan-out, so callers
/// never broadcast a map that can still change under them.
#[derive(Debug, Default)]
pub struct Roster {
    entries: PresenceSnapshot,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for `id`. Last writer wins — there is
    /// no staleness detection between racing reports for the same id.
    pub fn apply_report(&mut self, id: &str, report: ClientReport) -> PresenceSnapshot {
        self.entries.insert(id.to_string(), report.into());
        self.entries.clone()
    }

    /// Remove the entry for `id`. Returns the shrunken snapshot if the id
    /// was present, `None` if there was nothing to evict.
    pub fn evict(&mut self, id: &str) -> Option<PresenceSnapshot> {
        self.entries.remove(id)?;
        Some(self.entries.clone())
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        self.entries.clone()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Extract the participant id from the handshake URI query string.
fn participant_id_from_query(query: Option<&str>) -> Option<ParticipantId> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("participant="))
        .filter(|id| !id.is_empty())
        .map(|id| id.to_string())
}

/// The presence hub.
pub struct PresenceHub {
    config: HubConfig,
    /// Authoritative participant map (single-writer discipline)
    roster: Arc<RwLock<Roster>>,
    /// Hub-wide snapshot fan-out
    group: Arc<BroadcastGroup>,
    /// Hub-wide statistics
    stats: Arc<RwLock<HubStats>>,
}

impl PresenceHub {
    /// Create a new hub with the given configuration.
    pub fn new(config: HubConfig) -> Self {
        let group = Arc::new(BroadcastGroup::new(config.broadcast_capacity));
        Self {
            config,
            roster: Arc::new(RwLock::new(Roster::new())),
            group,
            stats: Arc::new(RwLock::new(HubStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(HubConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the hub event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Presence hub listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let roster = self.roster.clone();
            let group = self.group.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, roster, group, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection end to end.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        roster: Arc<RwLock<Roster>>,
        group: Arc<BroadcastGroup>,
        stats: Arc<RwLock<HubStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // The participant id travels in the handshake URI; a connection
        // without one is rejected before the upgrade completes.
        let mut participant_id: Option<ParticipantId> = None;
        let callback = |req: &Request, response: Response| {
            match participant_id_from_query(req.uri().query()) {
                Some(id) => {
                    participant_id = Some(id);
                    Ok(response)
                }
                None => {
                    let mut reject = ErrorResponse::new(Some("missing participant id".into()));
                    *reject.status_mut() = StatusCode::BAD_REQUEST;
                    Err(reject)
                }
            }
        };

        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let participant_id = participant_id.ok_or("handshake yielded no participant id")?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("Participant {participant_id} connected from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Subscribe before sending the greeting snapshot so no broadcast
        // that lands in between can be missed.
        let mut broadcast_rx = group.subscribe();

        // From here on, every failure falls through to the eviction block
        // below instead of returning early. An early return would strand
        // the participant in the roster forever.
        let greeting_sent = {
            let greeting = {
                let roster_r = roster.read().await;
                roster_r.snapshot().encode()
            };
            match greeting {
                Ok(text) => ws_sender.send(Message::text(text)).await.is_ok(),
                Err(e) => {
                    log::error!("Failed to encode greeting snapshot: {e}");
                    false
                }
            }
        };

        if greeting_sent {
            loop {
                tokio::select! {
                    // Inbound report from this participant
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match ClientReport::decode(text.as_str()) {
                                    Ok(report) => {
                                        let snapshot = {
                                            let mut roster_w = roster.write().await;
                                            roster_w.apply_report(&participant_id, report)
                                        };
                                        match snapshot.encode() {
                                            Ok(encoded) => {
                                                group.broadcast_raw(Arc::new(encoded));
                                            }
                                            Err(e) => {
                                                log::error!("Failed to encode snapshot: {e}");
                                                break;
                                            }
                                        }

                                        let mut s = stats.write().await;
                                        s.reports += 1;
                                    }
                                    Err(e) => {
                                        // Malformed reports are discarded; the
                                        // connection and the roster stay intact.
                                        log::warn!("Discarding malformed report from {participant_id}: {e}");
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Participant {participant_id} closed connection");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                if ws_sender.send(Message::Pong(data)).await.is_err() {
                                    break;
                                }
                            }

                            Some(Ok(_)) => {}

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {participant_id}: {e}");
                                break;
                            }
                        }
                    }

                    // Outbound snapshot fan-out
                    msg = broadcast_rx.recv() => {
                        match msg {
                            Ok(encoded) => {
                                if ws_sender.send(Message::text(encoded.as_str())).await.is_err() {
                                    break;
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                // A lagging connection only loses intermediate
                                // snapshots; the next one it gets is complete.
                                log::warn!("Participant {participant_id} lagged by {n} snapshots");
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        }

        // Implicit disconnect: evict and tell everyone, otherwise the
        // departed participant stays visible forever.
        let evicted = {
            let mut roster_w = roster.write().await;
            roster_w.evict(&participant_id)
        };
        if let Some(snapshot) = evicted {
            match snapshot.encode() {
                Ok(encoded) => {
                    group.broadcast_raw(Arc::new(encoded));
                }
                Err(e) => log::error!("Failed to encode eviction snapshot: {e}"),
            }
            let mut s = stats.write().await;
            s.evictions += 1;
        }

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }

        log::info!("Participant {participant_id} disconnected");
        Ok(())
    }

    /// Get hub statistics.
    pub async fn stats(&self) -> HubStats {
        self.stats.read().await.clone()
    }

    /// Get the current authoritative snapshot.
    pub async fn snapshot(&self) -> PresenceSnapshot {
        self.roster.read().await.snapshot()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the broadcast group (for monitoring).
    pub fn broadcast_group(&self) -> &Arc<BroadcastGroup> {
        &self.group
    }
}
