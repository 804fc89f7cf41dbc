//! Client side of the sync channel.
//!
//! One persistent WebSocket per participant, with the participant id
//! embedded in the connection URI at handshake time. The channel carries
//! outbound position reports and yields inbound full-state snapshots as
//! [`ChannelEvent`]s.
//!
//! There is no acknowledgement, retry, or queued-message recovery: if the
//! connection drops, all live state is gone and the session must open a
//! fresh channel (normally with a fresh id) and take the greeting snapshot
//! it receives as the new truth.
//!
//! The channel is an explicitly owned object — constructed at session
//! start, passed to whatever needs it, torn down with the session. Nothing
//! in this crate holds it as ambient global state.

use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{
    ClientReport, GeoPosition, ParticipantId, PresenceSnapshot, ProtocolError,
    random_participant_id,
};

/// Channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Connection established
    Connected,
    /// A full presence snapshot arrived from the hub
    Snapshot(PresenceSnapshot),
    /// Connection lost — all live state is stale
    Disconnected,
}

/// Cloneable handle for submitting reports without borrowing the channel.
///
/// The position-source pump task owns one of these; dropping it simply
/// stops reporting.
#[derive(Clone)]
pub struct ReportSink {
    participant_id: ParticipantId,
    outgoing_tx: mpsc::Sender<Message>,
    state: Arc<RwLock<ConnectionState>>,
}

impl ReportSink {
    /// Report a position reading to the hub.
    pub async fn send_report(&self, position: GeoPosition) -> Result<(), ProtocolError> {
        self.send(ClientReport::new(position.lat, position.lng)).await
    }

    /// Report with the optional level metadata attached.
    pub async fn send(&self, report: ClientReport) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let encoded = report.encode()?;
        self.outgoing_tx
            .send(Message::text(encoded))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }
}

/// The sync channel.
///
/// Owns the WebSocket connection for one participant: a writer task fed by
/// an mpsc channel and a reader task that decodes snapshots into events.
pub struct SyncChannel {
    /// Our participant identity (unique per connection)
    participant_id: ParticipantId,

    /// Hub URL, e.g. `ws://127.0.0.1:9090`
    server_url: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ChannelEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<ChannelEvent>,

    /// Reader/writer task handles, aborted on teardown
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl SyncChannel {
    /// Create a channel for the given participant id.
    pub fn new(participant_id: impl Into<ParticipantId>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            participant_id: participant_id.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            tasks: Vec::new(),
        }
    }

    /// Create a channel with a fresh random participant id.
    pub fn with_random_id(server_url: impl Into<String>) -> Self {
        Self::new(random_participant_id(), server_url)
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ChannelEvent>> {
        self.event_rx.take()
    }

    /// Connect to the hub.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages. The
    /// first inbound message is the hub's greeting snapshot, delivered as a
    /// normal [`ChannelEvent::Snapshot`].
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!(
            "{}/?participant={}",
            self.server_url, self.participant_id
        );

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(ok) => ok,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                log::warn!("Failed to connect to {url}: {e}");
                return Err(ProtocolError::ConnectionClosed);
            }
        };

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the WebSocket.
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx);
        self.tasks.push(tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
        }));

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ChannelEvent::Connected).await;

        // Reader task: decode inbound snapshots into events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let participant_id = self.participant_id.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match PresenceSnapshot::decode(text.as_str()) {
                        Ok(snapshot) => {
                            let _ = event_tx.send(ChannelEvent::Snapshot(snapshot)).await;
                        }
                        Err(e) => {
                            log::warn!("Discarding undecodable snapshot for {participant_id}: {e}");
                        }
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost; whatever we were displaying is stale now.
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ChannelEvent::Disconnected).await;
        }));

        Ok(())
    }

    /// Report a position reading to the hub.
    pub async fn send_report(&self, position: GeoPosition) -> Result<(), ProtocolError> {
        self.send(ClientReport::new(position.lat, position.lng)).await
    }

    /// Report with the optional level metadata attached.
    pub async fn send(&self, report: ClientReport) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }

        let encoded = report.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(Message::text(encoded))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Get a cloneable report handle for the position-source pump.
    ///
    /// Returns `None` before [`connect`](Self::connect) succeeds.
    pub fn report_sink(&self) -> Option<ReportSink> {
        Some(ReportSink {
            participant_id: self.participant_id.clone(),
            outgoing_tx: self.outgoing_tx.clone()?,
            state: self.state.clone(),
        })
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get our participant id.
    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Get the hub URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Tear the connection down and stop background tasks.
    pub async fn close(&mut self) {
        self.outgoing_tx = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
