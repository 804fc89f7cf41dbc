//! Client session: channel + marker field wired together.
//!
//! A [`ClientSession`] owns one [`SyncChannel`] and the [`MarkerField`]
//! driven by its snapshot stream. The application feeds it position
//! readings (a GPS fix, a click on a map, a simulator) through an mpsc
//! channel and samples [`markers`](ClientSession::markers) once per frame.
//!
//! The session is deliberately poll-driven on the inbound side: render
//! loops already tick, so draining pending events at the top of a frame is
//! simpler than another background task mutating the field under a lock.

use tokio::sync::mpsc;

use crate::channel::{ChannelEvent, ConnectionState, ReportSink, SyncChannel};
use crate::interpolate::{MarkerField, MarkerRenderData};
use crate::protocol::{GeoPosition, ProtocolError};

/// One participant's live view of the shared map.
pub struct ClientSession {
    channel: SyncChannel,
    event_rx: mpsc::Receiver<ChannelEvent>,
    field: MarkerField,

    /// Pump task forwarding the position source, aborted on shutdown
    pump: Option<tokio::task::JoinHandle<()>>,
}

impl ClientSession {
    /// Connect a new session to the hub at `server_url` under the given
    /// participant id.
    pub async fn connect(
        server_url: impl Into<String>,
        participant_id: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        let mut channel = SyncChannel::new(participant_id.into(), server_url);
        let event_rx = channel
            .take_event_rx()
            .ok_or(ProtocolError::ConnectionClosed)?;
        channel.connect().await?;

        Ok(Self {
            channel,
            event_rx,
            field: MarkerField::new(),
            pump: None,
        })
    }

    /// Connect with a fresh random participant id.
    pub async fn connect_anonymous(
        server_url: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        Self::connect(server_url, crate::protocol::random_participant_id()).await
    }

    /// Forward every reading from `source` to the hub until the source
    /// closes or the session shuts down.
    ///
    /// Replaces any previously attached source. Fails if the channel is no
    /// longer connected; the receiver is dropped, so the producing side
    /// sees its channel close instead of feeding a silent void.
    pub fn attach_position_source(
        &mut self,
        mut source: mpsc::Receiver<GeoPosition>,
    ) -> Result<(), ProtocolError> {
        let Some(sink) = self.channel.report_sink() else {
            return Err(ProtocolError::ConnectionClosed);
        };
        if let Some(old) = self.pump.take() {
            old.abort();
        }
        self.pump = Some(tokio::spawn(async move {
            while let Some(position) = source.recv().await {
                if sink.send_report(position).await.is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    /// Report a single position reading directly.
    pub async fn report(&self, position: GeoPosition) -> Result<(), ProtocolError> {
        self.channel.send_report(position).await
    }

    /// Drain pending channel events into the marker field.
    ///
    /// Call once per frame, before [`markers`](Self::markers). Returns the
    /// number of snapshots applied.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.event_rx.try_recv() {
            match event {
                ChannelEvent::Snapshot(snapshot) => {
                    self.field.apply_snapshot(&snapshot);
                    applied += 1;
                }
                ChannelEvent::Disconnected => {
                    // Everything displayed was hub state; none of it is
                    // authoritative anymore.
                    self.field.clear();
                }
                ChannelEvent::Connected => {}
            }
        }
        applied
    }

    /// Wait for the next channel event and apply it.
    ///
    /// Returns `false` once the channel is gone. Useful for headless
    /// consumers that have no frame loop to poll from.
    pub async fn next_event(&mut self) -> bool {
        match self.event_rx.recv().await {
            Some(ChannelEvent::Snapshot(snapshot)) => {
                self.field.apply_snapshot(&snapshot);
                true
            }
            Some(ChannelEvent::Disconnected) => {
                self.field.clear();
                true
            }
            Some(ChannelEvent::Connected) => true,
            None => false,
        }
    }

    /// Current interpolated marker set, sampled at this instant.
    pub fn markers(&self) -> Vec<MarkerRenderData> {
        self.field.positions()
    }

    /// The marker field itself, for callers that sample with their own
    /// clock.
    pub fn marker_field(&self) -> &MarkerField {
        &self.field
    }

    /// Our participant id.
    pub fn participant_id(&self) -> &str {
        self.channel.participant_id()
    }

    /// A cloneable report handle.
    pub fn report_sink(&self) -> Option<ReportSink> {
        self.channel.report_sink()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.channel.connection_state().await
    }

    /// Tear the session down: stop the pump, close the channel, drop all
    /// markers.
    pub async fn shutdown(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.channel.close().await;
        self.field.clear();
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
