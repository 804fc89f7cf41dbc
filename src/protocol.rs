//! JSON wire protocol for presence synchronization.
//!
//! One complete JSON value per WebSocket text message, no additional
//! framing beyond the transport's own message boundaries:
//!
//! ```text
//! client → hub   {"lat":10.0,"lng":20.0}                      (report)
//! hub → client   {"a1b2":{"lat":10.0,"lng":20.0,"level":3}}   (snapshot)
//! ```
//!
//! The hub broadcasts the *entire* participant map on every change — there
//! is no delta protocol. Snapshots are keyed by opaque participant ids and
//! encode deterministically (ordered map), so broadcasting an unchanged
//! roster twice produces byte-identical messages.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Opaque participant identity, unique per connection.
pub type ParticipantId = String;

/// Fixed duration of one marker glide.
pub const MOTION_DURATION: Duration = Duration::from_millis(500);

/// A geographic position in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPosition {
    pub const ORIGIN: GeoPosition = GeoPosition { lat: 0.0, lng: 0.0 };

    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Linear interpolation toward `target` by fraction `t` ∈ [0, 1].
    ///
    /// Fraction 0 yields `self`, fraction 1 yields `target` exactly.
    pub fn lerp(&self, target: &GeoPosition, t: f64) -> GeoPosition {
        GeoPosition {
            lat: self.lat + (target.lat - self.lat) * t,
            lng: self.lng + (target.lng - self.lng) * t,
        }
    }

    /// Euclidean distance in degree space. Good enough for "has this
    /// marker moved" checks; not a great-circle distance.
    pub fn distance(&self, other: &GeoPosition) -> f64 {
        let dlat = self.lat - other.lat;
        let dlng = self.lng - other.lng;
        (dlat * dlat + dlng * dlng).sqrt()
    }
}

impl Default for GeoPosition {
    fn default() -> Self {
        Self::ORIGIN
    }
}

/// Outbound client→hub position report.
///
/// `level` is optional auxiliary display metadata; it is omitted from the
/// JSON entirely when absent so a plain report is exactly `{lat, lng}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClientReport {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<i64>,
}

impl ClientReport {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng, level: None }
    }

    pub fn with_level(lat: f64, lng: f64, level: i64) -> Self {
        Self { lat, lng, level: Some(level) }
    }

    pub fn position(&self) -> GeoPosition {
        GeoPosition::new(self.lat, self.lng)
    }

    /// Serialize to one JSON wire message.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from one JSON wire message.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// One roster entry: a participant's last-known location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<i64>,
}

impl Participant {
    pub fn position(&self) -> GeoPosition {
        GeoPosition::new(self.lat, self.lng)
    }
}

impl From<ClientReport> for Participant {
    fn from(report: ClientReport) -> Self {
        Self {
            lat: report.lat,
            lng: report.lng,
            level: report.level,
        }
    }
}

/// The complete participant-id → location mapping at one instant.
///
/// Constructed and owned exclusively by the hub; clients only ever hold an
/// immutable copy received per message. Backed by a `BTreeMap` so equal
/// rosters always encode to identical bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresenceSnapshot {
    entries: BTreeMap<ParticipantId, Participant>,
}

impl PresenceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn insert(&mut self, id: ParticipantId, participant: Participant) {
        self.entries.insert(id, participant);
    }

    pub fn remove(&mut self, id: &str) -> Option<Participant> {
        self.entries.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParticipantId, &Participant)> {
        self.entries.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ParticipantId> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to one JSON wire message.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from one JSON wire message.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

impl FromIterator<(ParticipantId, Participant)> for PresenceSnapshot {
    fn from_iter<I: IntoIterator<Item = (ParticipantId, Participant)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Generate a fresh random participant id.
///
/// Ids are per-session: the original design makes no identity-continuity
/// promise across reconnects, so a new channel gets a new id.
pub fn random_participant_id() -> ParticipantId {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    ConnectionClosed,
    MissingParticipantId,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::MissingParticipantId => write!(f, "Missing participant id in handshake"),
        }
    }
}

impl std::error::Error for ProtocolError {}
