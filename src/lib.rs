//! # geosync — Real-time geographic presence sharing
//!
//! A central hub tracks where every connected participant is and pushes the
//! complete picture to everyone on every change; clients animate the result
//! into smooth marker motion.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ SyncChannel  │ ◄─────────────────► │ PresenceHub  │
//! │ (per client) │     JSON frames     │ (authority)  │
//! └──────┬───────┘                     └──────┬───────┘
//!        │ snapshots                          │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ MarkerField  │                     │ Roster       │
//! │ (interp.)    │                     │ (id → pos)   │
//! └──────────────┘                     └──────┬───────┘
//!                                             │
//!                                     ┌───────┴───────┐
//!                                     │BroadcastGroup │
//!                                     │  (fan-out)    │
//!                                     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol (reports and full-state snapshots)
//! - [`broadcast`] — Hub-wide snapshot fan-out with backpressure
//! - [`hub`] — WebSocket presence hub (the single source of truth)
//! - [`channel`] — WebSocket client channel
//! - [`interpolate`] — Fixed-duration marker motion interpolation
//! - [`session`] — Channel + marker field wired into one client session
//!
//! ## Design Invariants
//!
//! - Every state change broadcasts the *whole* snapshot; there are no
//!   deltas, so any single message fully describes the world.
//! - A participant's entry exists exactly while its connection is open;
//!   disconnect always evicts.
//! - Displayed marker positions are pure functions of wall-clock time, so
//!   rendering frame rate never changes where a marker ends up.

pub mod broadcast;
pub mod channel;
pub mod hub;
pub mod interpolate;
pub mod protocol;
pub mod session;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use channel::{ChannelEvent, ConnectionState, ReportSink, SyncChannel};
pub use hub::{HubConfig, HubStats, PresenceHub};
pub use interpolate::{MarkerField, MarkerMotion, MarkerRenderData};
pub use protocol::{
    ClientReport, GeoPosition, Participant, ParticipantId, PresenceSnapshot,
    ProtocolError, MOTION_DURATION, random_participant_id,
};
pub use session::ClientSession;
