//! Marker motion interpolation.
//!
//! The hub transmits discrete position updates; rendering wants continuous
//! motion. Each remote participant gets a [`MarkerMotion`] that glides its
//! marker from where it is currently displayed to the latest reported
//! position over a fixed [`MOTION_DURATION`].
//!
//! The displayed position is a pure function of wall-clock time: callers
//! sample [`MarkerMotion::position_at`] with "now" at whatever rate they
//! render, and slow or missed frames only skip intermediate positions,
//! never change where the marker ends up. Retargeting mid-flight restarts
//! the clock from the currently displayed position, so a redirected marker
//! turns smoothly instead of jumping back to its old origin.
//!
//! [`MarkerField`] maintains the motion set for a whole snapshot stream:
//! participants appearing for the first time snap into place, participants
//! missing from a snapshot are dropped immediately, and a byte-identical
//! re-broadcast leaves every in-flight animation untouched.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{GeoPosition, ParticipantId, PresenceSnapshot, MOTION_DURATION};

/// One marker's animation state: a straight-line glide from `from` to
/// `to`, starting at `started_at` and lasting `duration`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerMotion {
    from: GeoPosition,
    to: GeoPosition,
    started_at: Instant,
    duration: Duration,
}

impl MarkerMotion {
    /// A motion that is already complete: the marker sits at `position`.
    ///
    /// Used when a participant is seen for the first time — there is no
    /// prior displayed position to animate from, so the marker snaps.
    pub fn settled(position: GeoPosition) -> Self {
        Self::settled_at(position, Instant::now())
    }

    /// [`settled`](Self::settled) with an explicit clock, for callers that
    /// sample time once per frame.
    pub fn settled_at(position: GeoPosition, now: Instant) -> Self {
        Self {
            from: position,
            to: position,
            started_at: now,
            duration: MOTION_DURATION,
        }
    }

    /// Start a glide from `from` to `to` at time `now`.
    pub fn glide_at(from: GeoPosition, to: GeoPosition, now: Instant) -> Self {
        Self {
            from,
            to,
            started_at: now,
            duration: MOTION_DURATION,
        }
    }

    /// Redirect this motion toward a new target.
    ///
    /// The new origin is wherever the marker is *displayed* at `now`, not
    /// the old origin and not the old target, so a mid-flight update bends
    /// the path smoothly. The animation clock restarts.
    pub fn retarget_at(&mut self, target: GeoPosition, now: Instant) {
        self.from = self.position_at(now);
        self.to = target;
        self.started_at = now;
    }

    /// The displayed position at time `now`.
    ///
    /// Progress is elapsed wall-clock time over the fixed duration, clamped
    /// to [0, 1]; past the end the marker rests exactly at the target.
    pub fn position_at(&self, now: Instant) -> GeoPosition {
        let elapsed = now.saturating_duration_since(self.started_at);
        if elapsed >= self.duration {
            return self.to;
        }
        let t = elapsed.as_secs_f64() / self.duration.as_secs_f64();
        self.from.lerp(&self.to, t)
    }

    /// Whether the glide is still in progress at `now`.
    pub fn is_animating_at(&self, now: Instant) -> bool {
        self.from != self.to && now.saturating_duration_since(self.started_at) < self.duration
    }

    /// The position this motion is heading toward.
    pub fn target(&self) -> GeoPosition {
        self.to
    }

    #[cfg(test)]
    fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

/// What a renderer needs to draw one marker on a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerRenderData {
    pub id: ParticipantId,
    pub position: GeoPosition,
    pub level: Option<i64>,
    pub animating: bool,
}

/// Per-participant marker bookkeeping.
#[derive(Debug, Clone)]
struct Marker {
    motion: MarkerMotion,
    level: Option<i64>,
}

/// The full set of animated markers, driven by the snapshot stream.
///
/// Exactly one motion exists per participant currently present in the
/// authoritative state; when a participant leaves, its marker is removed
/// at once (which also ends any in-flight glide for it).
#[derive(Debug, Clone, Default)]
pub struct MarkerField {
    markers: HashMap<ParticipantId, Marker>,
}

impl MarkerField {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an authoritative snapshot, using the current wall clock.
    pub fn apply_snapshot(&mut self, snapshot: &PresenceSnapshot) {
        self.apply_snapshot_at(snapshot, Instant::now());
    }

    /// Apply an authoritative snapshot at an explicit time `now`.
    ///
    /// - Participants absent from the snapshot are dropped.
    /// - Participants seen for the first time snap into place.
    /// - A changed position redirects the existing motion from the
    ///   currently displayed point.
    /// - An unchanged position leaves the motion alone, so a re-broadcast
    ///   of identical state never restarts an animation.
    pub fn apply_snapshot_at(&mut self, snapshot: &PresenceSnapshot, now: Instant) {
        self.markers.retain(|id, _| snapshot.contains(id));

        for (id, participant) in snapshot.iter() {
            let target = participant.position();
            match self.markers.get_mut(id) {
                Some(marker) => {
                    marker.level = participant.level;
                    if marker.motion.target() != target {
                        marker.motion.retarget_at(target, now);
                    }
                }
                None => {
                    self.markers.insert(
                        id.clone(),
                        Marker {
                            motion: MarkerMotion::settled_at(target, now),
                            level: participant.level,
                        },
                    );
                }
            }
        }
    }

    /// Sample every marker's displayed position at time `now`.
    ///
    /// Output is sorted by participant id so render order is stable across
    /// frames.
    pub fn positions_at(&self, now: Instant) -> Vec<MarkerRenderData> {
        let mut out: Vec<MarkerRenderData> = self
            .markers
            .iter()
            .map(|(id, marker)| MarkerRenderData {
                id: id.clone(),
                position: marker.motion.position_at(now),
                level: marker.level,
                animating: marker.motion.is_animating_at(now),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Sample every marker's displayed position right now.
    pub fn positions(&self) -> Vec<MarkerRenderData> {
        self.positions_at(Instant::now())
    }

    /// The motion currently driving `id`, if present.
    pub fn motion(&self, id: &str) -> Option<&MarkerMotion> {
        self.markers.get(id).map(|m| &m.motion)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.markers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Drop every marker. Used when the connection is lost and the local
    /// view no longer reflects any authoritative state.
    pub fn clear(&mut self) {
        self.markers.clear();
    }
}
