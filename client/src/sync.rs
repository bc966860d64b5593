//! Canvas state recovery and snapshot upload timing.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use frames::{DrawEvent, RoomId};

/// Accepts one `canvas:sync` per request.
///
/// Several peers may answer the same `canvas:requestSync`, and the relay
/// forwards every answer to the whole room. Only the first answer after our
/// own request is applied; the rest would repaint over newer strokes.
#[derive(Debug, Default)]
pub struct SyncGate {
    armed: HashSet<RoomId>,
}

impl SyncGate {
    /// Expect a sync for `room`.
    pub fn arm(&mut self, room: RoomId) {
        self.armed.insert(room);
    }

    /// Whether a sync for `room` should be applied. Closes the gate.
    pub fn accept(&mut self, room: &RoomId) -> bool {
        self.armed.remove(room)
    }

    #[must_use]
    pub fn is_armed(&self, room: &RoomId) -> bool {
        self.armed.contains(room)
    }

    pub fn forget(&mut self, room: &RoomId) {
        self.armed.remove(room);
    }

    pub fn clear(&mut self) {
        self.armed.clear();
    }
}

/// Default spacing of periodic raster uploads.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

/// Decides when the local raster should be uploaded with
/// `canvas:saveSnapshot`.
///
/// An upload is due right away after a completed shape or a clear, and
/// otherwise once `interval` has passed since the last upload with changes
/// still pending.
#[derive(Debug)]
pub struct SnapshotSchedule {
    interval: Duration,
    last_saved: Instant,
    pending: bool,
}

impl SnapshotSchedule {
    #[must_use]
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self { interval, last_saved: now, pending: false }
    }

    /// Note a local draw event. Returns `true` if an upload is due now.
    pub fn record(&mut self, event: &DrawEvent, now: Instant) -> bool {
        self.pending = true;
        event.is_significant() || self.interval_elapsed(now)
    }

    /// Periodic check. Returns `true` if pending changes have waited a full
    /// interval.
    #[must_use]
    pub fn due(&self, now: Instant) -> bool {
        self.pending && self.interval_elapsed(now)
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending
    }

    /// Call after an upload was sent.
    pub fn mark_saved(&mut self, now: Instant) {
        self.pending = false;
        self.last_saved = now;
    }

    fn interval_elapsed(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_saved) >= self.interval
    }
}

impl Default for SnapshotSchedule {
    fn default() -> Self {
        Self::new(SNAPSHOT_INTERVAL, Instant::now())
    }
}

#[cfg(test)]
#[path = "sync_test.rs"]
mod tests;
