//! Event relay: room-scoped publish/fan-out plus presence transitions.
//!
//! DESIGN
//! ======
//! `Relay` is a cloneable service around one mutex-guarded `Hub` holding the
//! connection registry and the presence tracker. Every operation takes the
//! lock once, applies the membership change, the presence transition, and
//! the resulting fan-out, then releases it. Two consequences:
//! - membership and presence can never be observed out of step
//! - frames published into a room are enqueued on every member's channel in
//!   publish order, so each subscriber sees room-local FIFO
//!
//! Fan-out uses `try_send` on each member's bounded channel, so holding a
//! std mutex across it never blocks on a slow client.
//!
//! DELIVERY
//! ========
//! Draw, sync, and chat events go to every member including the source
//! handle; clients recognise their own echo by the frame's `from` (the
//! source handle id). Cursor and presence events skip the source.
//!
//! ERROR HANDLING
//! ==============
//! A full or closed member channel skips that member only and is counted in
//! the `DeliveryReport`. Operations on a disconnected handle surface as
//! `RelayError::DeadHandle`, which callers log and drop.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use frames::events::{
    CANVAS_DRAW, CANVAS_SYNC, CANVAS_REQUEST_SYNC, CANVAS_USER_JOINED, CANVAS_USER_LEFT, CANVAS_USER_MOVEMENT,
    KEY_POSITION, KEY_ROOM_ID, KEY_USER, KEY_USER_ID, MESSAGE_DELETED, MESSAGE_UPDATED, NEW_MESSAGE,
};
use frames::{Cursor, Data, ErrorCode, Frame, RoomFamily, RoomId, now_ms};
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::presence::{PresenceEntry, PresenceTracker, Transition};
use super::registry::{ConnectionHandle, DeadHandle, Departure, HandleId, Registry};
use super::session::{Identity, LookupError};
use super::snapshot::SnapshotError;

// =============================================================================
// EVENT KINDS
// =============================================================================

/// Who receives a relayed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Every member of the room, source included.
    All,
    /// Every member except the source handle.
    ExcludeSource,
}

/// Room-scoped events the relay fans out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Draw,
    /// Full raster; also the outbound form of `canvas:provideSync`.
    Sync,
    RequestSync,
    UserMovement,
    UserJoined,
    UserLeft,
    NewMessage,
    MessageUpdated,
    MessageDeleted,
}

impl EventKind {
    #[must_use]
    pub fn syscall(self) -> &'static str {
        match self {
            Self::Draw => CANVAS_DRAW,
            Self::Sync => CANVAS_SYNC,
            Self::RequestSync => CANVAS_REQUEST_SYNC,
            Self::UserMovement => CANVAS_USER_MOVEMENT,
            Self::UserJoined => CANVAS_USER_JOINED,
            Self::UserLeft => CANVAS_USER_LEFT,
            Self::NewMessage => NEW_MESSAGE,
            Self::MessageUpdated => MESSAGE_UPDATED,
            Self::MessageDeleted => MESSAGE_DELETED,
        }
    }

    #[must_use]
    pub fn delivery(self) -> Delivery {
        match self {
            Self::UserMovement | Self::UserJoined | Self::UserLeft => Delivery::ExcludeSource,
            _ => Delivery::All,
        }
    }

    /// The room family this event is valid in.
    #[must_use]
    pub fn family(self) -> RoomFamily {
        match self {
            Self::NewMessage | Self::MessageUpdated | Self::MessageDeleted => RoomFamily::Chat,
            _ => RoomFamily::Canvas,
        }
    }

    /// Map an inbound chat event name.
    #[must_use]
    pub fn chat(syscall: &str) -> Option<Self> {
        match syscall {
            NEW_MESSAGE => Some(Self::NewMessage),
            MESSAGE_UPDATED => Some(Self::MessageUpdated),
            MESSAGE_DELETED => Some(Self::MessageDeleted),
            _ => None,
        }
    }
}

// =============================================================================
// ERRORS AND REPORTS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    DeadHandle(#[from] DeadHandle),
    #[error("not joined to {0}")]
    NotJoined(RoomId),
    #[error("not a member of the community behind {0}")]
    Forbidden(RoomId),
    #[error("bad payload: {0}")]
    BadPayload(String),
    #[error("membership check failed: {0}")]
    Lookup(#[from] LookupError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl ErrorCode for RelayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::DeadHandle(_) => "E_DEAD_HANDLE",
            Self::NotJoined(_) => "E_NOT_JOINED",
            Self::Forbidden(_) => "E_FORBIDDEN",
            Self::BadPayload(_) => "E_BAD_PAYLOAD",
            Self::Lookup(_) => "E_IDENTITY_LOOKUP",
            Self::Snapshot(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Lookup(_) | Self::Snapshot(_))
    }
}

/// Per-publish delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Members whose channel was full or closing.
    pub skipped: usize,
}

impl DeliveryReport {
    fn absorb(&mut self, other: Self) {
        self.delivered += other.delivered;
        self.skipped += other.skipped;
    }
}

/// Result of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    /// The handle was not already a member.
    pub newly_joined: bool,
    /// The room had no members before this join.
    pub room_was_empty: bool,
    /// Presence transition for canvas rooms.
    pub presence: Option<Transition>,
}

/// Result of a disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReport {
    pub rooms_left: Vec<RoomId>,
    /// Canvas rooms where `userLeft` was emitted.
    pub presence_left: Vec<RoomId>,
    pub fully_offline: bool,
}

// =============================================================================
// RELAY
// =============================================================================

#[derive(Default)]
struct Hub {
    registry: Registry,
    presence: PresenceTracker,
}

#[derive(Clone, Default)]
pub struct Relay {
    hub: Arc<Mutex<Hub>>,
}

impl Relay {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an authenticated connection and its outbound channel.
    pub fn admit(&self, identity: Identity, tx: mpsc::Sender<Frame>) -> ConnectionHandle {
        let handle = self.lock().registry.admit(Arc::new(identity), tx);
        info!(handle_id = %handle.id, user_id = %handle.user_id(), "relay: handle admitted");
        handle
    }

    /// Join a room. For canvas rooms this also announces presence, which
    /// doubles as the heartbeat when the handle is already a member.
    ///
    /// # Errors
    ///
    /// `DeadHandle` if the handle has been disconnected.
    pub fn join(&self, handle: &ConnectionHandle, room: &RoomId) -> Result<JoinOutcome, RelayError> {
        self.join_at(handle, room, now_ms())
    }

    /// [`Relay::join`] with an explicit clock.
    ///
    /// # Errors
    ///
    /// `DeadHandle` if the handle has been disconnected.
    pub fn join_at(&self, handle: &ConnectionHandle, room: &RoomId, now: i64) -> Result<JoinOutcome, RelayError> {
        let mut hub = self.lock();
        let room_was_empty = hub.registry.members(room).is_empty();
        let newly_joined = hub.registry.join(handle.id, room)?;

        let presence = room.is_canvas().then(|| {
            let user = handle.identity.presence();
            let transition = hub.presence.announce(room, &user, now);
            if transition == Transition::Joined {
                let mut data = room_data(room);
                data.insert(KEY_USER.into(), json!(user));
                let frame = event_frame(EventKind::UserJoined, room, Some(handle.id), data);
                hub.fan_out(room, &frame, Some(handle.id));
            }
            transition
        });

        if newly_joined {
            info!(handle_id = %handle.id, %room, "relay: joined");
        }
        Ok(JoinOutcome { newly_joined, room_was_empty, presence })
    }

    /// Leave a room. Returns whether the handle was a member.
    ///
    /// # Errors
    ///
    /// `DeadHandle` if the handle has been disconnected.
    pub fn leave(&self, handle: &ConnectionHandle, room: &RoomId) -> Result<bool, RelayError> {
        let mut hub = self.lock();
        let Some(departure) = hub.registry.leave(handle.id, room)? else {
            return Ok(false);
        };
        hub.settle_departure(handle.user_id(), Some(handle.id), &departure);
        info!(handle_id = %handle.id, %room, "relay: left");
        Ok(true)
    }

    /// Remove a handle and all of its memberships. A second call for the
    /// same handle is a no-op and returns `None`.
    pub fn disconnect(&self, handle: &ConnectionHandle) -> Option<DisconnectReport> {
        let mut hub = self.lock();
        let Some(gone) = hub.registry.disconnect(handle.id) else {
            debug!(handle_id = %handle.id, "relay: disconnect of unknown handle ignored");
            return None;
        };
        let user_id = handle.user_id();

        let mut presence_left = Vec::new();
        for departure in &gone.departures {
            if hub.settle_departure(user_id, Some(handle.id), departure) {
                presence_left.push(departure.room.clone());
            }
        }
        if gone.fully_offline {
            for room in hub.presence.purge_user(user_id) {
                hub.emit_user_left(&room, user_id, Some(handle.id));
                presence_left.push(room);
            }
        }

        let report = DisconnectReport {
            rooms_left: gone.departures.into_iter().map(|d| d.room).collect(),
            presence_left,
            fully_offline: gone.fully_offline,
        };
        info!(
            handle_id = %handle.id,
            %user_id,
            rooms = report.rooms_left.len(),
            fully_offline = report.fully_offline,
            "relay: handle disconnected"
        );
        Some(report)
    }

    /// Publish an event from `handle` into `room`.
    ///
    /// # Errors
    ///
    /// `NotJoined` if the handle is not a member, `BadPayload` if the event
    /// does not belong to the room's family, `DeadHandle` if the handle has
    /// been disconnected.
    pub fn publish(
        &self,
        handle: &ConnectionHandle,
        room: &RoomId,
        kind: EventKind,
        payload: Data,
    ) -> Result<DeliveryReport, RelayError> {
        if kind.family() != room.family() {
            return Err(RelayError::BadPayload(format!("{} is not valid in {room}", kind.syscall())));
        }
        let hub = self.lock();
        if !hub.registry.is_member(handle.id, room)? {
            return Err(RelayError::NotJoined(room.clone()));
        }

        let mut data = payload;
        data.insert(KEY_ROOM_ID.into(), json!(room.key()));
        let frame = event_frame(kind, room, Some(handle.id), data);
        let exclude = match kind.delivery() {
            Delivery::All => None,
            Delivery::ExcludeSource => Some(handle.id),
        };
        Ok(hub.fan_out(room, &frame, exclude))
    }

    /// Record a cursor position and relay it to the other members.
    ///
    /// # Errors
    ///
    /// `NotJoined` if the handle is not a member of `room`.
    pub fn move_cursor_at(
        &self,
        handle: &ConnectionHandle,
        room: &RoomId,
        cursor: Cursor,
        now: i64,
    ) -> Result<DeliveryReport, RelayError> {
        let mut hub = self.lock();
        if !hub.registry.is_member(handle.id, room)? {
            return Err(RelayError::NotJoined(room.clone()));
        }

        let user_id = handle.user_id();
        let mut report = DeliveryReport::default();
        if !hub.presence.move_cursor(room, user_id, cursor, now) {
            // Entry was pruned while the handle stayed joined; restore it.
            let user = handle.identity.presence();
            hub.presence.announce(room, &user, now);
            hub.presence.move_cursor(room, user_id, cursor, now);
            let mut data = room_data(room);
            data.insert(KEY_USER.into(), json!(user));
            let joined = event_frame(EventKind::UserJoined, room, Some(handle.id), data);
            report.absorb(hub.fan_out(room, &joined, Some(handle.id)));
        }

        let mut data = room_data(room);
        data.insert(KEY_USER_ID.into(), json!(user_id));
        data.insert(KEY_POSITION.into(), json!(cursor));
        let frame = event_frame(EventKind::UserMovement, room, Some(handle.id), data);
        report.absorb(hub.fan_out(room, &frame, Some(handle.id)));
        Ok(report)
    }

    /// Deliver one frame to one handle. Returns `false` if the handle is
    /// gone or its channel cannot take the frame.
    pub fn send_to(&self, handle_id: HandleId, frame: Frame) -> bool {
        let hub = self.lock();
        let Some(tx) = hub.registry.sender(handle_id) else {
            return false;
        };
        tx.try_send(frame).is_ok()
    }

    /// Current presence roster of a canvas room.
    #[must_use]
    pub fn active_users(&self, room: &RoomId) -> Vec<PresenceEntry> {
        self.lock().presence.roster(room)
    }

    /// Members of `room` other than `handle`.
    #[must_use]
    pub fn peer_count(&self, handle: &ConnectionHandle, room: &RoomId) -> usize {
        self.lock()
            .registry
            .members(room)
            .iter()
            .filter(|id| **id != handle.id)
            .count()
    }

    /// # Errors
    ///
    /// `DeadHandle` if the handle has been disconnected.
    pub fn is_member(&self, handle: &ConnectionHandle, room: &RoomId) -> Result<bool, RelayError> {
        Ok(self.lock().registry.is_member(handle.id, room)?)
    }

    #[cfg(test)]
    pub(crate) fn joined_rooms(&self, handle: &ConnectionHandle) -> Vec<RoomId> {
        self.lock()
            .registry
            .joined_rooms(handle.id)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock().registry.handle_count()
    }

    /// Drop presence entries that missed their heartbeats and tell the
    /// remaining members. Returns the pruned `(room, user)` pairs.
    ///
    /// This is the one place presence may disappear while a handle of the
    /// user is still joined: an ungracefully terminated client whose
    /// transport has not noticed yet. Its next heartbeat restores the entry.
    pub fn prune_stale_at(&self, now: i64, max_age: Duration) -> Vec<(RoomId, Uuid)> {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let mut hub = self.lock();
        let pruned = hub.presence.prune_stale(now, max_age_ms);
        for (room, user_id) in &pruned {
            hub.emit_user_left(room, *user_id, None);
        }
        pruned
    }
}

impl Hub {
    fn fan_out(&self, room: &RoomId, frame: &Frame, exclude: Option<HandleId>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for id in self.registry.members(room) {
            if exclude == Some(*id) {
                continue;
            }
            let Some(tx) = self.registry.sender(*id) else {
                continue;
            };
            match tx.try_send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(handle_id = %id, %room, syscall = %frame.syscall, "relay: client queue full; dropping frame");
                    report.skipped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(handle_id = %id, %room, syscall = %frame.syscall, "relay: client closing; dropping frame");
                    report.skipped += 1;
                }
            }
        }
        report
    }

    /// Apply the presence side of a departure. Returns whether `userLeft`
    /// was emitted.
    fn settle_departure(&mut self, user_id: Uuid, source: Option<HandleId>, departure: &Departure) -> bool {
        if !departure.room.is_canvas() || departure.user_still_present {
            return false;
        }
        if !self.presence.depart(&departure.room, user_id) {
            return false;
        }
        self.emit_user_left(&departure.room, user_id, source);
        true
    }

    fn emit_user_left(&self, room: &RoomId, user_id: Uuid, source: Option<HandleId>) {
        let mut data = room_data(room);
        data.insert(KEY_USER_ID.into(), json!(user_id));
        let frame = event_frame(EventKind::UserLeft, room, source, data);
        self.fan_out(room, &frame, source);
    }
}

fn room_data(room: &RoomId) -> Data {
    let mut data = Data::new();
    data.insert(KEY_ROOM_ID.into(), json!(room.key()));
    data
}

fn event_frame(kind: EventKind, room: &RoomId, source: Option<HandleId>, data: Data) -> Frame {
    let frame = Frame::request(kind.syscall(), data).with_room(room);
    match source {
        Some(id) => frame.with_from(id.to_string()),
        None => frame,
    }
}

// =============================================================================
// PRESENCE SWEEPER
// =============================================================================

/// Spawn the background task that prunes presence entries which stopped
/// heartbeating. Runs once per heartbeat interval.
pub fn spawn_presence_sweeper(relay: Relay, every: Duration, stale_after: Duration) -> JoinHandle<()> {
    info!(every_ms = every.as_millis(), stale_after_ms = stale_after.as_millis(), "presence sweeper configured");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let pruned = relay.prune_stale_at(now_ms(), stale_after);
            if !pruned.is_empty() {
                info!(count = pruned.len(), "presence sweeper pruned stale entries");
            }
        }
    })
}

#[cfg(test)]
#[path = "relay_test.rs"]
mod tests;
