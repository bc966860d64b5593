//! Connection state machine.
//!
//! The manager owns every decision the connection task makes: which frames
//! to send after a (re)connect, whether a join or leave reaches the network,
//! how long to back off, and when to give up. It performs no I/O.
//!
//! LIFECYCLE
//! =========
//! `Disconnected -> Connecting -> Connected -> Disconnected`, repeating until
//! either the user closes the connection or `max_attempts` consecutive dials
//! fail, which lands in `Failed`. A manual [`ConnectionManager::retry`]
//! leaves `Failed` with a fresh attempt budget. A 401 at the handshake goes
//! straight to `Failed`: the same credential cannot succeed on retry.

use std::str::FromStr;
use std::time::Duration;

use frames::events::{
    CANVAS_JOIN, CANVAS_REQUEST_SYNC, CANVAS_SYNC, KEY_HANDLE_ID, KEY_RECOVERING, KEY_ROOM_ID, SESSION_CONNECTED,
};
use frames::{Frame, PresenceUser, RoomFamily, RoomId, Status};
use serde_json::Value;
use tracing::debug;

use crate::policy::ReconnectPolicy;
use crate::rooms::{RoomBook, join_frame, leave_frame};
use crate::sync::SyncGate;

/// Why the connection stopped trying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailReason {
    /// The server rejected the credential at the handshake.
    Unauthenticated,
    /// This many consecutive dials failed.
    Exhausted(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed(FailReason),
}

impl ConnectionStatus {
    #[must_use]
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    #[must_use]
    pub fn is_failed(self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// What the connection task should do after a dial or a dropped socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Dial again after the delay.
    Reconnect(Duration),
    /// Stay down until a manual retry.
    Wait,
    /// The user closed the connection; stop for good.
    Stop,
}

#[derive(Debug)]
pub struct ConnectionManager {
    policy: ReconnectPolicy,
    status: ConnectionStatus,
    failures: u32,
    closed: bool,
    /// Server-assigned id of the current socket, from `session:connected`.
    handle_id: Option<String>,
    book: RoomBook,
    gate: SyncGate,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            status: ConnectionStatus::Disconnected,
            failures: 0,
            closed: false,
            handle_id: None,
            book: RoomBook::default(),
            gate: SyncGate::default(),
        }
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    #[must_use]
    pub fn handle_id(&self) -> Option<&str> {
        self.handle_id.as_deref()
    }

    #[must_use]
    pub fn rooms(&self) -> &RoomBook {
        &self.book
    }

    // =========================================================================
    // TRANSITIONS
    // =========================================================================

    pub fn begin_connect(&mut self) {
        self.status = ConnectionStatus::Connecting;
    }

    /// The socket is open. Resets the failure count and returns a join for
    /// every room that still has interest, since the server keeps no
    /// memberships for a dropped connection.
    pub fn on_connected(&mut self) -> Vec<Frame> {
        self.status = ConnectionStatus::Connected;
        self.failures = 0;
        self.handle_id = None;
        self.gate.clear();
        let frames = self.book.join_frames();
        for frame in &frames {
            self.note_outbound(frame);
        }
        frames
    }

    /// A dial failed for a reason other than a rejected credential.
    pub fn on_connect_error(&mut self) -> Decision {
        if self.closed {
            self.status = ConnectionStatus::Disconnected;
            return Decision::Stop;
        }
        self.failures = self.failures.saturating_add(1);
        if self.policy.exhausted(self.failures) {
            self.status = ConnectionStatus::Failed(FailReason::Exhausted(self.failures));
            return Decision::Wait;
        }
        self.status = ConnectionStatus::Disconnected;
        Decision::Reconnect(self.policy.delay_for(self.failures))
    }

    /// An established socket went away.
    pub fn on_closed(&mut self) -> Decision {
        self.status = ConnectionStatus::Disconnected;
        self.handle_id = None;
        self.gate.clear();
        if self.closed {
            return Decision::Stop;
        }
        Decision::Reconnect(self.policy.delay_for(1))
    }

    pub fn on_auth_rejected(&mut self) -> Decision {
        self.status = ConnectionStatus::Failed(FailReason::Unauthenticated);
        Decision::Wait
    }

    /// Manual retry. Resets the attempt budget. Returns `true` if the task
    /// should dial now (it was down); `false` while connected or closed.
    pub fn retry(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.failures = 0;
        match self.status {
            ConnectionStatus::Failed(_) | ConnectionStatus::Disconnected => true,
            ConnectionStatus::Connecting | ConnectionStatus::Connected => false,
        }
    }

    /// User-driven disconnect. Terminal.
    pub fn close(&mut self) {
        self.closed = true;
        self.status = ConnectionStatus::Disconnected;
        self.gate.clear();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // =========================================================================
    // ROOMS
    // =========================================================================

    /// A view wants `room`. Returns the join frame only for the first view
    /// and only while connected; otherwise the interest is recorded and the
    /// join goes out with the next reconnect.
    pub fn join(&mut self, room: RoomId, presence: Option<PresenceUser>) -> Option<Frame> {
        let first = self.book.acquire(room.clone(), presence.clone());
        if !first {
            debug!(%room, "client: join suppressed; room already held");
            return None;
        }
        if !self.status.is_connected() {
            return None;
        }
        let frame = join_frame(&room, presence.as_ref());
        self.note_outbound(&frame);
        Some(frame)
    }

    /// A view no longer needs `room`. Returns the leave frame only when the
    /// last view lets go while connected.
    pub fn leave(&mut self, room: &RoomId) -> Option<Frame> {
        let Some(interest) = self.book.release(room) else {
            debug!(%room, "client: leave suppressed; room still held or unknown");
            return None;
        };
        self.gate.forget(room);
        if !self.status.is_connected() {
            return None;
        }
        Some(leave_frame(room, interest.presence.map(|p| p.user_id)))
    }

    /// Presence refreshes for held canvas rooms. Empty unless connected.
    #[must_use]
    pub fn heartbeat_frames(&self) -> Vec<Frame> {
        if !self.status.is_connected() {
            return Vec::new();
        }
        self.book.heartbeat_frames()
    }

    // =========================================================================
    // FRAMES
    // =========================================================================

    /// Vet an application frame before it is written. Returns `None` while
    /// not connected; such frames are dropped.
    pub fn outbound(&mut self, frame: Frame) -> Option<Frame> {
        if !self.status.is_connected() {
            debug!(syscall = %frame.syscall, "client: frame dropped while offline");
            return None;
        }
        self.note_outbound(&frame);
        Some(frame)
    }

    /// Whether an inbound frame should reach the application.
    ///
    /// Relayed events carrying our own handle id in `from` are dropped: the
    /// sender already applied them locally. `canvas:sync` events pass the
    /// sync gate; error answers always pass and close the gate. A join
    /// acknowledgement that announces no recovery closes the gate too: the
    /// room was occupied, so no stored snapshot is on its way.
    pub fn accept_inbound(&mut self, frame: &Frame) -> bool {
        if frame.syscall == SESSION_CONNECTED {
            self.handle_id = frame.str_field(KEY_HANDLE_ID).map(ToOwned::to_owned);
            return true;
        }
        if frame.status == Status::Request
            && frame.from.is_some()
            && frame.from.as_deref() == self.handle_id.as_deref()
        {
            return false;
        }
        if frame.syscall == CANVAS_JOIN && frame.status == Status::Done {
            let recovering = frame.data.get(KEY_RECOVERING).and_then(Value::as_bool).unwrap_or(false);
            if !recovering {
                if let Some(room) = canvas_room(frame) {
                    self.gate.forget(&room);
                }
            }
            return true;
        }
        if frame.syscall != CANVAS_SYNC {
            return true;
        }
        let Some(room) = canvas_room(frame) else {
            return false;
        };
        let accepted = self.gate.accept(&room);
        frame.status == Status::Error || accepted
    }

    /// A first canvas join may be answered with a stored snapshot, and a
    /// sync request with a peer's raster; both arm the gate.
    fn note_outbound(&mut self, frame: &Frame) {
        if frame.syscall != CANVAS_JOIN && frame.syscall != CANVAS_REQUEST_SYNC {
            return;
        }
        if let Some(room) = canvas_room(frame) {
            self.gate.arm(room);
        }
    }
}

fn canvas_room(frame: &Frame) -> Option<RoomId> {
    if let Some(room) = frame.room.as_deref() {
        if let Ok(room) = RoomId::from_str(room) {
            return room.is_canvas().then_some(room);
        }
    }
    let raw = frame.str_field(KEY_ROOM_ID)?;
    RoomId::parse_in(RoomFamily::Canvas, raw).ok()
}

#[cfg(test)]
#[path = "manager_test.rs"]
mod tests;
