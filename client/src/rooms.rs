//! Room interest bookkeeping.
//!
//! Several views may want the same room at once. Each view acquires the room
//! when it mounts and releases it when it unmounts; the network only hears
//! about the first acquire and the last release.

use std::collections::BTreeMap;

use frames::events::*;
use frames::{Data, Frame, PresenceUser, RoomFamily, RoomId};
use serde_json::{Value, json};
use uuid::Uuid;

/// Interest held in one room.
#[derive(Clone, Debug, PartialEq)]
pub struct Interest {
    views: usize,
    /// Presence payload re-sent on every canvas heartbeat.
    pub presence: Option<PresenceUser>,
}

/// Rooms this connection believes it is in, with a view count per room.
#[derive(Debug, Default)]
pub struct RoomBook {
    rooms: BTreeMap<RoomId, Interest>,
}

impl RoomBook {
    /// Register one view's interest. Returns `true` for the first view, the
    /// only acquire that should reach the server. A later acquire carrying a
    /// presence payload replaces the stored one.
    pub fn acquire(&mut self, room: RoomId, presence: Option<PresenceUser>) -> bool {
        if let Some(interest) = self.rooms.get_mut(&room) {
            interest.views += 1;
            if presence.is_some() {
                interest.presence = presence;
            }
            return false;
        }
        self.rooms.insert(room, Interest { views: 1, presence });
        true
    }

    /// Drop one view's interest. Returns the interest when the last view
    /// lets go; `None` while other views still hold the room or when the
    /// room was never acquired.
    pub fn release(&mut self, room: &RoomId) -> Option<Interest> {
        let interest = self.rooms.get_mut(room)?;
        interest.views = interest.views.saturating_sub(1);
        if interest.views > 0 {
            return None;
        }
        self.rooms.remove(room)
    }

    #[must_use]
    pub fn holds(&self, room: &RoomId) -> bool {
        self.rooms.contains_key(room)
    }

    #[must_use]
    pub fn views(&self, room: &RoomId) -> usize {
        self.rooms.get(room).map_or(0, |i| i.views)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn rooms(&self) -> impl Iterator<Item = (&RoomId, &Interest)> {
        self.rooms.iter()
    }

    /// One join frame per held room, in room order.
    #[must_use]
    pub fn join_frames(&self) -> Vec<Frame> {
        self.rooms
            .iter()
            .map(|(room, interest)| join_frame(room, interest.presence.as_ref()))
            .collect()
    }

    /// `canvas:join` refreshes for canvas rooms that carry a presence payload.
    #[must_use]
    pub fn heartbeat_frames(&self) -> Vec<Frame> {
        self.rooms
            .iter()
            .filter(|(room, interest)| room.is_canvas() && interest.presence.is_some())
            .map(|(room, interest)| join_frame(room, interest.presence.as_ref()))
            .collect()
    }
}

// =============================================================================
// FRAMES
// =============================================================================

/// The join request for `room` in its family's wire shape.
#[must_use]
pub fn join_frame(room: &RoomId, presence: Option<&PresenceUser>) -> Frame {
    let mut data = Data::new();
    let syscall = match room.family() {
        RoomFamily::Chat => {
            data.insert(KEY_ROOM_ID.into(), json!(room.key()));
            JOIN_ROOM
        }
        RoomFamily::Community => {
            data.insert(KEY_COMMUNITY_ID.into(), json!(room.key()));
            JOIN_COMMUNITY
        }
        RoomFamily::Canvas => {
            data.insert(KEY_ROOM_ID.into(), json!(room.key()));
            if let Some(user) = presence {
                data.insert(KEY_USER.into(), serde_json::to_value(user).unwrap_or(Value::Null));
            }
            CANVAS_JOIN
        }
    };
    Frame::request(syscall, data).with_room(room)
}

/// The leave request for `room`. Canvas leaves name the departing user when
/// known.
#[must_use]
pub fn leave_frame(room: &RoomId, user_id: Option<Uuid>) -> Frame {
    let mut data = Data::new();
    let syscall = match room.family() {
        RoomFamily::Chat => {
            data.insert(KEY_ROOM_ID.into(), json!(room.key()));
            LEAVE_ROOM
        }
        RoomFamily::Community => {
            data.insert(KEY_COMMUNITY_ID.into(), json!(room.key()));
            LEAVE_COMMUNITY
        }
        RoomFamily::Canvas => {
            data.insert(KEY_ROOM_ID.into(), json!(room.key()));
            if let Some(user_id) = user_id {
                data.insert(KEY_USER_ID.into(), json!(user_id.to_string()));
            }
            CANVAS_LEAVE
        }
    };
    Frame::request(syscall, data).with_room(room)
}

// =============================================================================
// CANVAS STATE
// =============================================================================

/// Ask the room's peers for their raster. The next `canvas:sync` for the
/// room answers it.
#[must_use]
pub fn request_sync_frame(room: &RoomId) -> Frame {
    canvas_frame(CANVAS_REQUEST_SYNC, room, None)
}

/// Answer a peer's `canvas:requestSync` with the local raster.
#[must_use]
pub fn provide_sync_frame(room: &RoomId, canvas_data: impl Into<String>) -> Frame {
    canvas_frame(CANVAS_PROVIDE_SYNC, room, Some(canvas_data.into()))
}

/// Upload the local raster for durable storage.
#[must_use]
pub fn save_snapshot_frame(room: &RoomId, canvas_data: impl Into<String>) -> Frame {
    canvas_frame(CANVAS_SAVE_SNAPSHOT, room, Some(canvas_data.into()))
}

fn canvas_frame(syscall: &str, room: &RoomId, canvas_data: Option<String>) -> Frame {
    let mut data = Data::new();
    data.insert(KEY_ROOM_ID.into(), json!(room.key()));
    if let Some(raster) = canvas_data {
        data.insert(KEY_CANVAS_DATA.into(), Value::String(raster));
    }
    Frame::request(syscall, data).with_room(room)
}

// =============================================================================
// CAPACITY
// =============================================================================

/// Cooperative canvas capacity check. The server reports capacity but does
/// not enforce it; clients refuse to join a full room themselves.
#[must_use]
pub fn can_join_canvas(roster_len: usize, capacity: usize) -> bool {
    roster_len < capacity
}

/// Whether a `canvas:activeUsers` answer leaves room for `user_id`. A user
/// already on the roster (another tab) is always admitted. A frame without a
/// roster or capacity admits.
#[must_use]
pub fn roster_admits(active_users: &Frame, user_id: Uuid) -> bool {
    let Some(users) = active_users.data.get(KEY_USERS).and_then(Value::as_array) else {
        return true;
    };
    let me = user_id.to_string();
    if users
        .iter()
        .any(|u| u.get(KEY_USER_ID).and_then(Value::as_str) == Some(me.as_str()))
    {
        return true;
    }
    let Some(capacity) = active_users.data.get(KEY_CAPACITY).and_then(Value::as_u64) else {
        return true;
    };
    can_join_canvas(users.len(), usize::try_from(capacity).unwrap_or(usize::MAX))
}

#[cfg(test)]
#[path = "rooms_test.rs"]
mod tests;
