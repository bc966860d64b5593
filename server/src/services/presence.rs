//! Presence tracker for canvas rooms.
//!
//! DESIGN
//! ======
//! One roster per canvas room, one entry per user. Entries are keyed by
//! user id, so any number of connection handles owned by the same user
//! collapse to a single entry. The tracker itself knows nothing about
//! handles; the relay decides when a user's first handle arrives or last
//! handle departs and calls `announce` / `depart` accordingly.
//!
//! Rosters keep arrival order so `canvas:activeUsers` lists users in the
//! order they joined.

use std::collections::HashMap;

use frames::{Cursor, PresenceUser, RoomId};
use serde::Serialize;
use uuid::Uuid;

/// Per-user, per-room roster record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: Uuid,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub cursor: Option<Cursor>,
    pub last_active_at: i64,
}

impl PresenceEntry {
    fn new(user: &PresenceUser, now: i64) -> Self {
        Self {
            user_id: user.user_id,
            display_name: user.display_name.clone(),
            avatar_ref: user.avatar_ref.clone(),
            cursor: None,
            last_active_at: now,
        }
    }
}

/// What an `announce` did to the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `absent -> present`. Peers must be told.
    Joined,
    /// Entry already present; `last_active_at` was refreshed.
    Refreshed,
}

#[derive(Debug, Default)]
pub struct PresenceTracker {
    rooms: HashMap<RoomId, Vec<PresenceEntry>>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh the entry for `user` in `room`.
    pub fn announce(&mut self, room: &RoomId, user: &PresenceUser, now: i64) -> Transition {
        let roster = self.rooms.entry(room.clone()).or_default();
        if let Some(entry) = roster.iter_mut().find(|e| e.user_id == user.user_id) {
            entry.last_active_at = entry.last_active_at.max(now);
            return Transition::Refreshed;
        }
        roster.push(PresenceEntry::new(user, now));
        Transition::Joined
    }

    /// Remove the entry for `user_id`. Returns whether one existed.
    pub fn depart(&mut self, room: &RoomId, user_id: Uuid) -> bool {
        let Some(roster) = self.rooms.get_mut(room) else {
            return false;
        };
        let before = roster.len();
        roster.retain(|e| e.user_id != user_id);
        let removed = roster.len() != before;
        if roster.is_empty() {
            self.rooms.remove(room);
        }
        removed
    }

    /// Last-writer-wins cursor update. Also counts as activity.
    /// Returns `false` if the user has no entry in the room.
    pub fn move_cursor(&mut self, room: &RoomId, user_id: Uuid, cursor: Cursor, now: i64) -> bool {
        let Some(entry) = self.entry_mut(room, user_id) else {
            return false;
        };
        entry.cursor = Some(cursor);
        entry.last_active_at = entry.last_active_at.max(now);
        true
    }

    /// Current roster in arrival order.
    #[must_use]
    pub fn roster(&self, room: &RoomId) -> Vec<PresenceEntry> {
        self.rooms.get(room).cloned().unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, room: &RoomId, user_id: Uuid) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|r| r.iter().any(|e| e.user_id == user_id))
    }

    /// Drop every entry whose last activity is older than `max_age_ms`.
    /// Returns the removed `(room, user)` pairs.
    pub fn prune_stale(&mut self, now: i64, max_age_ms: i64) -> Vec<(RoomId, Uuid)> {
        let cutoff = now.saturating_sub(max_age_ms);
        let mut pruned = Vec::new();
        self.rooms.retain(|room, roster| {
            roster.retain(|e| {
                let keep = e.last_active_at >= cutoff;
                if !keep {
                    pruned.push((room.clone(), e.user_id));
                }
                keep
            });
            !roster.is_empty()
        });
        pruned
    }

    /// Remove a user from every room. Returns the rooms that had an entry.
    pub fn purge_user(&mut self, user_id: Uuid) -> Vec<RoomId> {
        let rooms: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, roster)| roster.iter().any(|e| e.user_id == user_id))
            .map(|(room, _)| room.clone())
            .collect();
        for room in &rooms {
            self.depart(room, user_id);
        }
        rooms
    }

    fn entry_mut(&mut self, room: &RoomId, user_id: Uuid) -> Option<&mut PresenceEntry> {
        self.rooms
            .get_mut(room)?
            .iter_mut()
            .find(|e| e.user_id == user_id)
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
