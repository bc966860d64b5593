//! Connection registry.
//!
//! DESIGN
//! ======
//! Three indexes kept in lockstep:
//! - handle id -> slot (identity, joined rooms, outbound sender)
//! - user id -> handle ids (one user may hold many tabs/devices)
//! - room -> member handle ids, in join order
//!
//! The registry is a plain data structure with no interior locking. The
//! relay owns it behind a mutex together with the presence tracker so a
//! membership change and its presence transition are applied atomically.
//!
//! ERROR HANDLING
//! ==============
//! Operations on a handle that was already disconnected return
//! `DeadHandle`. Callers treat it as a no-op; disconnect races are normal.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use frames::{Frame, RoomId};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::session::Identity;

pub type HandleId = Uuid;

/// Value reference to one live transport session. Cheap to clone; the
/// authoritative membership set lives in the registry.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: HandleId,
    pub identity: Arc<Identity>,
}

impl ConnectionHandle {
    #[must_use]
    pub fn user_id(&self) -> Uuid {
        self.identity.user_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection handle {0} is no longer registered")]
pub struct DeadHandle(pub HandleId);

/// A handle left a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room: RoomId,
    /// Another live handle of the same user is still joined to `room`.
    pub user_still_present: bool,
}

/// Result of removing a handle.
#[derive(Debug)]
pub struct Disconnected {
    pub departures: Vec<Departure>,
    /// The user has no live handles left anywhere.
    pub fully_offline: bool,
}

struct Slot {
    handle: ConnectionHandle,
    rooms: BTreeSet<RoomId>,
    tx: mpsc::Sender<Frame>,
}

#[derive(Default)]
pub struct Registry {
    slots: HashMap<HandleId, Slot>,
    by_user: HashMap<Uuid, HashSet<HandleId>>,
    rooms: HashMap<RoomId, Vec<HandleId>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handle for an authenticated identity.
    pub fn admit(&mut self, identity: Arc<Identity>, tx: mpsc::Sender<Frame>) -> ConnectionHandle {
        let handle = ConnectionHandle { id: Uuid::new_v4(), identity };
        self.by_user
            .entry(handle.user_id())
            .or_default()
            .insert(handle.id);
        self.slots
            .insert(handle.id, Slot { handle: handle.clone(), rooms: BTreeSet::new(), tx });
        handle
    }

    /// Add `room` to the handle's memberships. Returns `true` if the handle
    /// was not already a member.
    ///
    /// # Errors
    ///
    /// `DeadHandle` if the handle has been disconnected.
    pub fn join(&mut self, id: HandleId, room: &RoomId) -> Result<bool, DeadHandle> {
        let slot = self.slots.get_mut(&id).ok_or(DeadHandle(id))?;
        if !slot.rooms.insert(room.clone()) {
            return Ok(false);
        }
        self.rooms.entry(room.clone()).or_default().push(id);
        Ok(true)
    }

    /// Remove `room` from the handle's memberships. `Ok(None)` if the
    /// handle was not a member.
    ///
    /// # Errors
    ///
    /// `DeadHandle` if the handle has been disconnected.
    pub fn leave(&mut self, id: HandleId, room: &RoomId) -> Result<Option<Departure>, DeadHandle> {
        let slot = self.slots.get_mut(&id).ok_or(DeadHandle(id))?;
        if !slot.rooms.remove(room) {
            return Ok(None);
        }
        let user_id = slot.handle.user_id();
        self.unindex_member(id, room);
        Ok(Some(Departure { room: room.clone(), user_still_present: self.user_in_room(user_id, room) }))
    }

    /// Remove the handle and every membership it held. `None` if the
    /// handle is already gone.
    pub fn disconnect(&mut self, id: HandleId) -> Option<Disconnected> {
        let user_id = self.slots.get(&id)?.handle.user_id();

        // Drop from the identity index first so the presence checks in
        // `leave` only see the user's remaining handles.
        let fully_offline = match self.by_user.get_mut(&user_id) {
            Some(handles) => {
                handles.remove(&id);
                handles.is_empty()
            }
            None => true,
        };
        if fully_offline {
            self.by_user.remove(&user_id);
        }

        let rooms: Vec<RoomId> = self
            .slots
            .get(&id)
            .map(|s| s.rooms.iter().cloned().collect())
            .unwrap_or_default();
        let mut departures = Vec::with_capacity(rooms.len());
        for room in &rooms {
            if let Ok(Some(departure)) = self.leave(id, room) {
                departures.push(departure);
            }
        }

        self.slots.remove(&id)?;
        Some(Disconnected { departures, fully_offline })
    }

    /// Whether any live handle of `user_id` is joined to `room`. Scans the
    /// user's handles rather than keeping a counter.
    #[must_use]
    pub fn user_in_room(&self, user_id: Uuid, room: &RoomId) -> bool {
        self.by_user.get(&user_id).is_some_and(|handles| {
            handles
                .iter()
                .filter_map(|h| self.slots.get(h))
                .any(|slot| slot.rooms.contains(room))
        })
    }

    /// # Errors
    ///
    /// `DeadHandle` if the handle has been disconnected.
    pub fn is_member(&self, id: HandleId, room: &RoomId) -> Result<bool, DeadHandle> {
        let slot = self.slots.get(&id).ok_or(DeadHandle(id))?;
        Ok(slot.rooms.contains(room))
    }

    /// Member handles of `room` in join order.
    #[must_use]
    pub fn members(&self, room: &RoomId) -> &[HandleId] {
        self.rooms.get(room).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn sender(&self, id: HandleId) -> Option<&mpsc::Sender<Frame>> {
        self.slots.get(&id).map(|s| &s.tx)
    }

    #[cfg(test)]
    pub(crate) fn joined_rooms(&self, id: HandleId) -> Option<Vec<RoomId>> {
        self.slots.get(&id).map(|s| s.rooms.iter().cloned().collect())
    }

    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub(crate) fn handles_of(&self, user_id: Uuid) -> usize {
        self.by_user.get(&user_id).map_or(0, HashSet::len)
    }

    fn unindex_member(&mut self, id: HandleId, room: &RoomId) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.retain(|m| *m != id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }

    /// Panics if the indexes disagree.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for (id, slot) in &self.slots {
            for room in &slot.rooms {
                assert!(self.members(room).contains(id), "{id} missing from {room} index");
            }
            assert!(
                self.by_user
                    .get(&slot.handle.user_id())
                    .is_some_and(|h| h.contains(id)),
                "{id} missing from user index"
            );
        }
        for (room, members) in &self.rooms {
            assert!(!members.is_empty(), "empty member list kept for {room}");
            for id in members {
                let slot = self.slots.get(id).expect("orphan room member");
                assert!(slot.rooms.contains(room), "{id} indexed in {room} without membership");
            }
        }
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
