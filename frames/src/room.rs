//! Room keys.
//!
//! A room is a named broadcast scope with no storage of its own. Its key is
//! `<family>:<id>`; the id part is opaque to the relay.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The family a room key belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoomFamily {
    /// Text chat room, keyed by chat id.
    Chat,
    /// Shared drawing canvas, keyed by community id.
    Canvas,
    /// Community-wide notification scope.
    Community,
}

impl RoomFamily {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Canvas => "canvas",
            Self::Community => "community",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "chat" => Some(Self::Chat),
            "canvas" => Some(Self::Canvas),
            "community" => Some(Self::Community),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomIdError {
    #[error("room id is empty")]
    Empty,
    #[error("unknown room family: {0}")]
    UnknownFamily(String),
    #[error("room {0} does not belong to the {1} family")]
    WrongFamily(String, &'static str),
}

/// A fully-qualified room key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId {
    family: RoomFamily,
    key: String,
}

impl RoomId {
    /// Build a room id from a family and a non-empty key.
    ///
    /// # Errors
    ///
    /// Returns [`RoomIdError::Empty`] if `key` is blank.
    pub fn new(family: RoomFamily, key: impl Into<String>) -> Result<Self, RoomIdError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(RoomIdError::Empty);
        }
        Ok(Self { family, key })
    }

    /// Parse a payload room reference within an expected family.
    ///
    /// Accepts either the qualified form (`canvas:42`) or a bare id (`42`),
    /// which is placed in `family`. A qualified id from another family is
    /// rejected.
    ///
    /// # Errors
    ///
    /// Returns an error for empty input or a family mismatch.
    pub fn parse_in(family: RoomFamily, raw: &str) -> Result<Self, RoomIdError> {
        let raw = raw.trim();
        if let Some((prefix, rest)) = raw.split_once(':') {
            if let Some(found) = RoomFamily::from_prefix(prefix) {
                if found != family {
                    return Err(RoomIdError::WrongFamily(raw.to_owned(), family.as_str()));
                }
                return Self::new(family, rest.trim());
            }
        }
        Self::new(family, raw)
    }

    #[must_use]
    pub fn chat(key: impl Into<String>) -> Self {
        Self { family: RoomFamily::Chat, key: key.into() }
    }

    #[must_use]
    pub fn canvas(key: impl Into<String>) -> Self {
        Self { family: RoomFamily::Canvas, key: key.into() }
    }

    #[must_use]
    pub fn community(key: impl Into<String>) -> Self {
        Self { family: RoomFamily::Community, key: key.into() }
    }

    #[must_use]
    pub fn family(&self) -> RoomFamily {
        self.family
    }

    /// The id part without the family prefix.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn is_canvas(&self) -> bool {
        self.family == RoomFamily::Canvas
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family.as_str(), self.key)
    }
}

impl FromStr for RoomId {
    type Err = RoomIdError;

    /// Parse a qualified room key. Bare ids are rejected here; use
    /// [`RoomId::parse_in`] when the family is implied by context.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((prefix, rest)) = s.trim().split_once(':') else {
            return Err(RoomIdError::UnknownFamily(s.to_owned()));
        };
        let family = RoomFamily::from_prefix(prefix).ok_or_else(|| RoomIdError::UnknownFamily(prefix.to_owned()))?;
        Self::new(family, rest.trim())
    }
}

impl Serialize for RoomId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
