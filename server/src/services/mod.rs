//! Relay services used by the websocket route.
//!
//! ARCHITECTURE
//! ============
//! `registry` and `presence` are plain data structures; `relay` owns both
//! behind one lock and is the only way to mutate them. `auth` and `session`
//! admit connections, `snapshot` talks to durable storage off the hot path.

pub mod auth;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod session;
pub mod snapshot;
