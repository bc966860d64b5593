//! Native client for the realtime relay.
//!
//! One [`ClientHandle`] owns one logical connection. Views clone the handle
//! and register interest in rooms; the connection task dials, re-dials with
//! backoff, re-joins every room that still has interest after each
//! reconnect, and keeps canvas presence alive with heartbeats.
//!
//! DESIGN
//! ======
//! - `manager` is a pure state machine: it decides what to send and when to
//!   retry but performs no I/O, so every transition is unit tested.
//! - `connection` is the tokio task that drives the socket from those
//!   decisions.
//! - `rooms` and `sync` are bookkeeping shared by both.

pub mod connection;
pub mod manager;
pub mod policy;
pub mod rooms;
pub mod sync;

pub use connection::{ClientConfig, ClientError, ClientHandle};
pub use manager::{ConnectionManager, ConnectionStatus, Decision, FailReason};
pub use policy::ReconnectPolicy;
pub use rooms::{
    RoomBook, can_join_canvas, provide_sync_frame, request_sync_frame, roster_admits, save_snapshot_frame,
};
pub use sync::{SnapshotSchedule, SyncGate};
