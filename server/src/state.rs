//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the relay (connection registry + presence), the identity lookup,
//! and the snapshot coordinator. The external collaborators are trait
//! objects so tests can swap Postgres for in-memory fakes.

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::services::relay::Relay;
use crate::services::session::IdentityLookup;
use crate::services::snapshot::{SnapshotCoordinator, SnapshotStore};

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub identities: Arc<dyn IdentityLookup>,
    pub snapshots: SnapshotCoordinator,
    pub config: RelayConfig,
}

impl AppState {
    /// Build the state and spawn the snapshot write worker. Must be called
    /// inside a Tokio runtime.
    #[must_use]
    pub fn new(config: RelayConfig, identities: Arc<dyn IdentityLookup>, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            relay: Relay::new(),
            identities,
            snapshots: SnapshotCoordinator::spawn(store, config.snapshot),
            config,
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
