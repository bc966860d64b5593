//! Snapshot coordinator: late-joiner recovery and durable raster writes.
//!
//! DESIGN
//! ======
//! The coordinator never sits on the relay's hot path. Reads for a joiner
//! who found an empty room run in a spawned task and answer that joiner
//! alone with `canvas:sync`. Writes go through a bounded queue drained by a
//! background worker that coalesces rasters per room inside one flush
//! window and only writes the newest.
//!
//! ERROR HANDLING
//! ==============
//! A failed read answers the joiner with a retryable
//! `E_SNAPSHOT_UNAVAILABLE` error; live peers keep working from their own
//! state. Failed writes are retried with linear back-off, then dropped with
//! a warning. A full write queue drops the raster rather than stall the
//! sender; the next significant change or periodic save supersedes it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use frames::events::{CANVAS_SYNC, KEY_CANVAS_DATA, KEY_ROOM_ID, KEY_UPDATED_AT};
use frames::{Data, ErrorCode, Frame, RoomId};
use serde_json::{Value, json};
use sqlx::{PgPool, Row};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::registry::HandleId;
use super::relay::Relay;
use crate::config::SnapshotWriterConfig;

/// Last known good raster of a canvas room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanvasSnapshot {
    pub room: RoomId,
    /// Encoded raster, usually a `data:image/png;base64,...` URL.
    pub image_data: String,
    /// Milliseconds since the Unix epoch.
    pub updated_at: i64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<sqlx::Error> for SnapshotError {
    fn from(e: sqlx::Error) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl ErrorCode for SnapshotError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::StoreUnavailable(_) => "E_SNAPSHOT_UNAVAILABLE",
        }
    }

    fn retryable(&self) -> bool {
        true
    }
}

/// Durable snapshot storage keyed by room.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, room: &RoomId) -> Result<Option<CanvasSnapshot>, SnapshotError>;
    async fn put(&self, room: &RoomId, raster: &str) -> Result<(), SnapshotError>;
}

// =============================================================================
// POSTGRES STORE
// =============================================================================

pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn get(&self, room: &RoomId) -> Result<Option<CanvasSnapshot>, SnapshotError> {
        let row = sqlx::query(
            r"SELECT image_data,
                     (EXTRACT(EPOCH FROM updated_at) * 1000)::BIGINT AS updated_at_ms
              FROM canvas_snapshots
              WHERE room_id = $1",
        )
        .bind(room.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| CanvasSnapshot {
            room: room.clone(),
            image_data: r.get("image_data"),
            updated_at: r.get("updated_at_ms"),
        }))
    }

    async fn put(&self, room: &RoomId, raster: &str) -> Result<(), SnapshotError> {
        sqlx::query(
            r"INSERT INTO canvas_snapshots (room_id, image_data, updated_at)
              VALUES ($1, $2, now())
              ON CONFLICT (room_id)
              DO UPDATE SET image_data = EXCLUDED.image_data, updated_at = now()",
        )
        .bind(room.to_string())
        .bind(raster)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// =============================================================================
// COORDINATOR
// =============================================================================

#[derive(Debug)]
struct PendingWrite {
    room: RoomId,
    raster: String,
}

#[derive(Clone)]
pub struct SnapshotCoordinator {
    store: Arc<dyn SnapshotStore>,
    writes: mpsc::Sender<PendingWrite>,
}

impl SnapshotCoordinator {
    /// Build the coordinator and spawn its write worker.
    #[must_use]
    pub fn spawn(store: Arc<dyn SnapshotStore>, config: SnapshotWriterConfig) -> Self {
        let writes = spawn_snapshot_writer(store.clone(), config);
        Self { store, writes }
    }

    /// Queue a raster for durable storage without waiting on the store.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the write queue is full or the worker is gone.
    pub fn schedule_put(&self, room: &RoomId, raster: String) -> Result<(), SnapshotError> {
        match self.writes.try_send(PendingWrite { room: room.clone(), raster }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(%room, "snapshot write queue full; dropping raster");
                Err(SnapshotError::StoreUnavailable("write queue full".into()))
            }
            Err(TrySendError::Closed(_)) => {
                warn!(%room, "snapshot write queue closed; dropping raster");
                Err(SnapshotError::StoreUnavailable("writer stopped".into()))
            }
        }
    }

    /// Read the durable snapshot and shape it as a `canvas:sync` payload.
    /// A room with no snapshot yields `canvasData: null`.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the store read fails.
    pub async fn recover(&self, room: &RoomId) -> Result<Data, SnapshotError> {
        let snapshot = self.store.get(room).await?;
        let mut data = Data::new();
        data.insert(KEY_ROOM_ID.into(), json!(room.key()));
        match snapshot {
            Some(snap) => {
                info!(room = %snap.room, updated_at = snap.updated_at, "snapshot: recovered raster");
                data.insert(KEY_CANVAS_DATA.into(), Value::String(snap.image_data));
                data.insert(KEY_UPDATED_AT.into(), json!(snap.updated_at));
            }
            None => {
                info!(%room, "snapshot: none stored");
                data.insert(KEY_CANVAS_DATA.into(), Value::Null);
            }
        }
        Ok(data)
    }

    /// Answer `request` from `handle_id` with the durable snapshot of `room`,
    /// off the caller's task. The answer is addressed to that handle only.
    pub fn recover_for(&self, relay: Relay, handle_id: HandleId, room: RoomId, request: Frame) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let frame = match coordinator.recover(&room).await {
                Ok(data) => request.answer(CANVAS_SYNC, data).with_room(&room),
                Err(e) => {
                    warn!(%room, %handle_id, error = %e, "snapshot: recovery read failed");
                    let mut frame = request.error_from(&e).with_room(&room);
                    frame.syscall = CANVAS_SYNC.into();
                    frame
                }
            };
            if !relay.send_to(handle_id, frame) {
                info!(%room, %handle_id, "snapshot: joiner gone before recovery completed");
            }
        })
    }
}

// =============================================================================
// WRITE WORKER
// =============================================================================

fn spawn_snapshot_writer(store: Arc<dyn SnapshotStore>, config: SnapshotWriterConfig) -> mpsc::Sender<PendingWrite> {
    let (tx, mut rx) = mpsc::channel::<PendingWrite>(config.queue_capacity);

    info!(
        queue_capacity = config.queue_capacity,
        flush_ms = config.flush_ms,
        retries = config.retries,
        retry_base_ms = config.retry_base_ms,
        "snapshot writer configured"
    );

    tokio::spawn(async move {
        let mut pending: HashMap<RoomId, String> = HashMap::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(config.flush_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_write = rx.recv() => {
                    if let Some(write) = maybe_write {
                        pending.insert(write.room, write.raster);
                    } else {
                        flush_pending(store.as_ref(), &mut pending, config).await;
                        break;
                    }
                }
                _ = ticker.tick() => {
                    flush_pending(store.as_ref(), &mut pending, config).await;
                }
            }
        }
    });

    tx
}

async fn flush_pending(store: &dyn SnapshotStore, pending: &mut HashMap<RoomId, String>, config: SnapshotWriterConfig) {
    for (room, raster) in std::mem::take(pending) {
        put_with_retry(store, &room, &raster, config).await;
    }
}

async fn put_with_retry(store: &dyn SnapshotStore, room: &RoomId, raster: &str, config: SnapshotWriterConfig) {
    let attempts = config.retries.max(1);
    for attempt in 1..=attempts {
        match store.put(room, raster).await {
            Ok(()) => {
                info!(%room, bytes = raster.len(), "snapshot: stored raster");
                return;
            }
            Err(e) if attempt < attempts => {
                warn!(%room, error = %e, attempt, total = attempts, "snapshot write failed; retrying");
                tokio::time::sleep(Duration::from_millis((attempt as u64) * config.retry_base_ms)).await;
            }
            Err(e) => {
                error!(%room, error = %e, "snapshot write failed after retries; dropping raster");
                return;
            }
        }
    }
}

#[cfg(test)]
#[path = "snapshot_test.rs"]
mod tests;
