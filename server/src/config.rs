//! Runtime configuration.
//!
//! DESIGN
//! ======
//! Every knob is read once at startup from the environment (after `.env` is
//! loaded by `dotenvy`). Missing or unparseable values fall back to the
//! defaults below; only `DATABASE_URL` is mandatory and is read by `main`.

use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;
const DEFAULT_PRESENCE_STALE_MULTIPLIER: u32 = 3;
const DEFAULT_CANVAS_ROOM_CAPACITY: usize = 10;
const DEFAULT_SNAPSHOT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_SNAPSHOT_FLUSH_MS: u64 = 250;
const DEFAULT_SNAPSHOT_RETRIES: usize = 3;
const DEFAULT_SNAPSHOT_RETRY_BASE_MS: u64 = 50;

/// Tuning knobs for the snapshot write worker.
#[derive(Clone, Copy, Debug)]
pub struct SnapshotWriterConfig {
    /// Bounded channel capacity for pending snapshot writes.
    pub queue_capacity: usize,
    /// How often buffered writes are flushed, in milliseconds.
    pub flush_ms: u64,
    /// Number of retry attempts on store failures.
    pub retries: usize,
    /// Base delay in milliseconds for linear retry back-off.
    pub retry_base_ms: u64,
}

impl Default for SnapshotWriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_SNAPSHOT_QUEUE_CAPACITY,
            flush_ms: DEFAULT_SNAPSHOT_FLUSH_MS,
            retries: DEFAULT_SNAPSHOT_RETRIES,
            retry_base_ms: DEFAULT_SNAPSHOT_RETRY_BASE_MS,
        }
    }
}

/// Server configuration shared through `AppState`.
#[derive(Clone, Copy, Debug)]
pub struct RelayConfig {
    pub port: u16,
    /// Outbound queue depth per connection. A full queue drops frames for
    /// that connection only.
    pub client_channel_capacity: usize,
    /// Interval at which clients re-announce canvas presence.
    pub heartbeat_interval: Duration,
    /// Presence entries silent for this many heartbeats are pruned.
    pub presence_stale_multiplier: u32,
    /// Advisory number of concurrent users per canvas, reported in
    /// `canvas:activeUsers`.
    pub canvas_room_capacity: usize,
    pub snapshot: SnapshotWriterConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            client_channel_capacity: DEFAULT_CLIENT_CHANNEL_CAPACITY,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            presence_stale_multiplier: DEFAULT_PRESENCE_STALE_MULTIPLIER,
            canvas_room_capacity: DEFAULT_CANVAS_ROOM_CAPACITY,
            snapshot: SnapshotWriterConfig::default(),
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            client_channel_capacity: env_parse("CLIENT_CHANNEL_CAPACITY", DEFAULT_CLIENT_CHANNEL_CAPACITY).max(1),
            heartbeat_interval: Duration::from_secs(
                env_parse("HEARTBEAT_INTERVAL_SECS", DEFAULT_HEARTBEAT_INTERVAL_SECS).max(1),
            ),
            presence_stale_multiplier: env_parse("PRESENCE_STALE_MULTIPLIER", DEFAULT_PRESENCE_STALE_MULTIPLIER).max(1),
            canvas_room_capacity: env_parse("CANVAS_ROOM_CAPACITY", DEFAULT_CANVAS_ROOM_CAPACITY),
            snapshot: SnapshotWriterConfig {
                queue_capacity: env_parse("SNAPSHOT_QUEUE_CAPACITY", DEFAULT_SNAPSHOT_QUEUE_CAPACITY).max(1),
                flush_ms: env_parse("SNAPSHOT_FLUSH_MS", DEFAULT_SNAPSHOT_FLUSH_MS).max(1),
                retries: env_parse("SNAPSHOT_RETRIES", DEFAULT_SNAPSHOT_RETRIES),
                retry_base_ms: env_parse("SNAPSHOT_RETRY_BASE_MS", DEFAULT_SNAPSHOT_RETRY_BASE_MS),
            },
        }
    }

    /// Age after which a presence entry with no heartbeat is considered
    /// stale. Saturates instead of overflowing on absurd settings.
    #[must_use]
    pub fn presence_stale_after(&self) -> Duration {
        self.heartbeat_interval
            .checked_mul(self.presence_stale_multiplier)
            .unwrap_or(Duration::MAX)
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
