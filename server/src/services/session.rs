//! Identity lookup for session credentials.
//!
//! ARCHITECTURE
//! ============
//! The relay never owns user records. It asks an `IdentityLookup` to turn a
//! session credential into an `Identity`, and to answer community membership
//! questions when a connection asks to join a canvas or community room. The
//! Postgres implementation reads the `sessions`, `users`, and
//! `community_members` tables; tests plug in an in-memory lookup.

use async_trait::async_trait;
use frames::PresenceUser;
use serde::Serialize;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// An authenticated principal. Resolved once at admission and immutable for
/// the lifetime of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: Uuid,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl Identity {
    /// Presence payload broadcast to canvas peers.
    #[must_use]
    pub fn presence(&self) -> PresenceUser {
        PresenceUser {
            user_id: self.user_id,
            display_name: self.display_name.clone(),
            avatar_ref: self.avatar_ref.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("identity backend unavailable: {0}")]
    Unavailable(String),
}

/// Source of truth for who a credential belongs to and which communities
/// a user may enter.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// Resolve a credential to its identity. Unknown and expired
    /// credentials both yield `Ok(None)`.
    async fn resolve(&self, credential: &str) -> Result<Option<Identity>, LookupError>;

    /// Whether `user_id` is a member of `community_id`.
    async fn is_community_member(&self, user_id: Uuid, community_id: &str) -> Result<bool, LookupError>;
}

/// Postgres-backed lookup.
pub struct PgIdentityLookup {
    pool: PgPool,
}

impl PgIdentityLookup {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityLookup for PgIdentityLookup {
    async fn resolve(&self, credential: &str) -> Result<Option<Identity>, LookupError> {
        let row = sqlx::query(
            r"SELECT u.id, u.display_name, u.avatar_ref
              FROM sessions s
              JOIN users u ON u.id = s.user_id
              WHERE s.token = $1 AND s.expires_at > now()",
        )
        .bind(credential)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        Ok(row.map(|r| Identity {
            user_id: r.get("id"),
            display_name: r.get("display_name"),
            avatar_ref: r.get("avatar_ref"),
        }))
    }

    async fn is_community_member(&self, user_id: Uuid, community_id: &str) -> Result<bool, LookupError> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM community_members WHERE community_id = $1 AND user_id = $2) AS member",
        )
        .bind(community_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;
        Ok(row.get("member"))
    }
}

/// Connectivity failures are reported as `Unavailable`; everything else is
/// a query problem.
fn classify(e: sqlx::Error) -> LookupError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            LookupError::Unavailable(e.to_string())
        }
        other => LookupError::Database(other),
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
