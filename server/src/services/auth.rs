//! Transport authenticator.
//!
//! LIFECYCLE
//! =========
//! Runs exactly once per connection attempt, in the upgrade handler, before
//! the WebSocket handshake completes. A rejected attempt never reaches the
//! connection registry, so no partial state exists for it.
//!
//! The credential is an opaque session token. It is looked for in the
//! `token` query parameter (browsers cannot set headers on a WebSocket),
//! then an `Authorization: Bearer` header, then the `session_token` cookie.

use std::collections::HashMap;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum_extra::extract::cookie::CookieJar;
use frames::ErrorCode;

use super::session::{Identity, IdentityLookup, LookupError};

pub const TOKEN_QUERY_PARAM: &str = "token";
pub const SESSION_COOKIE: &str = "session_token";
const TOKEN_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(&'static str),
    #[error("identity lookup failed: {0}")]
    Lookup(#[from] LookupError),
}

impl ErrorCode for AuthError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "E_UNAUTHENTICATED",
            Self::Lookup(_) => "E_IDENTITY_LOOKUP",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Lookup(_))
    }
}

/// Pull the credential out of the connection attempt's metadata.
#[must_use]
pub fn extract_credential(params: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = params.get(TOKEN_QUERY_PARAM) {
        return Some(token.clone());
    }

    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_owned());
    if bearer.is_some() {
        return bearer;
    }

    CookieJar::from_headers(headers)
        .get(SESSION_COOKIE)
        .map(|c| c.value().to_owned())
}

/// Session tokens are 32 random bytes rendered as lowercase hex.
#[must_use]
pub fn is_well_formed(credential: &str) -> bool {
    credential.len() == TOKEN_LEN && credential.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Resolve a credential to an identity or reject it.
///
/// # Errors
///
/// `Unauthenticated` when the credential is absent, malformed, expired, or
/// unknown. `Lookup` when the identity store cannot be reached.
pub async fn authenticate(lookup: &dyn IdentityLookup, credential: Option<&str>) -> Result<Identity, AuthError> {
    let Some(credential) = credential else {
        return Err(AuthError::Unauthenticated("credential required"));
    };
    if !is_well_formed(credential) {
        return Err(AuthError::Unauthenticated("malformed credential"));
    }
    lookup
        .resolve(credential)
        .await?
        .ok_or(AuthError::Unauthenticated("invalid or expired credential"))
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
