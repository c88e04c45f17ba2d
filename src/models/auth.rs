use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Provider connection state for one user.
///
/// Only the refresh token is persisted, encrypted at rest; access tokens
/// live in process memory. Mutated exclusively by the token manager.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuthRecord {
    pub user_id: Uuid,
    /// Base64 of nonce || AES-256-GCM ciphertext of the refresh token
    pub refresh_token_ciphertext: String,
    pub last_refresh_at: DateTime<Utc>,
    pub is_valid: bool,
    pub consecutive_failures: i32,
}

/// Why a token operation failed; drives invalidation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFailureReason {
    /// Upstream rejected the access token (401)
    Unauthenticated,
    /// The refresh endpoint reported `invalid_grant` - immediately terminal
    Revoked,
    /// Anything else (transport, 5xx during refresh)
    Other,
}
