//! Token lifecycle management
//!
//! Refresh tokens are the only credentials at rest, AES-256-GCM encrypted
//! with a key derived from the application secret. Access tokens live in
//! process memory only. The manager refreshes proactively before the
//! provider TTL runs out and invalidates connections after repeated
//! failures or an explicit revoke.

use std::sync::Arc;
use std::time::Duration;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm,
};
use anyhow::{anyhow, Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::ProviderError;
use crate::models::{AuthRecord, TokenFailureReason};
use crate::services::provider::ProviderApi;

/// Provider access tokens live one hour; refresh proactively at 50 minutes
const PROACTIVE_REFRESH_AFTER: Duration = Duration::from_secs(50 * 60);

/// Consecutive failures before a connection is invalidated
const FAILURE_THRESHOLD: i32 = 3;

/// AES-256-GCM wrapper for refresh tokens at rest.
/// The key is derived from the application HMAC secret.
pub struct TokenEncryption {
    key: [u8; 32],
}

impl TokenEncryption {
    pub fn new(hmac_secret: &str) -> Self {
        let digest = Sha256::digest(hmac_secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Encrypt to base64(nonce || ciphertext)
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&self.key));

        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = aes_gcm::Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("Failed to encrypt refresh token"))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .context("Invalid ciphertext encoding")?;
        if combined.len() < 12 {
            return Err(anyhow!("Ciphertext too short"));
        }

        let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = aes_gcm::Nonce::from_slice(&combined[..12]);

        let plaintext = cipher
            .decrypt(nonce, &combined[12..])
            .map_err(|_| anyhow!("Failed to decrypt refresh token"))?;

        String::from_utf8(plaintext).context("Invalid UTF-8 in decrypted token")
    }
}

#[derive(Clone)]
struct CachedAccessToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// A usable access token with its remaining lifetime
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of `record_token_failure`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub invalidated: bool,
    pub consecutive_failures: i32,
}

pub struct TokenManager {
    pool: PgPool,
    provider: Arc<dyn ProviderApi>,
    crypto: TokenEncryption,
    access_tokens: DashMap<Uuid, CachedAccessToken>,
}

impl TokenManager {
    pub fn new(pool: PgPool, provider: Arc<dyn ProviderApi>, hmac_secret: &str) -> Self {
        Self {
            pool,
            provider,
            crypto: TokenEncryption::new(hmac_secret),
            access_tokens: DashMap::new(),
        }
    }

    async fn load_auth_record(&self, user_id: Uuid) -> Result<Option<AuthRecord>> {
        let record = sqlx::query_as::<_, AuthRecord>(
            "SELECT user_id, refresh_token_ciphertext, last_refresh_at, is_valid, \
             consecutive_failures FROM auth_records WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Return a usable access token for the user, or `None` when the user
    /// has no valid provider connection.
    ///
    /// Triggers a proactive refresh when the stored `last_refresh_at` is
    /// older than 50 minutes (the provider TTL is one hour).
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_valid_access_token(&self, user_id: Uuid) -> Result<Option<AccessToken>> {
        let Some(record) = self.load_auth_record(user_id).await? else {
            return Ok(None);
        };
        if !record.is_valid {
            return Ok(None);
        }

        let now = Utc::now();
        let age = (now - record.last_refresh_at)
            .to_std()
            .unwrap_or(Duration::ZERO);

        if age < PROACTIVE_REFRESH_AFTER {
            if let Some(cached) = self.access_tokens.get(&user_id) {
                if cached.expires_at > now {
                    return Ok(Some(AccessToken {
                        token: cached.token.clone(),
                        expires_at: cached.expires_at,
                    }));
                }
            }
        }

        let refreshed = self.refresh_user_token(user_id).await?;
        Ok(Some(refreshed))
    }

    /// Run the provider's refresh exchange and persist the outcome.
    ///
    /// Providers may rotate the refresh token; a rotated token is
    /// re-encrypted and stored in place of the old one.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn refresh_user_token(&self, user_id: Uuid) -> Result<AccessToken> {
        let record = self
            .load_auth_record(user_id)
            .await?
            .ok_or_else(|| anyhow!("No provider connection for user {}", user_id))?;

        let refresh_token = self.crypto.decrypt(&record.refresh_token_ciphertext)?;

        let refreshed = match self.provider.refresh_access_token(&refresh_token).await {
            Ok(refreshed) => refreshed,
            Err(ProviderError::GrantRevoked) => {
                warn!(user_id = %user_id, "Refresh grant revoked, invalidating connection");
                self.record_token_failure(user_id, TokenFailureReason::Revoked)
                    .await?;
                return Err(ProviderError::GrantRevoked.into());
            }
            Err(err) => {
                self.record_token_failure(user_id, TokenFailureReason::Other)
                    .await?;
                return Err(err.into());
            }
        };

        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(refreshed.expires_in_seconds as i64);

        if let Some(rotated) = &refreshed.refresh_token {
            let ciphertext = self.crypto.encrypt(rotated)?;
            sqlx::query(
                "UPDATE auth_records SET refresh_token_ciphertext = $2, last_refresh_at = $3, \
                 is_valid = TRUE, consecutive_failures = 0 WHERE user_id = $1",
            )
            .bind(user_id)
            .bind(ciphertext)
            .bind(now)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE auth_records SET last_refresh_at = $2, is_valid = TRUE, \
                 consecutive_failures = 0 WHERE user_id = $1",
            )
            .bind(user_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }

        self.access_tokens.insert(
            user_id,
            CachedAccessToken {
                token: refreshed.access_token.clone(),
                expires_at,
            },
        );

        info!(user_id = %user_id, "Refreshed provider access token");
        Ok(AccessToken {
            token: refreshed.access_token,
            expires_at,
        })
    }

    /// Count a token failure; invalidates the connection at the threshold
    /// or immediately on an explicit revoke.
    pub async fn record_token_failure(
        &self,
        user_id: Uuid,
        reason: TokenFailureReason,
    ) -> Result<FailureOutcome> {
        let row: Option<(i32,)> = sqlx::query_as(
            "UPDATE auth_records SET consecutive_failures = consecutive_failures + 1 \
             WHERE user_id = $1 RETURNING consecutive_failures",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((consecutive_failures,)) = row else {
            return Ok(FailureOutcome {
                invalidated: false,
                consecutive_failures: 0,
            });
        };

        let invalidated =
            reason == TokenFailureReason::Revoked || consecutive_failures >= FAILURE_THRESHOLD;

        if invalidated {
            sqlx::query("UPDATE auth_records SET is_valid = FALSE WHERE user_id = $1")
                .bind(user_id)
                .execute(&self.pool)
                .await?;
            self.access_tokens.remove(&user_id);
            warn!(
                user_id = %user_id,
                consecutive_failures,
                reason = ?reason,
                "Provider connection invalidated"
            );
        }

        Ok(FailureOutcome {
            invalidated,
            consecutive_failures,
        })
    }

    /// Zero the failure counter after any successful provider call
    pub async fn reset_token_failures(&self, user_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE auth_records SET consecutive_failures = 0 \
             WHERE user_id = $1 AND consecutive_failures <> 0",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let crypto = TokenEncryption::new("test_secret");
        let ciphertext = crypto.encrypt("AQB-refresh-token-value").unwrap();
        assert_ne!(ciphertext, "AQB-refresh-token-value");
        assert_eq!(crypto.decrypt(&ciphertext).unwrap(), "AQB-refresh-token-value");
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let crypto = TokenEncryption::new("test_secret");
        let a = crypto.encrypt("same-token").unwrap();
        let b = crypto.encrypt("same-token").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let a = TokenEncryption::new("secret_a");
        let b = TokenEncryption::new("secret_b");
        let ciphertext = a.encrypt("token").unwrap();
        assert!(b.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn decrypt_rejects_garbage() {
        let crypto = TokenEncryption::new("test_secret");
        assert!(crypto.decrypt("not base64 at all!!!").is_err());
        assert!(crypto.decrypt("YWJj").is_err()); // too short for a nonce
    }
}
