//! Short-lived HMAC confirmation tokens for playlist creation
//!
//! A validation call issues a token binding the user's intent (method plus
//! its parameters); the creation call must present the token with matching
//! parameters within five minutes. The SHA-256 of the token doubles as the
//! idempotency key, so one confirmed intent creates at most one job.

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::PlaylistParams;

type HmacSha256 = Hmac<Sha256>;

/// Tokens expire five minutes after issue
pub const CONFIRMATION_TOKEN_TTL_SECONDS: i64 = 300;

/// The signed portion of a confirmation token
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignedPayload {
    user_id: Uuid,
    params: PlaylistParams,
    issued_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenEnvelope {
    user_id: Uuid,
    params: PlaylistParams,
    issued_at: i64,
    signature: String,
}

/// A verified token's contents
#[derive(Debug, Clone)]
pub struct ConfirmationClaims {
    pub user_id: Uuid,
    pub params: PlaylistParams,
    pub issued_at: DateTime<Utc>,
}

pub struct ConfirmationTokenService {
    secret: Vec<u8>,
}

impl ConfirmationTokenService {
    pub fn new(hmac_secret: &str) -> Self {
        Self {
            secret: hmac_secret.as_bytes().to_vec(),
        }
    }

    fn sign(&self, payload: &SignedPayload) -> Result<String, AppError> {
        let canonical = serde_json::to_vec(payload)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("token serialization: {}", e)))?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("hmac key: {}", e)))?;
        mac.update(&canonical);
        Ok(hex_encode(&mac.finalize().into_bytes()))
    }

    /// Issue a token binding `params` to `user_id` for five minutes
    pub fn issue(&self, user_id: Uuid, params: &PlaylistParams) -> Result<String, AppError> {
        let payload = SignedPayload {
            user_id,
            params: params.clone(),
            issued_at: Utc::now().timestamp(),
        };
        let signature = self.sign(&payload)?;
        let envelope = TokenEnvelope {
            user_id: payload.user_id,
            params: payload.params,
            issued_at: payload.issued_at,
            signature,
        };
        let raw = serde_json::to_vec(&envelope)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("token serialization: {}", e)))?;
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw))
    }

    /// Verify signature and age; returns the bound claims
    pub fn verify(&self, token: &str) -> Result<ConfirmationClaims, AppError> {
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| AppError::ConfirmationTokenInvalid)?;
        let envelope: TokenEnvelope =
            serde_json::from_slice(&raw).map_err(|_| AppError::ConfirmationTokenInvalid)?;

        let payload = SignedPayload {
            user_id: envelope.user_id,
            params: envelope.params.clone(),
            issued_at: envelope.issued_at,
        };
        let expected = self.sign(&payload)?;
        if !constant_time_eq(expected.as_bytes(), envelope.signature.as_bytes()) {
            return Err(AppError::ConfirmationTokenInvalid);
        }

        let issued_at = DateTime::from_timestamp(envelope.issued_at, 0)
            .ok_or(AppError::ConfirmationTokenInvalid)?;
        let age = Utc::now() - issued_at;
        if age > Duration::seconds(CONFIRMATION_TOKEN_TTL_SECONDS) || age < Duration::seconds(-30)
        {
            return Err(AppError::ConfirmationTokenInvalid);
        }

        Ok(ConfirmationClaims {
            user_id: envelope.user_id,
            params: envelope.params,
            issued_at,
        })
    }

    /// The idempotency key derived from a token: the first 32 hex
    /// characters of its SHA-256.
    pub fn idempotency_key(token: &str) -> String {
        let digest = Sha256::digest(token.as_bytes());
        hex_encode(&digest)[..32].to_string()
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ShuffleMode, Top50Term};

    fn service() -> ConfirmationTokenService {
        ConfirmationTokenService::new("unit-test-secret")
    }

    fn params() -> PlaylistParams {
        PlaylistParams::Shuffle {
            source_playlist_id: "37i9dQZF1DXcBWIGoYBM5M".to_string(),
            shuffle_mode: ShuffleMode::Smart,
        }
    }

    #[test]
    fn issue_verify_round_trip() {
        let service = service();
        let user_id = Uuid::new_v4();
        let token = service.issue(user_id, &params()).unwrap();

        let claims = service.verify(&token).unwrap();
        assert_eq!(claims.user_id, user_id);
        assert_eq!(claims.params, params());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let service = service();
        let token = service.issue(Uuid::new_v4(), &params()).unwrap();

        // Re-encode with a different user id but the original signature
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(&token)
            .unwrap();
        let mut envelope: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        envelope["user_id"] = serde_json::json!(Uuid::new_v4());
        let forged = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&envelope).unwrap());

        assert!(matches!(
            service.verify(&forged),
            Err(AppError::ConfirmationTokenInvalid)
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = service().issue(Uuid::new_v4(), &params()).unwrap();
        let other = ConfirmationTokenService::new("a-different-secret");
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(service().verify("definitely-not-a-token").is_err());
        assert!(service().verify("").is_err());
    }

    #[test]
    fn idempotency_key_is_stable_and_short() {
        let token = service()
            .issue(
                Uuid::new_v4(),
                &PlaylistParams::Top50 {
                    term: Top50Term::Short,
                },
            )
            .unwrap();
        let a = ConfirmationTokenService::idempotency_key(&token);
        let b = ConfirmationTokenService::idempotency_key(&token);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn distinct_tokens_have_distinct_keys() {
        let service = service();
        let t1 = service.issue(Uuid::new_v4(), &params()).unwrap();
        let t2 = service.issue(Uuid::new_v4(), &params()).unwrap();
        assert_ne!(
            ConfirmationTokenService::idempotency_key(&t1),
            ConfirmationTokenService::idempotency_key(&t2)
        );
    }
}
