//! HMAC-signed session cookies
//!
//! The cookie carries the user id and an expiry; every authenticated
//! request re-issues it, giving a sliding 30-day session. Handlers receive
//! the user through the [`AuthenticatedUser`] extractor.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{Request, State},
    http::{header, request::Parts, HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const SESSION_COOKIE: &str = "session";
const SESSION_LIFETIME_DAYS: i64 = 30;

/// The authenticated user, extracted from request extensions
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
}

#[async_trait]
impl<S> axum::extract::FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .copied()
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionPayload {
    user_id: Uuid,
    expires_at: i64,
    signature: String,
}

/// Issues and verifies session cookie values
pub struct SessionService {
    secret: Vec<u8>,
}

impl SessionService {
    pub fn new(hmac_secret: &str) -> Self {
        Self {
            secret: hmac_secret.as_bytes().to_vec(),
        }
    }

    fn sign(&self, user_id: Uuid, expires_at: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(format!("{}|{}", user_id, expires_at).as_bytes());
        let digest = mac.finalize().into_bytes();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Build a fresh cookie value for the user, expiring 30 days out
    pub fn issue(&self, user_id: Uuid) -> String {
        let expires_at = (Utc::now() + Duration::days(SESSION_LIFETIME_DAYS)).timestamp();
        let payload = SessionPayload {
            user_id,
            expires_at,
            signature: self.sign(user_id, expires_at),
        };
        base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&payload).expect("session payload serializes"))
    }

    /// Verify a cookie value, returning the user id when valid
    pub fn verify(&self, cookie_value: &str) -> Option<Uuid> {
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(cookie_value)
            .ok()?;
        let payload: SessionPayload = serde_json::from_slice(&raw).ok()?;

        let expected = self.sign(payload.user_id, payload.expires_at);
        if expected != payload.signature {
            return None;
        }
        let expires_at = DateTime::from_timestamp(payload.expires_at, 0)?;
        if expires_at < Utc::now() {
            return None;
        }
        Some(payload.user_id)
    }
}

fn cookie_from_request(request: &Request, name: &str) -> Option<String> {
    let header = request.headers().get(header::COOKIE)?.to_str().ok()?;
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// Authenticate the request from its session cookie and slide the expiry.
/// Rejects with 401 when the cookie is absent, invalid or expired.
pub async fn session_middleware(
    State(sessions): State<Arc<SessionService>>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let cookie = cookie_from_request(&request, SESSION_COOKIE).ok_or(StatusCode::UNAUTHORIZED)?;
    let user_id = sessions.verify(&cookie).ok_or(StatusCode::UNAUTHORIZED)?;

    request
        .extensions_mut()
        .insert(AuthenticatedUser { user_id });

    let mut response = next.run(request).await;

    // Sliding expiry: every authenticated response carries a fresh cookie
    let reissued = sessions.issue(user_id);
    let cookie_header = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE,
        reissued,
        SESSION_LIFETIME_DAYS * 24 * 3600
    );
    if let Ok(value) = HeaderValue::from_str(&cookie_header) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_verify_round_trip() {
        let sessions = SessionService::new("secret");
        let user_id = Uuid::new_v4();
        let cookie = sessions.issue(user_id);
        assert_eq!(sessions.verify(&cookie), Some(user_id));
    }

    #[test]
    fn tampered_cookie_is_rejected() {
        let sessions = SessionService::new("secret");
        let cookie = sessions.issue(Uuid::new_v4());

        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(&cookie)
            .unwrap();
        let mut payload: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        payload["user_id"] = serde_json::json!(Uuid::new_v4());
        let forged = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&payload).unwrap());

        assert_eq!(sessions.verify(&forged), None);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let cookie = SessionService::new("secret-a").issue(Uuid::new_v4());
        assert_eq!(SessionService::new("secret-b").verify(&cookie), None);
    }
}
