//! Playlist creation endpoints
//!
//! Creation is a two-step handshake: a validation call checks the request
//! and issues a five-minute confirmation token binding the method
//! parameters; the creation call presents the token with byte-identical
//! parameters. The SHA-256 of the token is the idempotency key, so
//! replaying a creation request returns the same job.

use axum::{extract::Path, extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, Result};
use crate::middleware::AuthenticatedUser;
use crate::models::PlaylistParams;
use crate::services::confirmation::CONFIRMATION_TOKEN_TTL_SECONDS;
use crate::services::playlist_builder::PlaylistService;
use crate::services::provider::validate_cover_image;
use crate::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct ValidatePlaylistRequest {
    #[serde(flatten)]
    pub params: PlaylistParams,
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[serde(default)]
    pub is_public: bool,
    pub cover_image_base64: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ValidatePlaylistResponse {
    pub confirmation_token: String,
    pub expires_in_seconds: i64,
}

/// POST /api/v1/playlists/validate
pub async fn validate_playlist_handler(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    Json(request): Json<ValidatePlaylistRequest>,
) -> Result<Json<ValidatePlaylistResponse>> {
    request.validate()?;
    PlaylistService::validate_params(&request.params)?;

    if let Some(cover) = &request.cover_image_base64 {
        validate_cover_image(cover).map_err(AppError::Provider)?;
    }

    let confirmation_token = state.confirmation.issue(auth.user_id, &request.params)?;
    Ok(Json(ValidatePlaylistResponse {
        confirmation_token,
        expires_in_seconds: CONFIRMATION_TOKEN_TTL_SECONDS,
    }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreatePlaylistRequest {
    pub confirmation_token: String,
    #[serde(flatten)]
    pub params: PlaylistParams,
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[serde(default)]
    pub is_public: bool,
    pub cover_image_base64: Option<String>,
}

/// POST /api/v1/playlists
pub async fn create_playlist_handler(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    Json(request): Json<CreatePlaylistRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    request.validate()?;

    let claims = state.confirmation.verify(&request.confirmation_token)?;
    if claims.user_id != auth.user_id {
        return Err(AppError::ConfirmationTokenInvalid);
    }

    // The token binds the user's confirmed intent; the request must
    // reproduce every method-specific field exactly.
    let mismatched = claims.params.mismatched_fields(&request.params);
    if !mismatched.is_empty() {
        return Err(AppError::ParamMismatch { fields: mismatched });
    }

    if let Some(cover) = &request.cover_image_base64 {
        validate_cover_image(cover).map_err(AppError::Provider)?;
    }
    PlaylistService::validate_params(&request.params)?;

    let response = state
        .playlists
        .create_job(
            auth.user_id,
            &request.confirmation_token,
            &request.params,
            &request.name,
            request.is_public,
            request.cover_image_base64,
        )
        .await?;

    let status = if response.idempotent {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(json!({
            "status": "ok",
            "data": { "job_id": response.job_id, "idempotent": response.idempotent },
        })),
    ))
}

/// GET /api/v1/playlists/jobs/:id
pub async fn get_playlist_job_handler(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    Path(job_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    let job = state
        .playlists
        .get_job(auth.user_id, job_id)
        .await
        .map_err(AppError::Internal)?
        .ok_or(AppError::NotFound {
            resource: "playlist job".to_string(),
        })?;

    Ok(Json(json!({ "status": "ok", "data": job })))
}
