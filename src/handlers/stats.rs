//! Read API over the pre-computed statistics
//!
//! Reads never block on recomputation: a stale cache enqueues a refresh
//! and serves whatever is present. Until a user is hydrated (first
//! successful top-stats run), an empty list answers `202 processing` and
//! is never written to the read-through cache - only hydrated emptiness
//! is a cacheable fact.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::middleware::AuthenticatedUser;
use crate::models::{Term, TopKind, User};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TopQuery {
    /// `4weeks`, `6months` or `lifetime`
    pub range: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TopTrackItem {
    pub rank: i32,
    pub id: Uuid,
    pub provider_id: String,
    pub name: String,
    #[serde(with = "crate::models::ms_string")]
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TopArtistItem {
    pub rank: i32,
    pub id: Uuid,
    pub provider_id: String,
    pub name: String,
    pub image_url: Option<String>,
}

async fn load_user(state: &AppState, user_id: Uuid) -> Result<User> {
    sqlx::query_as::<_, User>(
        "SELECT id, provider_id, display_name, image_url, country, created_at, \
         last_login_at, last_ingested_at, top_stats_refreshed_at FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(&state.db_pool)
    .await?
    .ok_or(AppError::NotFound {
        resource: "user".to_string(),
    })
}

fn parse_term(range: &str) -> Result<Term> {
    Term::from_range_param(range).ok_or_else(|| AppError::InvalidFieldValue {
        field: "range".to_string(),
        message: "expected one of 4weeks, 6months, lifetime".to_string(),
    })
}

fn cache_key(user_id: Uuid, kind: TopKind, term: Term) -> String {
    format!("top:{}:{:?}:{:?}", user_id, kind, term)
}

/// Shared shape of the two top-list endpoints
async fn top_response(
    state: &AppState,
    user: &User,
    kind: TopKind,
    term: Term,
    data: serde_json::Value,
    is_empty: bool,
) -> Response {
    let hydrated = user.top_stats_refreshed_at.is_some();
    if is_empty && !hydrated {
        // Not an answer yet, so not cacheable either
        return (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "processing", "data": [] })),
        )
            .into_response();
    }

    let body = json!({ "status": "ok", "data": data });
    state
        .stats_cache
        .insert(cache_key(user.id, kind, term), body.clone())
        .await;
    (StatusCode::OK, Json(body)).into_response()
}

/// GET /api/v1/stats/top/tracks?range=
pub async fn top_tracks_handler(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    Query(query): Query<TopQuery>,
) -> Result<Response> {
    let term = parse_term(&query.range)?;
    let user = load_user(&state, auth.user_id).await?;

    if let Err(e) = state.top_stats.trigger_lazy_refresh_if_stale(&user).await {
        tracing::warn!(user_id = %user.id, error = %e, "Lazy refresh enqueue failed");
    }

    if let Some(cached) = state
        .stats_cache
        .get(&cache_key(user.id, TopKind::Tracks, term))
        .await
    {
        return Ok((StatusCode::OK, Json(cached)).into_response());
    }

    let items = sqlx::query_as::<_, TopTrackItem>(
        "SELECT e.rank, t.id, t.provider_id, t.name, t.duration_ms \
         FROM top_entries e JOIN tracks t ON t.id = e.track_id \
         WHERE e.user_id = $1 AND e.kind = 'tracks' AND e.term = $2 \
         ORDER BY e.rank",
    )
    .bind(user.id)
    .bind(term)
    .fetch_all(&state.db_pool)
    .await?;

    let is_empty = items.is_empty();
    Ok(top_response(
        &state,
        &user,
        TopKind::Tracks,
        term,
        serde_json::to_value(items).map_err(|e| AppError::Internal(e.into()))?,
        is_empty,
    )
    .await)
}

/// GET /api/v1/stats/top/artists?range=
pub async fn top_artists_handler(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    Query(query): Query<TopQuery>,
) -> Result<Response> {
    let term = parse_term(&query.range)?;
    let user = load_user(&state, auth.user_id).await?;

    if let Err(e) = state.top_stats.trigger_lazy_refresh_if_stale(&user).await {
        tracing::warn!(user_id = %user.id, error = %e, "Lazy refresh enqueue failed");
    }

    if let Some(cached) = state
        .stats_cache
        .get(&cache_key(user.id, TopKind::Artists, term))
        .await
    {
        return Ok((StatusCode::OK, Json(cached)).into_response());
    }

    let items = sqlx::query_as::<_, TopArtistItem>(
        "SELECT e.rank, a.id, a.provider_id, a.name, a.image_url \
         FROM top_entries e JOIN artists a ON a.id = e.artist_id \
         WHERE e.user_id = $1 AND e.kind = 'artists' AND e.term = $2 \
         ORDER BY e.rank",
    )
    .bind(user.id)
    .bind(term)
    .fetch_all(&state.db_pool)
    .await?;

    let is_empty = items.is_empty();
    Ok(top_response(
        &state,
        &user,
        TopKind::Artists,
        term,
        serde_json::to_value(items).map_err(|e| AppError::Internal(e.into()))?,
        is_empty,
    )
    .await)
}

#[derive(Debug, Serialize)]
pub struct ListeningSummary {
    pub total_plays: i64,
    /// Decimal string, the total can exceed 2^53 milliseconds
    pub total_ms: String,
    pub unique_tracks: i64,
    pub unique_artists: i64,
}

/// GET /api/v1/stats/summary
pub async fn summary_handler(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>> {
    let (total_plays, total_ms, unique_tracks): (i64, i64, i64) = sqlx::query_as(
        "SELECT COALESCE(SUM(play_count), 0)::bigint, COALESCE(SUM(total_ms), 0)::bigint, \
         COUNT(*)::bigint FROM user_track_stats WHERE user_id = $1",
    )
    .bind(auth.user_id)
    .fetch_one(&state.db_pool)
    .await?;

    let (unique_artists,): (i64,) =
        sqlx::query_as("SELECT COUNT(*)::bigint FROM user_artist_stats WHERE user_id = $1")
            .bind(auth.user_id)
            .fetch_one(&state.db_pool)
            .await?;

    let summary = ListeningSummary {
        total_plays,
        total_ms: total_ms.to_string(),
        unique_tracks,
        unique_artists,
    };
    Ok(Json(json!({ "status": "ok", "data": summary })))
}
