use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::catalog::CatalogTrack;

/// Where a listening event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "event_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Api,
    Import,
}

/// One play, unique by (user_id, track_id, played_at).
/// Stored in monthly range partitions of `listening_events`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ListeningEvent {
    pub user_id: Uuid,
    pub track_id: Uuid,
    pub played_at: DateTime<Utc>,
    #[serde(with = "super::ms_string")]
    pub ms_played: i64,
    /// True when `ms_played` was estimated from the track duration
    pub is_estimated: bool,
    pub source: EventSource,
}

/// A play parsed from the provider's recently-played feed, before catalog
/// resolution
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub track: CatalogTrack,
    pub played_at: DateTime<Utc>,
    pub ms_played: i64,
    pub is_estimated: bool,
    pub source: EventSource,
}

/// Outcome counts for one ingestion run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub added: u32,
    pub skipped: u32,
    pub updated: u32,
    pub errors: u32,
}

/// A freshly inserted play with resolved internal ids, handed to the
/// aggregator
#[derive(Debug, Clone)]
pub struct AddedPlay {
    pub track_id: Uuid,
    pub artist_ids: Vec<Uuid>,
    pub played_at: DateTime<Utc>,
    pub ms_played: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "import_job_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportJobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Offline bulk-file import bookkeeping. Terminal states are reached inside
/// the import worker or by the stale reaper.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ImportJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: ImportJobStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
