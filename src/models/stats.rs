use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Provider time window for top-N lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "term", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Term {
    Short,
    Medium,
    Long,
}

impl Term {
    pub const ALL: [Term; 3] = [Term::Short, Term::Medium, Term::Long];

    /// The provider's `time_range` query value
    pub fn as_provider_param(&self) -> &'static str {
        match self {
            Term::Short => "short_term",
            Term::Medium => "medium_term",
            Term::Long => "long_term",
        }
    }

    /// Map the public API's range parameter to a term
    pub fn from_range_param(range: &str) -> Option<Self> {
        match range {
            "4weeks" => Some(Term::Short),
            "6months" => Some(Term::Medium),
            "lifetime" => Some(Term::Long),
            _ => None,
        }
    }
}

/// Which list a top entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "top_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TopKind {
    Tracks,
    Artists,
}

/// Per-user per-track rollup
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserTrackStats {
    pub user_id: Uuid,
    pub track_id: Uuid,
    pub play_count: i64,
    #[serde(with = "super::ms_string")]
    pub total_ms: i64,
    pub last_played_at: Option<DateTime<Utc>>,
}

/// Per-user per-artist rollup
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserArtistStats {
    pub user_id: Uuid,
    pub artist_id: Uuid,
    pub play_count: i64,
    #[serde(with = "super::ms_string")]
    pub total_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "bucket_type", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BucketType {
    Day,
}

/// Per-user calendar bucket; `bucket_date` is midnight in the user's
/// timezone, stored as the corresponding UTC instant
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserTimeBucketStats {
    pub user_id: Uuid,
    pub bucket_type: BucketType,
    pub bucket_date: DateTime<Utc>,
    pub play_count: i64,
    #[serde(with = "super::ms_string")]
    pub total_ms: i64,
    pub unique_tracks: i64,
}

/// Per-user UTC hour-of-day rollup, hour in 0..=23
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserHourStats {
    pub user_id: Uuid,
    pub hour: i16,
    pub play_count: i64,
    #[serde(with = "super::ms_string")]
    pub total_ms: i64,
}

/// One rank in a user's cached top-N list.
/// The full set for a (user, kind, term) is rewritten atomically.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TopEntry {
    pub user_id: Uuid,
    pub kind: TopKind,
    pub term: Term,
    /// 1-based rank within the list
    pub rank: i32,
    pub track_id: Option<Uuid>,
    pub artist_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_param_mapping() {
        assert_eq!(Term::from_range_param("4weeks"), Some(Term::Short));
        assert_eq!(Term::from_range_param("6months"), Some(Term::Medium));
        assert_eq!(Term::from_range_param("lifetime"), Some(Term::Long));
        assert_eq!(Term::from_range_param("fortnight"), None);
    }

    #[test]
    fn provider_params() {
        assert_eq!(Term::Short.as_provider_param(), "short_term");
        assert_eq!(Term::Long.as_provider_param(), "long_term");
    }
}
