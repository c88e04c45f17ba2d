use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::stats::Term;

/// How the playlist's track list is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "creation_method", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreationMethod {
    Shuffle,
    Top50Short,
    Top50Medium,
    Top50Long,
    Top50AllTime,
    TopKRecent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "playlist_job_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaylistJobStatus {
    Pending,
    Creating,
    AddingTracks,
    UploadingImage,
    Completed,
    Failed,
}

impl PlaylistJobStatus {
    /// States the stale reaper watches for dead heartbeats
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Self::Creating | Self::AddingTracks | Self::UploadingImage
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "shuffle_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ShuffleMode {
    /// Plain Fisher-Yates
    Standard,
    /// Fisher-Yates followed by a one-pass adjacent-duplicate-artist
    /// displacement
    Smart,
}

/// Durable playlist-creation job. The queue entry is a weak reference to
/// this row by id; losing the queue entry never loses the job.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlaylistJob {
    pub id: Uuid,
    pub user_id: Uuid,
    /// First 32 hex chars of SHA-256 over the confirmation token
    pub idempotency_key: String,
    pub creation_method: CreationMethod,
    pub name: String,
    pub is_public: bool,
    pub source_playlist_id: Option<String>,
    pub shuffle_mode: Option<ShuffleMode>,
    pub k_value: Option<i32>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub cover_image_base64: Option<String>,
    pub status: PlaylistJobStatus,
    pub total_tracks: i32,
    /// High-water mark for batch-add resumption
    pub added_tracks: i32,
    pub estimated_tracks: i32,
    /// Set at most once over the job's lifetime, even across retries
    pub spotify_playlist_id: Option<String>,
    pub spotify_playlist_url: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub rate_limit_delays: i32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Top-50 window selector in playlist parameters; extends [`Term`] with the
/// locally computed all-time list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Top50Term {
    Short,
    Medium,
    Long,
    AllTime,
}

impl Top50Term {
    pub fn creation_method(&self) -> CreationMethod {
        match self {
            Self::Short => CreationMethod::Top50Short,
            Self::Medium => CreationMethod::Top50Medium,
            Self::Long => CreationMethod::Top50Long,
            Self::AllTime => CreationMethod::Top50AllTime,
        }
    }

    pub fn term(&self) -> Option<Term> {
        match self {
            Self::Short => Some(Term::Short),
            Self::Medium => Some(Term::Medium),
            Self::Long => Some(Term::Long),
            Self::AllTime => None,
        }
    }
}

/// Method-specific playlist parameters, bound by the confirmation token.
///
/// Exactly the fields enumerated per variant participate in token binding;
/// a creation request must reproduce them verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PlaylistParams {
    Shuffle {
        source_playlist_id: String,
        shuffle_mode: ShuffleMode,
    },
    Top50 {
        term: Top50Term,
    },
    Recent {
        k_value: i32,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
    },
}

impl PlaylistParams {
    pub fn creation_method(&self) -> CreationMethod {
        match self {
            Self::Shuffle { .. } => CreationMethod::Shuffle,
            Self::Top50 { term } => term.creation_method(),
            Self::Recent { .. } => CreationMethod::TopKRecent,
        }
    }

    /// Field-level comparison against the parameters a confirmation token
    /// was issued for. Returns the names of fields that differ; a variant
    /// mismatch reports `method`.
    pub fn mismatched_fields(&self, requested: &PlaylistParams) -> Vec<String> {
        use PlaylistParams::*;
        let mut fields = Vec::new();
        match (self, requested) {
            (
                Shuffle {
                    source_playlist_id: a_src,
                    shuffle_mode: a_mode,
                },
                Shuffle {
                    source_playlist_id: b_src,
                    shuffle_mode: b_mode,
                },
            ) => {
                if a_src != b_src {
                    fields.push("source_playlist_id".to_string());
                }
                if a_mode != b_mode {
                    fields.push("shuffle_mode".to_string());
                }
            }
            (Top50 { term: a }, Top50 { term: b }) => {
                if a != b {
                    fields.push("term".to_string());
                }
            }
            (
                Recent {
                    k_value: a_k,
                    start_date: a_start,
                    end_date: a_end,
                },
                Recent {
                    k_value: b_k,
                    start_date: b_start,
                    end_date: b_end,
                },
            ) => {
                if a_k != b_k {
                    fields.push("k_value".to_string());
                }
                if a_start != b_start {
                    fields.push("start_date".to_string());
                }
                if a_end != b_end {
                    fields.push("end_date".to_string());
                }
            }
            _ => fields.push("method".to_string()),
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_match_reports_no_fields() {
        let a = PlaylistParams::Shuffle {
            source_playlist_id: "37i9dQZF1DXcBWIGoYBM5M".to_string(),
            shuffle_mode: ShuffleMode::Smart,
        };
        assert!(a.mismatched_fields(&a.clone()).is_empty());
    }

    #[test]
    fn single_character_difference_is_reported() {
        let issued = PlaylistParams::Shuffle {
            source_playlist_id: "37i9dQZF1DXcBWIGoYBM5M".to_string(),
            shuffle_mode: ShuffleMode::Standard,
        };
        let requested = PlaylistParams::Shuffle {
            source_playlist_id: "37i9dQZF1DXcBWIGoYBM5N".to_string(),
            shuffle_mode: ShuffleMode::Standard,
        };
        assert_eq!(
            issued.mismatched_fields(&requested),
            vec!["source_playlist_id".to_string()]
        );
    }

    #[test]
    fn method_swap_is_reported_as_method() {
        let issued = PlaylistParams::Top50 {
            term: Top50Term::Short,
        };
        let requested = PlaylistParams::Recent {
            k_value: 100,
            start_date: None,
            end_date: None,
        };
        assert_eq!(
            issued.mismatched_fields(&requested),
            vec!["method".to_string()]
        );
    }

    #[test]
    fn recent_window_fields_compared_individually() {
        let now = Utc::now();
        let issued = PlaylistParams::Recent {
            k_value: 100,
            start_date: Some(now - chrono::Duration::days(30)),
            end_date: Some(now),
        };
        let requested = PlaylistParams::Recent {
            k_value: 150,
            start_date: Some(now - chrono::Duration::days(30)),
            end_date: None,
        };
        assert_eq!(
            issued.mismatched_fields(&requested),
            vec!["k_value".to_string(), "end_date".to_string()]
        );
    }

    #[test]
    fn status_progress_classification() {
        assert!(PlaylistJobStatus::Creating.is_in_progress());
        assert!(PlaylistJobStatus::AddingTracks.is_in_progress());
        assert!(PlaylistJobStatus::UploadingImage.is_in_progress());
        assert!(!PlaylistJobStatus::Pending.is_in_progress());
        assert!(PlaylistJobStatus::Failed.is_terminal());
    }
}
