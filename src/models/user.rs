use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub provider_id: String,
    pub display_name: String,
    pub image_url: Option<String>,
    pub country: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    /// Ingestion cursor: the maximum `played_at` of events actually inserted
    pub last_ingested_at: Option<DateTime<Utc>>,
    /// Set only inside a successful top-stats transaction
    pub top_stats_refreshed_at: Option<DateTime<Utc>>,
}

/// Per-user settings; the timezone is the one dial that affects aggregation
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserSettings {
    pub user_id: Uuid,
    /// IANA timezone name, e.g. "Europe/Berlin"
    pub timezone: String,
    pub is_public_profile: bool,
}

impl UserSettings {
    /// Parse the stored timezone, falling back to UTC on garbage
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::UTC)
    }
}

/// Engagement tier derived from the last login, drives refresh cadence
/// and seeding priority
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngagementTier {
    /// Logged in within the last 48 hours
    Active,
    /// Logged in within the last 7 days
    Recent,
    /// Everyone else
    Dormant,
}

impl EngagementTier {
    pub fn classify(last_login_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        match last_login_at {
            Some(at) if now - at <= Duration::hours(48) => Self::Active,
            Some(at) if now - at <= Duration::days(7) => Self::Recent,
            _ => Self::Dormant,
        }
    }

    /// Maximum top-stats age before a refresh is due for this tier
    pub fn max_refresh_age(&self) -> Duration {
        match self {
            Self::Active => Duration::hours(24),
            Self::Recent => Duration::hours(72),
            Self::Dormant => Duration::hours(24),
        }
    }
}

impl User {
    pub fn tier(&self, now: DateTime<Utc>) -> EngagementTier {
        EngagementTier::classify(self.last_login_at, now)
    }

    /// Whether the cached top-N lists are due for a rebuild
    pub fn top_stats_refresh_needed(&self, now: DateTime<Utc>) -> bool {
        match self.top_stats_refreshed_at {
            None => true,
            Some(at) => now - at >= self.tier(now).max_refresh_age(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_with(
        last_login: Option<Duration>,
        refreshed: Option<Duration>,
        now: DateTime<Utc>,
    ) -> User {
        User {
            id: Uuid::new_v4(),
            provider_id: "31k5p2qxyzabcdefghij22".to_string(),
            display_name: "listener".to_string(),
            image_url: None,
            country: None,
            created_at: now - Duration::days(90),
            last_login_at: last_login.map(|d| now - d),
            last_ingested_at: None,
            top_stats_refreshed_at: refreshed.map(|d| now - d),
        }
    }

    #[test]
    fn tier_boundaries() {
        let now = Utc::now();
        assert_eq!(
            EngagementTier::classify(Some(now - Duration::hours(1)), now),
            EngagementTier::Active
        );
        assert_eq!(
            EngagementTier::classify(Some(now - Duration::days(3)), now),
            EngagementTier::Recent
        );
        assert_eq!(
            EngagementTier::classify(Some(now - Duration::days(30)), now),
            EngagementTier::Dormant
        );
        assert_eq!(
            EngagementTier::classify(None, now),
            EngagementTier::Dormant
        );
    }

    #[test]
    fn refresh_needed_when_never_refreshed() {
        let now = Utc::now();
        let user = user_with(Some(Duration::hours(1)), None, now);
        assert!(user.top_stats_refresh_needed(now));
    }

    #[test]
    fn active_tier_refreshes_daily() {
        let now = Utc::now();
        let fresh = user_with(Some(Duration::hours(1)), Some(Duration::hours(2)), now);
        assert!(!fresh.top_stats_refresh_needed(now));

        let stale = user_with(Some(Duration::hours(1)), Some(Duration::hours(25)), now);
        assert!(stale.top_stats_refresh_needed(now));
    }

    #[test]
    fn recent_tier_refreshes_every_three_days() {
        let now = Utc::now();
        let fresh = user_with(Some(Duration::days(3)), Some(Duration::hours(48)), now);
        assert!(!fresh.top_stats_refresh_needed(now));

        let stale = user_with(Some(Duration::days(3)), Some(Duration::hours(73)), now);
        assert!(stale.top_stats_refresh_needed(now));
    }
}
