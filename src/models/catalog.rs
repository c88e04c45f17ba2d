use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use uuid::Uuid;

/// Catalog artist row, keyed internally by a surrogate id
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Artist {
    pub id: Uuid,
    pub provider_id: String,
    pub name: String,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Album {
    pub id: Uuid,
    pub provider_id: String,
    pub name: String,
    pub image_url: Option<String>,
    pub release_date: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Track {
    pub id: Uuid,
    pub provider_id: String,
    pub name: String,
    pub duration_ms: i64,
    pub preview_url: Option<String>,
    pub album_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Raw artist payload as parsed from provider responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogArtist {
    pub provider_id: String,
    pub name: String,
    pub image_url: Option<String>,
}

/// Raw album payload as parsed from provider responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogAlbum {
    pub provider_id: String,
    pub name: String,
    pub image_url: Option<String>,
    pub release_date: Option<String>,
}

/// Raw track payload with its embedded album and artists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogTrack {
    pub provider_id: String,
    pub name: String,
    pub duration_ms: i64,
    pub preview_url: Option<String>,
    pub is_local: bool,
    pub album: Option<CatalogAlbum>,
    pub artists: Vec<CatalogArtist>,
}

/// providerId -> internal id maps produced by one catalog upsert batch.
/// Owned by the worker processing the batch and discarded afterwards.
#[derive(Debug, Default)]
pub struct CatalogIdMaps {
    pub artists: HashMap<String, Uuid>,
    pub albums: HashMap<String, Uuid>,
    pub tracks: HashMap<String, Uuid>,
}

impl CatalogIdMaps {
    /// Internal artist ids for a track's artist list, skipping unknowns
    pub fn artist_ids_for(&self, track: &CatalogTrack) -> Vec<Uuid> {
        track
            .artists
            .iter()
            .filter_map(|a| self.artists.get(&a.provider_id).copied())
            .collect()
    }
}
