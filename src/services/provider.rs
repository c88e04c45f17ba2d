//! Typed streaming-provider API client
//!
//! One operation per upstream endpoint, with every response mapped into the
//! closed [`ProviderError`] taxonomy. Batch operations reject oversized
//! inputs locally before any network traffic. Workers depend on the
//! [`ProviderApi`] trait, never on the concrete client, so tests can swap
//! the transport.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::config::ProviderSettings;
use crate::error::ProviderError;
use crate::models::{CatalogAlbum, CatalogArtist, CatalogTrack, Term};

/// Page size and batch caps enforced by the upstream API
pub const RECENTLY_PLAYED_MAX: usize = 50;
pub const TOP_LIST_MAX: usize = 50;
pub const TRACK_LOOKUP_MAX: usize = 50;
pub const ALBUM_LOOKUP_MAX: usize = 20;
pub const ARTIST_LOOKUP_MAX: usize = 50;
pub const PLAYLIST_PAGE_MAX: usize = 100;
pub const ADD_TRACKS_MAX: usize = 100;
pub const PLAYLIST_TRACKS_TOTAL_MAX: usize = 10_000;
pub const COVER_IMAGE_MAX_BYTES: usize = 256 * 1024;

const DEFAULT_RETRY_AFTER_SECONDS: u64 = 60;

/// One item from the recently-played feed
#[derive(Debug, Clone)]
pub struct PlayedItem {
    pub track: CatalogTrack,
    pub played_at: DateTime<Utc>,
}

/// A page of the recently-played feed
#[derive(Debug, Clone, Default)]
pub struct RecentlyPlayedPage {
    pub items: Vec<PlayedItem>,
}

/// A playlist as listed under the current user
#[derive(Debug, Clone)]
pub struct PlaylistSummary {
    pub provider_id: String,
    pub name: String,
    pub track_count: u32,
    pub owned_by_user: bool,
}

#[derive(Debug, Clone)]
pub struct PlaylistPage {
    pub items: Vec<PlaylistSummary>,
    pub total: u32,
}

#[derive(Debug, Clone)]
pub struct PlaylistTracksPage {
    pub items: Vec<CatalogTrack>,
    pub total: u32,
}

#[derive(Debug, Clone)]
pub struct CreatedPlaylist {
    pub provider_id: String,
    pub url: Option<String>,
}

/// Result of the provider's refresh-token exchange. Providers may rotate
/// the refresh token; a `None` means keep the stored one.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in_seconds: u64,
}

/// Accepted cover image formats, detected from magic bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverImageFormat {
    Png,
    Jpeg,
}

/// Decode and validate a base64 cover image: 256 KiB raw cap, PNG or JPEG
/// magic bytes. Runs at request validation and again before upload.
pub fn validate_cover_image(image_base64: &str) -> Result<CoverImageFormat, ProviderError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(image_base64.trim())
        .map_err(|_| ProviderError::InvalidInput("cover image is not valid base64".to_string()))?;

    if raw.len() > COVER_IMAGE_MAX_BYTES {
        return Err(ProviderError::InvalidInput(format!(
            "cover image is {} bytes, maximum is {}",
            raw.len(),
            COVER_IMAGE_MAX_BYTES
        )));
    }

    if raw.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        Ok(CoverImageFormat::Png)
    } else if raw.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Ok(CoverImageFormat::Jpeg)
    } else {
        Err(ProviderError::InvalidInput(
            "cover image must be PNG or JPEG".to_string(),
        ))
    }
}

/// The capability seam workers program against
#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// Recently-played feed, paginated by a millisecond cursor
    async fn recently_played(
        &self,
        access_token: &str,
        after_ms: Option<i64>,
        limit: usize,
    ) -> Result<RecentlyPlayedPage, ProviderError>;

    async fn top_tracks(
        &self,
        access_token: &str,
        term: Term,
        limit: usize,
    ) -> Result<Vec<CatalogTrack>, ProviderError>;

    async fn top_artists(
        &self,
        access_token: &str,
        term: Term,
        limit: usize,
    ) -> Result<Vec<CatalogArtist>, ProviderError>;

    async fn tracks(
        &self,
        access_token: &str,
        ids: &[String],
    ) -> Result<Vec<CatalogTrack>, ProviderError>;

    async fn albums(
        &self,
        access_token: &str,
        ids: &[String],
    ) -> Result<Vec<CatalogAlbum>, ProviderError>;

    async fn artists(
        &self,
        access_token: &str,
        ids: &[String],
    ) -> Result<Vec<CatalogArtist>, ProviderError>;

    async fn my_playlists(
        &self,
        access_token: &str,
        limit: usize,
        offset: usize,
    ) -> Result<PlaylistPage, ProviderError>;

    async fn playlist_tracks(
        &self,
        access_token: &str,
        playlist_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<PlaylistTracksPage, ProviderError>;

    async fn create_playlist(
        &self,
        access_token: &str,
        user_provider_id: &str,
        name: &str,
        public: bool,
    ) -> Result<CreatedPlaylist, ProviderError>;

    /// Add up to [`ADD_TRACKS_MAX`] track URIs to a playlist
    async fn add_tracks(
        &self,
        access_token: &str,
        playlist_id: &str,
        uris: &[String],
    ) -> Result<(), ProviderError>;

    /// Upload a base64 JPEG/PNG cover image
    async fn upload_cover_image(
        &self,
        access_token: &str,
        playlist_id: &str,
        image_base64: &str,
    ) -> Result<(), ProviderError>;

    /// Exchange a refresh token for a fresh access token
    async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<RefreshedToken, ProviderError>;
}

/// Concrete client over the Spotify Web API
pub struct SpotifyClient {
    http: Client,
    client_id: String,
    client_secret: String,
    api_base: String,
    accounts_base: String,
}

impl SpotifyClient {
    pub fn new(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            api_base: settings.api_base_url.trim_end_matches('/').to_string(),
            accounts_base: settings.accounts_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// Map a non-2xx response into the fixed taxonomy
    async fn map_error(response: Response) -> ProviderError {
        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED => ProviderError::Unauthenticated,
            StatusCode::FORBIDDEN => ProviderError::Forbidden,
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_seconds = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECONDS);
                ProviderError::RateLimited {
                    retry_after_seconds,
                }
            }
            s if s.is_server_error() => ProviderError::ProviderDown {
                status: s.as_u16(),
            },
            s => ProviderError::Api { status: s.as_u16() },
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        access_token: &str,
        url: String,
    ) -> Result<T, ProviderError> {
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::map_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(format!("decode failed: {}", e)))
    }

    fn check_batch(ids: &[String], max: usize, what: &str) -> Result<(), ProviderError> {
        if ids.is_empty() {
            return Err(ProviderError::InvalidInput(format!(
                "{} lookup requires at least one id",
                what
            )));
        }
        if ids.len() > max {
            return Err(ProviderError::InvalidInput(format!(
                "{} lookup accepts at most {} ids, got {}",
                what,
                max,
                ids.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderApi for SpotifyClient {
    async fn recently_played(
        &self,
        access_token: &str,
        after_ms: Option<i64>,
        limit: usize,
    ) -> Result<RecentlyPlayedPage, ProviderError> {
        if limit == 0 || limit > RECENTLY_PLAYED_MAX {
            return Err(ProviderError::InvalidInput(format!(
                "recently-played limit must be 1..={}",
                RECENTLY_PLAYED_MAX
            )));
        }

        let mut url = format!("{}?limit={}", self.url("/me/player/recently-played"), limit);
        if let Some(after) = after_ms {
            url.push_str(&format!("&after={}", after));
        }

        let body: RecentlyPlayedResponse = self.get_json(access_token, url).await?;
        let items = body
            .items
            .into_iter()
            .filter_map(|item| {
                let played_at = item.played_at;
                item.track.into_catalog_track().map(|track| PlayedItem {
                    track,
                    played_at,
                })
            })
            .collect();

        Ok(RecentlyPlayedPage { items })
    }

    async fn top_tracks(
        &self,
        access_token: &str,
        term: Term,
        limit: usize,
    ) -> Result<Vec<CatalogTrack>, ProviderError> {
        if limit == 0 || limit > TOP_LIST_MAX {
            return Err(ProviderError::InvalidInput(format!(
                "top-tracks limit must be 1..={}",
                TOP_LIST_MAX
            )));
        }

        let url = format!(
            "{}?time_range={}&limit={}",
            self.url("/me/top/tracks"),
            term.as_provider_param(),
            limit
        );
        let body: PagingResponse<TrackObject> = self.get_json(access_token, url).await?;
        Ok(body
            .items
            .into_iter()
            .filter_map(TrackObject::into_catalog_track)
            .collect())
    }

    async fn top_artists(
        &self,
        access_token: &str,
        term: Term,
        limit: usize,
    ) -> Result<Vec<CatalogArtist>, ProviderError> {
        if limit == 0 || limit > TOP_LIST_MAX {
            return Err(ProviderError::InvalidInput(format!(
                "top-artists limit must be 1..={}",
                TOP_LIST_MAX
            )));
        }

        let url = format!(
            "{}?time_range={}&limit={}",
            self.url("/me/top/artists"),
            term.as_provider_param(),
            limit
        );
        let body: PagingResponse<ArtistObject> = self.get_json(access_token, url).await?;
        Ok(body.items.into_iter().map(ArtistObject::into_catalog_artist).collect())
    }

    async fn tracks(
        &self,
        access_token: &str,
        ids: &[String],
    ) -> Result<Vec<CatalogTrack>, ProviderError> {
        Self::check_batch(ids, TRACK_LOOKUP_MAX, "track")?;
        let url = format!("{}?ids={}", self.url("/tracks"), ids.join(","));
        let body: TracksResponse = self.get_json(access_token, url).await?;
        Ok(body
            .tracks
            .into_iter()
            .flatten()
            .filter_map(TrackObject::into_catalog_track)
            .collect())
    }

    async fn albums(
        &self,
        access_token: &str,
        ids: &[String],
    ) -> Result<Vec<CatalogAlbum>, ProviderError> {
        Self::check_batch(ids, ALBUM_LOOKUP_MAX, "album")?;
        let url = format!("{}?ids={}", self.url("/albums"), ids.join(","));
        let body: AlbumsResponse = self.get_json(access_token, url).await?;
        Ok(body
            .albums
            .into_iter()
            .flatten()
            .map(AlbumObject::into_catalog_album)
            .collect())
    }

    async fn artists(
        &self,
        access_token: &str,
        ids: &[String],
    ) -> Result<Vec<CatalogArtist>, ProviderError> {
        Self::check_batch(ids, ARTIST_LOOKUP_MAX, "artist")?;
        let url = format!("{}?ids={}", self.url("/artists"), ids.join(","));
        let body: ArtistsResponse = self.get_json(access_token, url).await?;
        Ok(body
            .artists
            .into_iter()
            .flatten()
            .map(ArtistObject::into_catalog_artist)
            .collect())
    }

    async fn my_playlists(
        &self,
        access_token: &str,
        limit: usize,
        offset: usize,
    ) -> Result<PlaylistPage, ProviderError> {
        let url = format!(
            "{}?limit={}&offset={}",
            self.url("/me/playlists"),
            limit.min(50),
            offset
        );
        let body: PagingResponse<PlaylistObject> = self.get_json(access_token, url).await?;
        Ok(PlaylistPage {
            total: body.total,
            items: body
                .items
                .into_iter()
                .map(|p| PlaylistSummary {
                    provider_id: p.id,
                    name: p.name,
                    track_count: p.tracks.map(|t| t.total).unwrap_or(0),
                    owned_by_user: true,
                })
                .collect(),
        })
    }

    async fn playlist_tracks(
        &self,
        access_token: &str,
        playlist_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<PlaylistTracksPage, ProviderError> {
        if limit == 0 || limit > PLAYLIST_PAGE_MAX {
            return Err(ProviderError::InvalidInput(format!(
                "playlist-tracks limit must be 1..={}",
                PLAYLIST_PAGE_MAX
            )));
        }

        let url = format!(
            "{}?limit={}&offset={}",
            self.url(&format!("/playlists/{}/tracks", playlist_id)),
            limit,
            offset
        );
        let body: PagingResponse<PlaylistTrackItem> = self.get_json(access_token, url).await?;
        Ok(PlaylistTracksPage {
            total: body.total,
            items: body
                .items
                .into_iter()
                .filter_map(|item| item.track.and_then(TrackObject::into_catalog_track))
                .collect(),
        })
    }

    async fn create_playlist(
        &self,
        access_token: &str,
        user_provider_id: &str,
        name: &str,
        public: bool,
    ) -> Result<CreatedPlaylist, ProviderError> {
        let url = self.url(&format!("/users/{}/playlists", user_provider_id));
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&serde_json::json!({ "name": name, "public": public }))
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::map_error(response).await);
        }

        let body: PlaylistObject = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(format!("decode failed: {}", e)))?;

        Ok(CreatedPlaylist {
            provider_id: body.id,
            url: body.external_urls.and_then(|u| u.spotify),
        })
    }

    async fn add_tracks(
        &self,
        access_token: &str,
        playlist_id: &str,
        uris: &[String],
    ) -> Result<(), ProviderError> {
        if uris.is_empty() {
            return Ok(());
        }
        if uris.len() > ADD_TRACKS_MAX {
            return Err(ProviderError::InvalidInput(format!(
                "add-tracks accepts at most {} uris, got {}",
                ADD_TRACKS_MAX,
                uris.len()
            )));
        }

        let url = self.url(&format!("/playlists/{}/tracks", playlist_id));
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&serde_json::json!({ "uris": uris }))
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::map_error(response).await);
        }
        Ok(())
    }

    async fn upload_cover_image(
        &self,
        access_token: &str,
        playlist_id: &str,
        image_base64: &str,
    ) -> Result<(), ProviderError> {
        let format = validate_cover_image(image_base64)?;

        let content_type = match format {
            CoverImageFormat::Png => "image/png",
            CoverImageFormat::Jpeg => "image/jpeg",
        };

        let url = self.url(&format!("/playlists/{}/images", playlist_id));
        let response = self
            .http
            .put(&url)
            .bearer_auth(access_token)
            .header("Content-Type", content_type)
            .body(image_base64.to_string())
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::map_error(response).await);
        }
        Ok(())
    }

    async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<RefreshedToken, ProviderError> {
        let url = format!("{}/api/token", self.accounts_base);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            // A 400 from the token endpoint with `invalid_grant` means the
            // user revoked access; surface that distinctly so callers can
            // mark the connection terminal.
            let body: TokenErrorResponse = response.json().await.unwrap_or_default();
            if body.error.as_deref() == Some("invalid_grant") {
                return Err(ProviderError::GrantRevoked);
            }
            return Err(ProviderError::Api { status: 400 });
        }
        if !status.is_success() {
            return Err(Self::map_error(response).await);
        }

        let body: TokenRefreshResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(format!("decode failed: {}", e)))?;

        Ok(RefreshedToken {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_in_seconds: body.expires_in,
        })
    }
}

// Provider wire types

#[derive(Debug, Deserialize)]
struct RecentlyPlayedResponse {
    items: Vec<PlayHistoryItem>,
}

#[derive(Debug, Deserialize)]
struct PlayHistoryItem {
    track: TrackObject,
    #[serde(deserialize_with = "deserialize_rfc3339")]
    played_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct PagingResponse<T> {
    items: Vec<T>,
    #[serde(default)]
    total: u32,
}

#[derive(Debug, Deserialize)]
struct TracksResponse {
    tracks: Vec<Option<TrackObject>>,
}

#[derive(Debug, Deserialize)]
struct AlbumsResponse {
    albums: Vec<Option<AlbumObject>>,
}

#[derive(Debug, Deserialize)]
struct ArtistsResponse {
    artists: Vec<Option<ArtistObject>>,
}

#[derive(Debug, Deserialize)]
struct TrackObject {
    id: Option<String>,
    name: String,
    duration_ms: i64,
    preview_url: Option<String>,
    #[serde(default)]
    is_local: bool,
    #[serde(default)]
    artists: Vec<ArtistObject>,
    album: Option<AlbumObject>,
}

impl TrackObject {
    /// Local files have no provider id and are dropped from catalog flows
    fn into_catalog_track(self) -> Option<CatalogTrack> {
        let provider_id = self.id?;
        Some(CatalogTrack {
            provider_id,
            name: self.name,
            duration_ms: self.duration_ms,
            preview_url: self.preview_url,
            is_local: self.is_local,
            album: self.album.map(AlbumObject::into_catalog_album),
            artists: self
                .artists
                .into_iter()
                .map(ArtistObject::into_catalog_artist)
                .collect(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ArtistObject {
    id: String,
    name: String,
    #[serde(default)]
    images: Vec<ImageObject>,
}

impl ArtistObject {
    fn into_catalog_artist(self) -> CatalogArtist {
        CatalogArtist {
            provider_id: self.id,
            name: self.name,
            image_url: self.images.into_iter().next().map(|i| i.url),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AlbumObject {
    id: String,
    name: String,
    #[serde(default)]
    images: Vec<ImageObject>,
    release_date: Option<String>,
}

impl AlbumObject {
    fn into_catalog_album(self) -> CatalogAlbum {
        CatalogAlbum {
            provider_id: self.id,
            name: self.name,
            image_url: self.images.into_iter().next().map(|i| i.url),
            release_date: self.release_date,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImageObject {
    url: String,
}

#[derive(Debug, Deserialize)]
struct PlaylistObject {
    id: String,
    name: String,
    tracks: Option<PlaylistTracksRef>,
    external_urls: Option<ExternalUrls>,
}

#[derive(Debug, Deserialize)]
struct PlaylistTracksRef {
    total: u32,
}

#[derive(Debug, Deserialize)]
struct ExternalUrls {
    spotify: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistTrackItem {
    track: Option<TrackObject>,
}

#[derive(Debug, Deserialize)]
struct TokenRefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
}

#[derive(Debug, Default, Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
}

fn deserialize_rfc3339<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| Utc.from_utc_datetime(&dt.naive_utc()))
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_base64(extra: usize) -> String {
        let mut raw = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        raw.extend(std::iter::repeat(0u8).take(extra));
        base64::engine::general_purpose::STANDARD.encode(raw)
    }

    #[test]
    fn cover_image_accepts_png_and_jpeg() {
        assert_eq!(
            validate_cover_image(&png_base64(16)).unwrap(),
            CoverImageFormat::Png
        );

        let jpeg =
            base64::engine::general_purpose::STANDARD.encode([0xFF, 0xD8, 0xFF, 0xE0, 0x00]);
        assert_eq!(
            validate_cover_image(&jpeg).unwrap(),
            CoverImageFormat::Jpeg
        );
    }

    #[test]
    fn cover_image_rejects_oversize_and_unknown_formats() {
        assert!(matches!(
            validate_cover_image(&png_base64(COVER_IMAGE_MAX_BYTES)),
            Err(ProviderError::InvalidInput(_))
        ));

        let gif = base64::engine::general_purpose::STANDARD.encode(b"GIF89a....");
        assert!(matches!(
            validate_cover_image(&gif),
            Err(ProviderError::InvalidInput(_))
        ));
    }

    #[test]
    fn batch_caps_are_rejected_locally() {
        let ids: Vec<String> = (0..51).map(|i| format!("id{}", i)).collect();
        assert!(matches!(
            SpotifyClient::check_batch(&ids, TRACK_LOOKUP_MAX, "track"),
            Err(ProviderError::InvalidInput(_))
        ));
        assert!(SpotifyClient::check_batch(&ids[..50], TRACK_LOOKUP_MAX, "track").is_ok());
    }
}
