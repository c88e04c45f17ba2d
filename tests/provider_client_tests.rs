//! Provider client tests against a mock HTTP server
//!
//! Verifies the response-to-taxonomy mapping and the local batch caps
//! without touching the real provider API.

use music_analytics_backend::config::ProviderSettings;
use music_analytics_backend::services::provider::{ProviderApi, SpotifyClient};
use music_analytics_backend::{ProviderError, Term};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> SpotifyClient {
    let settings = ProviderSettings {
        client_id: "test_client_id".to_string(),
        client_secret: "test_client_secret".to_string(),
        redirect_uri: "http://localhost/callback".to_string(),
        api_base_url: server.uri(),
        accounts_base_url: server.uri(),
    };
    SpotifyClient::new(&settings).expect("client builds")
}

fn track_json(id: &str, artist_id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": format!("Track {}", id),
        "duration_ms": 215_000,
        "preview_url": null,
        "is_local": false,
        "artists": [{ "id": artist_id, "name": format!("Artist {}", artist_id), "images": [] }],
        "album": {
            "id": format!("al_{}", id),
            "name": "Album",
            "images": [{ "url": "https://img.example/a.jpg" }],
            "release_date": "2024-01-01"
        }
    })
}

#[tokio::test]
async fn recently_played_parses_items_and_cursor_timestamps() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/player/recently-played"))
        .and(query_param("limit", "50"))
        .and(query_param("after", "1700000000000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                { "track": track_json("t1", "a1"), "played_at": "2024-01-15T10:30:00.000Z" },
                { "track": track_json("t2", "a2"), "played_at": "2024-01-15T10:26:12.000Z" }
            ]
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let page = client
        .recently_played("token", Some(1_700_000_000_000), 50)
        .await
        .expect("page parses");

    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].track.provider_id, "t1");
    assert_eq!(page.items[0].track.duration_ms, 215_000);
    assert_eq!(page.items[0].track.artists[0].provider_id, "a1");
    assert_eq!(
        page.items[0].track.album.as_ref().unwrap().provider_id,
        "al_t1"
    );
}

#[tokio::test]
async fn status_codes_map_to_the_fixed_taxonomy() {
    for (status, expect_kind) in [
        (401, "unauthenticated"),
        (403, "forbidden"),
        (500, "down"),
        (503, "down"),
        (404, "api"),
    ] {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me/top/tracks"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .top_tracks("token", Term::Short, 50)
            .await
            .expect_err("must map to an error");

        match (expect_kind, err) {
            ("unauthenticated", ProviderError::Unauthenticated) => {}
            ("forbidden", ProviderError::Forbidden) => {}
            ("down", ProviderError::ProviderDown { status: s }) => {
                assert_eq!(s, status);
            }
            ("api", ProviderError::Api { status: s }) => assert_eq!(s, status),
            (expected, got) => panic!("status {}: expected {}, got {:?}", status, expected, got),
        }
    }
}

#[tokio::test]
async fn rate_limit_reads_retry_after_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/top/artists"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "120"))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .top_artists("token", Term::Long, 50)
        .await
        .expect_err("429 maps to RateLimited");
    assert!(matches!(
        err,
        ProviderError::RateLimited {
            retry_after_seconds: 120
        }
    ));
}

#[tokio::test]
async fn rate_limit_defaults_to_sixty_seconds_without_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/top/artists"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .top_artists("token", Term::Medium, 50)
        .await
        .expect_err("429 maps to RateLimited");
    assert!(matches!(
        err,
        ProviderError::RateLimited {
            retry_after_seconds: 60
        }
    ));
}

#[tokio::test]
async fn oversized_batches_are_rejected_before_any_request() {
    let server = MockServer::start().await;
    // No mock mounted: a network call would fail the test with Transport

    let client = client_for(&server);

    let too_many_tracks: Vec<String> = (0..51).map(|i| format!("t{}", i)).collect();
    assert!(matches!(
        client.tracks("token", &too_many_tracks).await,
        Err(ProviderError::InvalidInput(_))
    ));

    let too_many_albums: Vec<String> = (0..21).map(|i| format!("al{}", i)).collect();
    assert!(matches!(
        client.albums("token", &too_many_albums).await,
        Err(ProviderError::InvalidInput(_))
    ));

    let too_many_uris: Vec<String> = (0..101).map(|i| format!("spotify:track:t{}", i)).collect();
    assert!(matches!(
        client.add_tracks("token", "pl1", &too_many_uris).await,
        Err(ProviderError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn refresh_distinguishes_revocation_from_other_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Refresh token revoked"
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .refresh_access_token("revoked-token")
        .await
        .expect_err("invalid_grant is an error");
    assert!(matches!(err, ProviderError::GrantRevoked));
}

#[tokio::test]
async fn refresh_returns_rotated_token_when_present() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh-access",
            "refresh_token": "rotated-refresh",
            "expires_in": 3600,
            "token_type": "Bearer"
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let refreshed = client
        .refresh_access_token("old-refresh")
        .await
        .expect("refresh succeeds");
    assert_eq!(refreshed.access_token, "fresh-access");
    assert_eq!(refreshed.refresh_token.as_deref(), Some("rotated-refresh"));
    assert_eq!(refreshed.expires_in_seconds, 3600);
}

#[tokio::test]
async fn create_playlist_returns_provider_id_and_url() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/users/user42/playlists"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "pl_new",
            "name": "My Mix",
            "external_urls": { "spotify": "https://open.spotify.com/playlist/pl_new" }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let created = client
        .create_playlist("token", "user42", "My Mix", false)
        .await
        .expect("create succeeds");
    assert_eq!(created.provider_id, "pl_new");
    assert_eq!(
        created.url.as_deref(),
        Some("https://open.spotify.com/playlist/pl_new")
    );
}

#[tokio::test]
async fn local_tracks_are_dropped_from_playlist_pages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/playlists/pl1/tracks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                { "track": track_json("t1", "a1") },
                { "track": { "id": null, "name": "Local file", "duration_ms": 100, "is_local": true } },
                { "track": null }
            ],
            "total": 3
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let page = client
        .playlist_tracks("token", "pl1", 100, 0)
        .await
        .expect("page parses");
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].provider_id, "t1");
}
