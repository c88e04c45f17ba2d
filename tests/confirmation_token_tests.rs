//! Confirmation token binding tests
//!
//! A creation request must reproduce the token's method parameters
//! exactly; any drift is reported field by field.

use chrono::{Duration, Utc};
use music_analytics_backend::services::confirmation::ConfirmationTokenService;
use music_analytics_backend::{PlaylistParams, ShuffleMode, Top50Term};
use uuid::Uuid;

fn service() -> ConfirmationTokenService {
    ConfirmationTokenService::new("integration-test-secret")
}

#[test]
fn token_binds_user_and_params() {
    let service = service();
    let user_id = Uuid::new_v4();
    let params = PlaylistParams::Top50 {
        term: Top50Term::Medium,
    };

    let token = service.issue(user_id, &params).unwrap();
    let claims = service.verify(&token).unwrap();

    assert_eq!(claims.user_id, user_id);
    assert_eq!(claims.params, params);
    assert!(Utc::now() - claims.issued_at < Duration::seconds(5));
}

#[test]
fn every_shuffle_field_is_bound() {
    let service = service();
    let issued = PlaylistParams::Shuffle {
        source_playlist_id: "37i9dQZF1DXcBWIGoYBM5M".to_string(),
        shuffle_mode: ShuffleMode::Smart,
    };
    let token = service.issue(Uuid::new_v4(), &issued).unwrap();
    let claims = service.verify(&token).unwrap();

    // Identical params: no mismatch
    assert!(claims.params.mismatched_fields(&issued).is_empty());

    // One character off in the playlist id
    let drifted = PlaylistParams::Shuffle {
        source_playlist_id: "37i9dQZF1DXcBWIGoYBM5X".to_string(),
        shuffle_mode: ShuffleMode::Smart,
    };
    assert_eq!(
        claims.params.mismatched_fields(&drifted),
        vec!["source_playlist_id".to_string()]
    );

    // Mode flipped
    let flipped = PlaylistParams::Shuffle {
        source_playlist_id: "37i9dQZF1DXcBWIGoYBM5M".to_string(),
        shuffle_mode: ShuffleMode::Standard,
    };
    assert_eq!(
        claims.params.mismatched_fields(&flipped),
        vec!["shuffle_mode".to_string()]
    );
}

#[test]
fn recent_params_report_each_drifted_field() {
    let service = service();
    let end = Utc::now();
    let start = end - Duration::days(90);
    let issued = PlaylistParams::Recent {
        k_value: 200,
        start_date: Some(start),
        end_date: Some(end),
    };
    let token = service.issue(Uuid::new_v4(), &issued).unwrap();
    let claims = service.verify(&token).unwrap();

    let drifted = PlaylistParams::Recent {
        k_value: 201,
        start_date: Some(start - Duration::seconds(1)),
        end_date: Some(end),
    };
    assert_eq!(
        claims.params.mismatched_fields(&drifted),
        vec!["k_value".to_string(), "start_date".to_string()]
    );
}

#[test]
fn method_substitution_is_rejected_wholesale() {
    let service = service();
    let issued = PlaylistParams::Top50 {
        term: Top50Term::AllTime,
    };
    let token = service.issue(Uuid::new_v4(), &issued).unwrap();
    let claims = service.verify(&token).unwrap();

    let substituted = PlaylistParams::Shuffle {
        source_playlist_id: "pl".to_string(),
        shuffle_mode: ShuffleMode::Standard,
    };
    assert_eq!(
        claims.params.mismatched_fields(&substituted),
        vec!["method".to_string()]
    );
}

#[test]
fn same_token_always_derives_the_same_idempotency_key() {
    let service = service();
    let token = service
        .issue(
            Uuid::new_v4(),
            &PlaylistParams::Top50 {
                term: Top50Term::Short,
            },
        )
        .unwrap();

    let key_a = ConfirmationTokenService::idempotency_key(&token);
    let key_b = ConfirmationTokenService::idempotency_key(&token);
    assert_eq!(key_a, key_b);
    assert_eq!(key_a.len(), 32);
}

#[test]
fn token_from_another_service_instance_with_same_secret_verifies() {
    let issuing = ConfirmationTokenService::new("shared-secret");
    let verifying = ConfirmationTokenService::new("shared-secret");

    let token = issuing
        .issue(
            Uuid::new_v4(),
            &PlaylistParams::Top50 {
                term: Top50Term::Long,
            },
        )
        .unwrap();
    assert!(verifying.verify(&token).is_ok());
}
