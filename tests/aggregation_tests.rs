//! Local-day bucketing properties across timezones

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use music_analytics_backend::services::aggregate::local_day_bucket;
use rstest::rstest;

fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

#[rstest]
#[case("UTC")]
#[case("America/New_York")]
#[case("Europe/Berlin")]
#[case("Asia/Tokyo")]
#[case("Australia/Sydney")]
#[case("Pacific/Kiritimati")]
fn timestamps_on_one_local_day_share_a_bucket(#[case] tz_name: &str) {
    let tz: Tz = tz_name.parse().unwrap();

    // Walk a full local day in 15-minute steps: every step must bucket to
    // the same instant as local midnight
    let local_midnight = tz.with_ymd_and_hms(2025, 7, 10, 0, 0, 0).unwrap();
    let expected = local_midnight.with_timezone(&Utc);

    for quarter_hour in 0..(24 * 4) {
        let instant =
            local_midnight.with_timezone(&Utc) + chrono::Duration::minutes(quarter_hour * 15);
        assert_eq!(
            local_day_bucket(instant, &tz),
            expected,
            "step {} in {}",
            quarter_hour,
            tz_name
        );
    }
}

#[rstest]
#[case("America/New_York")]
#[case("Asia/Tokyo")]
fn consecutive_local_days_get_distinct_buckets(#[case] tz_name: &str) {
    let tz: Tz = tz_name.parse().unwrap();
    let day_one = tz.with_ymd_and_hms(2025, 7, 10, 12, 0, 0).unwrap();
    let day_two = tz.with_ymd_and_hms(2025, 7, 11, 12, 0, 0).unwrap();

    let bucket_one = local_day_bucket(day_one.with_timezone(&Utc), &tz);
    let bucket_two = local_day_bucket(day_two.with_timezone(&Utc), &tz);
    assert_ne!(bucket_one, bucket_two);
    assert_eq!(bucket_two - bucket_one, chrono::Duration::hours(24));
}

#[test]
fn utc_day_boundary_splits_by_local_calendar_not_utc() {
    let tz: Tz = "America/Los_Angeles".parse().unwrap();

    // 23:50 UTC and 00:10 UTC the next day are the same afternoon in LA
    let before_utc_midnight = utc(2025, 7, 10, 23, 50);
    let after_utc_midnight = utc(2025, 7, 11, 0, 10);
    assert_eq!(
        local_day_bucket(before_utc_midnight, &tz),
        local_day_bucket(after_utc_midnight, &tz)
    );
}

#[test]
fn dst_transition_days_still_bucket_consistently() {
    // US spring-forward: 2025-03-09 02:00 EST jumps to 03:00 EDT
    let tz: Tz = "America/New_York".parse().unwrap();

    let early = utc(2025, 3, 9, 6, 0); // 01:00 EST
    let late = utc(2025, 3, 9, 20, 0); // 16:00 EDT
    assert_eq!(local_day_bucket(early, &tz), local_day_bucket(late, &tz));

    let next_day = utc(2025, 3, 10, 20, 0);
    assert_ne!(local_day_bucket(early, &tz), local_day_bucket(next_day, &tz));
}
