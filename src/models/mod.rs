pub mod auth;
pub mod catalog;
pub mod listening_event;
pub mod playlist_job;
pub mod stats;
pub mod user;

pub use auth::*;
pub use catalog::*;
pub use listening_event::*;
pub use playlist_job::*;
pub use stats::*;
pub use user::*;

/// Serde helper: 64-bit millisecond totals travel as decimal strings on the
/// wire so browser JSON parsers never lose precision.
pub mod ms_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(i64),
            Str(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(n),
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
