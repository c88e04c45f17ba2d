pub mod cron;
pub mod playlists;
pub mod stats;
