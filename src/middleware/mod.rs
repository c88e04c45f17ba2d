pub mod cors;
pub mod cron;
pub mod session;

pub use cors::create_cors_layer;
pub use cron::{cron_secret_middleware, CronGuard};
pub use session::{session_middleware, AuthenticatedUser, SessionService};
