// livedesk-core/src/repositories/postgres/mod.rs

pub mod activity_log;
pub mod canned_responses;
pub mod messages;
pub mod presence;
pub mod sessions;
pub mod users;

pub use activity_log::PostgresActivityLogRepository;
pub use canned_responses::PostgresCannedResponseRepository;
pub use messages::PostgresMessageRepository;
pub use presence::PostgresPresenceRepository;
pub use sessions::PostgresSessionRepository;
pub use users::PostgresUserRepository;
