// File: livedesk-common/src/traits/mod.rs
pub mod repository_traits;

pub use repository_traits::{
    ActivityLogRepository, AssignmentRecord, CannedResponseRepository, ClosureRecord,
    MessageRepository, PresenceRepository, SessionRepository, TransferRecord, UserRepository,
};
