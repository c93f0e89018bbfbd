// File: livedesk-common/src/models/mod.rs
pub mod activity_log;
pub mod canned_response;
pub mod message;
pub mod presence;
pub mod session;
pub mod user;

pub use activity_log::ActivityLogEntry;
pub use canned_response::CannedResponse;
pub use message::{ChatMessage, MessageKind, SenderType, MAX_MESSAGE_LEN};
pub use presence::{AgentPresence, AgentState};
pub use session::{ChatSession, SessionStatus};
pub use user::{StaffRole, User};
