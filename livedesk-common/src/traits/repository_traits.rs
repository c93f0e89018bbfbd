use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Error;
use crate::models::{
    ActivityLogEntry, AgentPresence, AgentState, CannedResponse, ChatMessage, ChatSession, User,
};

/// Result of an assignment transaction: the now-active session, the agent's
/// presence row after the capacity increment, and the system message that
/// rode the same transaction.
#[derive(Debug, Clone)]
pub struct AssignmentRecord {
    pub session: ChatSession,
    pub agent: AgentPresence,
    pub system_message: ChatMessage,
}

/// Result of a transfer transaction. Source capacity released, target
/// reserved, session re-pointed, all atomic.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub session: ChatSession,
    pub from_agent: AgentPresence,
    pub to_agent: AgentPresence,
    pub system_message: ChatMessage,
}

/// Result of a terminal transition (resolve or abandon). `released` is the
/// presence row after the capacity decrement, when the session was active.
#[derive(Debug, Clone)]
pub struct ClosureRecord {
    pub session: ChatSession,
    pub released: Option<AgentPresence>,
    pub system_message: ChatMessage,
}

/// Durable record of chat sessions. All multi-row operations are single
/// transactions; racing claims are resolved here, not above.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, session: &ChatSession) -> Result<(), Error>;

    async fn get(&self, session_id: Uuid) -> Result<Option<ChatSession>, Error>;

    async fn get_by_token(&self, token: &str) -> Result<Option<ChatSession>, Error>;

    /// Waiting sessions in queue order (`created_at`, ties by id).
    async fn waiting_ordered(&self) -> Result<Vec<ChatSession>, Error>;

    async fn active_for_agent(&self, agent_id: Uuid) -> Result<Vec<ChatSession>, Error>;

    /// Count of sessions currently `active` and assigned to the agent.
    /// Used to audit the cached capacity counter.
    async fn active_count_for_agent(&self, agent_id: Uuid) -> Result<i64, Error>;

    /// Terminal sessions, newest first, paged.
    async fn history(&self, limit: i64, offset: i64) -> Result<Vec<ChatSession>, Error>;

    /// Move a waiting session to `active` for `agent_id`, incrementing the
    /// agent's `current_chats`, in one transaction. Fails with
    /// `AlreadyAssigned` if the session is no longer waiting, `NotOnline` /
    /// `AtCapacity` if the agent cannot take it. The system message is
    /// appended inside the same transaction.
    async fn assign(
        &self,
        session_id: Uuid,
        agent_id: Uuid,
        system_note: &str,
    ) -> Result<AssignmentRecord, Error>;

    /// Re-point an active session from `from_agent` to `to_agent`,
    /// releasing and reserving capacity atomically. Fails with
    /// `NotAssigned` if `from_agent` does not own the session, and
    /// `TargetNotOnline` / `TargetAtCapacity` on an unavailable target.
    async fn transfer(
        &self,
        session_id: Uuid,
        from_agent: Uuid,
        to_agent: Uuid,
        system_note: &str,
    ) -> Result<TransferRecord, Error>;

    /// Resolve an active session owned by `agent_id`, releasing capacity.
    async fn resolve(
        &self,
        session_id: Uuid,
        agent_id: Uuid,
        notes: Option<&str>,
        system_note: &str,
    ) -> Result<ClosureRecord, Error>;

    /// Abandon a waiting or active session (customer leave or idle reaper),
    /// releasing capacity if it was active.
    async fn abandon(&self, session_id: Uuid, system_note: &str) -> Result<ClosureRecord, Error>;

    /// Record a rating; only legal while `resolved`.
    async fn set_rating(
        &self,
        session_id: Uuid,
        rating: i32,
        feedback: Option<&str>,
    ) -> Result<ChatSession, Error>;

    /// Waiting/active sessions whose last activity (last message, or
    /// creation when no messages) predates `cutoff`.
    async fn idle_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<ChatSession>, Error>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Append one message. Fails if the session is terminal or missing, so
    /// no message can land after `resolved_at`.
    async fn append(&self, message: &ChatMessage) -> Result<(), Error>;

    /// Full ordered transcript for a session.
    async fn for_session(&self, session_id: Uuid) -> Result<Vec<ChatMessage>, Error>;

    /// Timestamp of the newest message, if any.
    async fn last_activity(&self, session_id: Uuid) -> Result<Option<DateTime<Utc>>, Error>;
}

#[async_trait]
pub trait PresenceRepository: Send + Sync {
    async fn upsert(&self, presence: &AgentPresence) -> Result<(), Error>;

    async fn get(&self, user_id: Uuid) -> Result<Option<AgentPresence>, Error>;

    async fn all(&self) -> Result<Vec<AgentPresence>, Error>;

    /// Set an agent's state, creating the row with `max_chats_default` if it
    /// does not exist yet. Returns the updated row.
    async fn set_state(
        &self,
        user_id: Uuid,
        state: AgentState,
        max_chats_default: i32,
    ) -> Result<AgentPresence, Error>;

    /// Shutdown flush: everyone goes offline.
    async fn set_all_offline(&self) -> Result<(), Error>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create(&self, user: &User) -> Result<(), Error>;
    async fn get(&self, user_id: Uuid) -> Result<Option<User>, Error>;
    async fn get_by_username(&self, username: &str) -> Result<Option<User>, Error>;
    async fn list_active(&self) -> Result<Vec<User>, Error>;
}

#[async_trait]
pub trait CannedResponseRepository: Send + Sync {
    async fn create(&self, canned: &CannedResponse) -> Result<(), Error>;
    async fn get(&self, id: Uuid) -> Result<Option<CannedResponse>, Error>;
    async fn list_active(&self) -> Result<Vec<CannedResponse>, Error>;
    async fn deactivate(&self, id: Uuid) -> Result<(), Error>;
}

#[async_trait]
pub trait ActivityLogRepository: Send + Sync {
    async fn insert(&self, entry: &ActivityLogEntry) -> Result<(), Error>;
    async fn recent(&self, limit: i64) -> Result<Vec<ActivityLogEntry>, Error>;
}
