use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Online,
    Busy,
    Offline,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Online => "online",
            AgentState::Busy => "busy",
            AgentState::Offline => "offline",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "online" => Ok(AgentState::Online),
            "busy" => Ok(AgentState::Busy),
            "offline" => Ok(AgentState::Offline),
            other => Err(Error::Parse(format!("unknown agent state '{other}'"))),
        }
    }
}

/// An agent's presence and concurrent-chat capacity.
///
/// Invariant: `0 <= current_chats <= max_chats`. The row in the store is
/// authoritative; the in-process registry mirrors it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPresence {
    pub user_id: Uuid,
    pub state: AgentState,
    pub current_chats: i32,
    pub max_chats: i32,
    pub last_active_at: DateTime<Utc>,
}

impl AgentPresence {
    pub fn offline(user_id: Uuid, max_chats: i32) -> Self {
        Self {
            user_id,
            state: AgentState::Offline,
            current_chats: 0,
            max_chats,
            last_active_at: Utc::now(),
        }
    }

    /// An agent can take another chat iff online and below its cap.
    pub fn is_available(&self) -> bool {
        self.state == AgentState::Online && self.current_chats < self.max_chats
    }
}
