use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// Lifecycle state of a chat session.
///
/// `Resolved` and `Abandoned` are terminal: once entered, `resolved_at` is
/// set and no further transition or message append is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Waiting,
    Active,
    Resolved,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Active => "active",
            SessionStatus::Resolved => "resolved",
            SessionStatus::Abandoned => "abandoned",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "waiting" => Ok(SessionStatus::Waiting),
            "active" => Ok(SessionStatus::Active),
            "resolved" => Ok(SessionStatus::Resolved),
            "abandoned" => Ok(SessionStatus::Abandoned),
            other => Err(Error::Parse(format!("unknown session status '{other}'"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Resolved | SessionStatus::Abandoned)
    }
}

/// A single customer conversation, from `start_chat` to a terminal state.
///
/// The `customer_token` is the sole credential an anonymous customer holds to
/// resume the session across reconnects; it is unique per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub session_id: Uuid,
    pub customer_token: String,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub source_url: Option<String>,
    pub status: SessionStatus,
    pub assigned_agent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolve_notes: Option<String>,
    pub rating: Option<i32>,
    pub feedback: Option<String>,
}

impl ChatSession {
    pub fn new(
        customer_token: String,
        customer_name: Option<String>,
        customer_email: Option<String>,
        source_url: Option<String>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            customer_token,
            customer_name,
            customer_email,
            source_url,
            status: SessionStatus::Waiting,
            assigned_agent_id: None,
            created_at: Utc::now(),
            assigned_at: None,
            resolved_at: None,
            resolve_notes: None,
            rating: None,
            feedback: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
