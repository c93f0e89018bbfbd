use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// Upper bound on message content length, after trimming.
pub const MAX_MESSAGE_LEN: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    Customer,
    Agent,
    System,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderType::Customer => "customer",
            SenderType::Agent => "agent",
            SenderType::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "customer" => Ok(SenderType::Customer),
            "agent" => Ok(SenderType::Agent),
            "system" => Ok(SenderType::System),
            other => Err(Error::Parse(format!("unknown sender type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "file" => Ok(MessageKind::File),
            "system" => Ok(MessageKind::System),
            other => Err(Error::Parse(format!("unknown message kind '{other}'"))),
        }
    }
}

/// A single message in a session transcript. Immutable once appended.
///
/// Messages are totally ordered within their session by
/// `(created_at, message_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub message_id: Uuid,
    pub session_id: Uuid,
    pub sender_type: SenderType,
    /// Agent user id; `None` for customer and system messages.
    pub sender_id: Option<Uuid>,
    pub content: String,
    pub kind: MessageKind,
    pub file_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn customer(session_id: Uuid, content: String, kind: MessageKind) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            session_id,
            sender_type: SenderType::Customer,
            sender_id: None,
            content,
            kind,
            file_ref: None,
            created_at: Utc::now(),
        }
    }

    pub fn agent(session_id: Uuid, agent_id: Uuid, content: String, kind: MessageKind) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            session_id,
            sender_type: SenderType::Agent,
            sender_id: Some(agent_id),
            content,
            kind,
            file_ref: None,
            created_at: Utc::now(),
        }
    }

    pub fn system(session_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            session_id,
            sender_type: SenderType::System,
            sender_id: None,
            content: content.into(),
            kind: MessageKind::System,
            file_ref: None,
            created_at: Utc::now(),
        }
    }
}

/// Trim and bounds-check inbound message content.
pub fn validate_content(raw: &str) -> Result<String, Error> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::EmptyMessage);
    }
    if trimmed.chars().count() > MAX_MESSAGE_LEN {
        return Err(Error::Parse(format!(
            "message exceeds {MAX_MESSAGE_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}
