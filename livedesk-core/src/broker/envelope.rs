//! The JSON wire envelope shared by both directions:
//! `{ "event": "...", "data": {...}, "timestamp": <unix-ms>, "request_id": "<opt>" }`.
//!
//! The core never sends raw strings; every outbound frame is an `Envelope`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Envelope {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
            timestamp: Utc::now().timestamp_millis(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}

/// Server -> client event names. These are the external wire contract.
pub mod events {
    pub const CHAT_STARTED: &str = "chat:started";
    pub const CHAT_ASSIGNED: &str = "chat:assigned";
    pub const CHAT_MESSAGE: &str = "chat:message";
    pub const CHAT_CUSTOMER_TYPING: &str = "chat:customer_typing";
    pub const CHAT_CS_TYPING: &str = "chat:cs_typing";
    pub const CHAT_QUEUE_POSITION: &str = "chat:queue_position";
    pub const CHAT_TRANSFERRED: &str = "chat:transferred";
    pub const CHAT_TRANSFERRED_IN: &str = "chat:transferred_in";
    pub const CHAT_TRANSFERRED_OUT: &str = "chat:transferred_out";
    pub const CHAT_RESOLVED: &str = "chat:resolved";
    pub const CHAT_ENDED: &str = "chat:ended";
    pub const CHAT_CUSTOMER_LEFT: &str = "chat:customer_left";
    pub const CHAT_NEW_ASSIGNED: &str = "chat:new_assigned";
    pub const QUEUE_UPDATE: &str = "queue:update";
    pub const QUEUE_NEW_CHAT: &str = "queue:new_chat";
    pub const CS_STATUS_CHANGED: &str = "cs:status_changed";
    pub const STATS_UPDATE: &str = "stats:update";
    pub const SYSTEM_ERROR: &str = "system:error";
    pub const SESSION_RESTORED: &str = "session:restored";
}
