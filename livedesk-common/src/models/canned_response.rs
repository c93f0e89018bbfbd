use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A reusable reply snippet agents can paste into a chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CannedResponse {
    pub canned_response_id: Uuid,
    pub title: String,
    pub content: String,
    /// Short trigger text, e.g. "/hours".
    pub shortcut: Option<String>,
    pub created_by: Option<Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl CannedResponse {
    pub fn new(title: String, content: String, created_by: Option<Uuid>) -> Self {
        Self {
            canned_response_id: Uuid::new_v4(),
            title,
            content,
            shortcut: None,
            created_by,
            is_active: true,
            created_at: Utc::now(),
        }
    }
}
