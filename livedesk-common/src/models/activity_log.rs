use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit entry for session lifecycle actions (assigned, transferred,
/// resolved, abandoned, force-assigned).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLogEntry {
    pub activity_id: Uuid,
    /// Acting agent; `None` for system actors (dispatcher, idle reaper).
    pub actor_id: Option<Uuid>,
    pub action: String,
    pub session_id: Option<Uuid>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ActivityLogEntry {
    pub fn new(
        actor_id: Option<Uuid>,
        action: &str,
        session_id: Option<Uuid>,
        detail: Option<&str>,
    ) -> Self {
        Self {
            activity_id: Uuid::new_v4(),
            actor_id,
            action: action.to_string(),
            session_id,
            detail: detail.map(String::from),
            created_at: Utc::now(),
        }
    }
}
