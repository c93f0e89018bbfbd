//! Queue and dashboard fan-out helpers.
//!
//! Queue positions and stats are best-effort: a congested dashboard must
//! never stall chat delivery.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use livedesk_common::models::{AgentPresence, ChatSession};
use livedesk_common::traits::SessionRepository;
use livedesk_common::Error;

use crate::broker::{events, topics, Broker, Delivery, Envelope};
use crate::registry::PresenceRegistry;

/// Payload of `stats:update` and `GET /api/admin/stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub waiting: usize,
    pub active_chats: i64,
    pub agents_online: usize,
    pub agents: Vec<AgentPresence>,
}

pub fn snapshot(waiting: &[ChatSession], registry: &PresenceRegistry) -> StatsSnapshot {
    let agents = registry.snapshot();
    let active_chats = agents.iter().map(|a| a.current_chats as i64).sum();
    StatsSnapshot {
        waiting: waiting.len(),
        active_chats,
        agents_online: registry.online_count(),
        agents,
    }
}

/// 1-indexed position of a session in the waiting queue.
pub fn position_of(waiting: &[ChatSession], session_id: Uuid) -> Option<usize> {
    waiting
        .iter()
        .position(|s| s.session_id == session_id)
        .map(|i| i + 1)
}

/// Re-publish queue state after any queue mutation: `queue:update` to the
/// agents, a fresh `chat:queue_position` to every waiting customer, and
/// `stats:update` to the dashboards.
pub async fn publish_queue_state(
    sessions: &Arc<dyn SessionRepository>,
    registry: &PresenceRegistry,
    broker: &Broker,
) -> Result<(), Error> {
    let waiting = sessions.waiting_ordered().await?;

    broker
        .publish(
            topics::QUEUE,
            Envelope::new(
                events::QUEUE_UPDATE,
                json!({
                    "waiting": waiting.len(),
                    "sessionIds": waiting.iter().map(|s| s.session_id).collect::<Vec<_>>(),
                }),
            ),
            Delivery::BestEffort,
        )
        .await;

    for (idx, session) in waiting.iter().enumerate() {
        broker
            .publish(
                &topics::session(session.session_id),
                Envelope::new(
                    events::CHAT_QUEUE_POSITION,
                    json!({ "sessionId": session.session_id, "position": idx + 1 }),
                ),
                Delivery::BestEffort,
            )
            .await;
    }

    let stats = snapshot(&waiting, registry);
    broker
        .publish(
            topics::ADMIN_STATS,
            Envelope::new(events::STATS_UPDATE, serde_json::to_value(&stats)?),
            Delivery::BestEffort,
        )
        .await;

    Ok(())
}

/// Fire-and-forget wrapper; queue fan-out must not fail the caller.
pub async fn publish_queue_state_quiet(
    sessions: &Arc<dyn SessionRepository>,
    registry: &PresenceRegistry,
    broker: &Broker,
) {
    if let Err(e) = publish_queue_state(sessions, registry, broker).await {
        warn!("queue state fan-out failed: {e}");
    }
}
