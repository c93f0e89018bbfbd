//! Relays presence-registry changes onto the broker: `cs:status_changed`
//! on the queue topic so agents see peer availability, and `stats:update`
//! on the dashboards. Both are best-effort by design.

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use serde_json::json;
use tracing::debug;

use crate::broker::{events, topics, Broker, Delivery, Envelope};
use crate::registry::PresenceRegistry;

pub fn spawn_presence_fanout(
    registry: PresenceRegistry,
    broker: Broker,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut changes = registry.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                change = changes.recv() => {
                    match change {
                        Ok(presence) => {
                            broker
                                .publish(
                                    topics::QUEUE,
                                    Envelope::new(
                                        events::CS_STATUS_CHANGED,
                                        json!({
                                            "csId": presence.user_id,
                                            "status": presence.state,
                                            "currentChats": presence.current_chats,
                                            "maxChats": presence.max_chats,
                                        }),
                                    ),
                                    Delivery::BestEffort,
                                )
                                .await;

                            let agents = registry.snapshot();
                            let active: i64 =
                                agents.iter().map(|a| a.current_chats as i64).sum();
                            broker
                                .publish(
                                    topics::ADMIN_STATS,
                                    Envelope::new(
                                        events::STATS_UPDATE,
                                        json!({
                                            "activeChats": active,
                                            "agentsOnline": registry.online_count(),
                                            "agents": agents,
                                        }),
                                    ),
                                    Delivery::BestEffort,
                                )
                                .await;
                        }
                        // Presence bursts may overrun the channel; the next
                        // change carries a full snapshot anyway.
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "presence fan-out lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
