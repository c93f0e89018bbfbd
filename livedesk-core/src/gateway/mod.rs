//! Connection gateway: WebSocket upgrade endpoints for the three roles and
//! the read-only REST support surface.

pub mod api;
pub mod handlers;
pub mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use livedesk_common::traits::{ActivityLogRepository, CannedResponseRepository};

use crate::auth::Authenticator;
use crate::broker::Broker;
use crate::config::CoreConfig;
use crate::registry::PresenceRegistry;
use crate::services::{MessageService, SessionService};

/// Shared state for every gateway route.
#[derive(Clone)]
pub struct AppState {
    pub session_service: Arc<SessionService>,
    pub message_service: Arc<MessageService>,
    pub broker: Broker,
    pub registry: Arc<PresenceRegistry>,
    pub authenticator: Arc<dyn Authenticator>,
    pub canned: Arc<dyn CannedResponseRepository>,
    pub activity: Arc<dyn ActivityLogRepository>,
    pub config: CoreConfig,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/customer", get(ws::customer_upgrade))
        .route("/ws/cs", get(ws::cs_upgrade))
        .route("/ws/admin", get(ws::admin_upgrade))
        .route("/api/chat/init", post(api::chat_init))
        .route("/api/chat/session/{customer_token}", get(api::chat_session))
        .route("/api/chat/rating", post(api::chat_rating))
        .route("/api/cs/chats", get(api::cs_active_chats))
        .route("/api/cs/queue", get(api::cs_queue))
        .route("/api/cs/history", get(api::cs_history))
        .route("/api/cs/agents", get(api::cs_agents))
        .route("/api/cs/canned-responses", get(api::cs_canned_responses))
        .route("/api/admin/stats", get(api::admin_stats))
        .route("/api/admin/activity", get(api::admin_activity))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
