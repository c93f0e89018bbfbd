//! livedesk-server/src/context.rs
//!
//! Builds the global server context: database, repositories, registry,
//! broker, and the service layer, wired per the CLI arguments.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use livedesk_common::traits::{
    ActivityLogRepository, CannedResponseRepository, MessageRepository, PresenceRepository,
    SessionRepository, UserRepository,
};
use livedesk_core::auth::{Authenticator, JwtAuthenticator};
use livedesk_core::broker::Broker;
use livedesk_core::config::CoreConfig;
use livedesk_core::db::Database;
use livedesk_core::gateway::AppState;
use livedesk_core::registry::PresenceRegistry;
use livedesk_core::repositories::postgres::{
    PostgresActivityLogRepository, PostgresCannedResponseRepository, PostgresMessageRepository,
    PostgresPresenceRepository, PostgresSessionRepository, PostgresUserRepository,
};
use livedesk_core::services::{DispatchHandle, Dispatcher, MessageService, SessionService};
use livedesk_core::Error;

use crate::Args;

pub struct ServerContext {
    pub db: Database,
    pub broker: Broker,
    pub registry: Arc<PresenceRegistry>,
    pub session_service: Arc<SessionService>,
    pub message_service: Arc<MessageService>,
    pub dispatcher: Dispatcher,
    pub app_state: AppState,
    pub config: CoreConfig,
}

impl ServerContext {
    pub async fn new(args: &Args) -> Result<Self, Error> {
        let db = Database::new(&args.database_url).await?;
        db.migrate().await?;

        let pool = db.pool().clone();
        let sessions: Arc<dyn SessionRepository> =
            Arc::new(PostgresSessionRepository::new(pool.clone()));
        let messages: Arc<dyn MessageRepository> =
            Arc::new(PostgresMessageRepository::new(pool.clone()));
        let presence: Arc<dyn PresenceRepository> =
            Arc::new(PostgresPresenceRepository::new(pool.clone()));
        let users: Arc<dyn UserRepository> = Arc::new(PostgresUserRepository::new(pool.clone()));
        let canned: Arc<dyn CannedResponseRepository> =
            Arc::new(PostgresCannedResponseRepository::new(pool.clone()));
        let activity: Arc<dyn ActivityLogRepository> =
            Arc::new(PostgresActivityLogRepository::new(pool));

        let config = CoreConfig {
            max_chats_per_cs: args.max_chats_per_cs,
            chat_idle_timeout: Duration::from_secs(args.chat_idle_timeout_seconds),
            reaper_interval: Duration::from_secs(args.reaper_interval_seconds),
            auto_assign_enabled: args.auto_assign_enabled,
            store_deadline: Duration::from_secs(5),
        };

        let registry = Arc::new(PresenceRegistry::new());
        let broker = Broker::new();
        let dispatch = DispatchHandle::new();

        let session_service = Arc::new(SessionService::new(
            sessions.clone(),
            messages.clone(),
            presence,
            users.clone(),
            activity.clone(),
            registry.clone(),
            broker.clone(),
            dispatch.clone(),
            config.clone(),
        ));
        let message_service = Arc::new(MessageService::new(
            sessions,
            messages,
            broker.clone(),
            config.clone(),
        ));

        // The capacity mirror starts from what the store remembers.
        session_service.rehydrate_registry().await?;
        info!("presence registry rehydrated");

        let authenticator: Arc<dyn Authenticator> = Arc::new(JwtAuthenticator::new(
            &args.jwt_secret,
            users,
            Duration::from_secs(args.jwt_expires_in),
        ));

        let dispatcher = Dispatcher::new(session_service.clone(), dispatch);

        let app_state = AppState {
            session_service: session_service.clone(),
            message_service: message_service.clone(),
            broker: broker.clone(),
            registry: registry.clone(),
            authenticator,
            canned,
            activity,
            config: config.clone(),
        };

        Ok(Self {
            db,
            broker,
            registry,
            session_service,
            message_service,
            dispatcher,
            app_state,
            config,
        })
    }
}
