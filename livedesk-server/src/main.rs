// =============================================================================
// livedesk-server/src/main.rs
//   Single #[tokio::main] for the chat broker: gateway, dispatcher, reaper.
// =============================================================================

use clap::Parser;
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use livedesk_core::gateway;
use livedesk_core::tasks::{spawn_idle_reaper, spawn_presence_fanout};

mod context;
use context::ServerContext;

#[derive(Parser, Debug, Clone)]
#[command(name = "livedesk")]
#[command(author, version, about = "livedesk - real-time customer-service chat broker")]
pub struct Args {
    /// Address the gateway binds to
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Postgres connection URL
    #[arg(long, env = "DATABASE_URL", default_value = "postgres://livedesk@localhost:5432/livedesk")]
    pub database_url: String,

    /// HS256 secret for validating staff bearer tokens
    #[arg(long, env = "JWT_SECRET", default_value = "change-me")]
    pub jwt_secret: String,

    /// Maximum accepted staff token age, in seconds
    #[arg(long, env = "JWT_EXPIRES_IN", default_value_t = 86400)]
    pub jwt_expires_in: u64,

    /// Default concurrent chat cap per agent
    #[arg(long, default_value_t = 5)]
    pub max_chats_per_cs: i32,

    /// Seconds of message silence before a session is abandoned
    #[arg(long, default_value_t = 1800)]
    pub chat_idle_timeout_seconds: u64,

    /// How often the idle reaper scans, in seconds
    #[arg(long, default_value_t = 60)]
    pub reaper_interval_seconds: u64,

    /// Automatically place waiting sessions on available agents
    #[arg(long, default_value = "true", action = clap::ArgAction::Set)]
    pub auto_assign_enabled: bool,

    /// Logging level: "info", "warn", "debug", "error", or "trace"
    #[arg(long = "log-level", short = 'L', default_value = "info", value_parser = ["info", "warn", "debug", "error", "trace"])]
    pub log_level: String,
}

fn init_tracing(level: &str) {
    let default_filter = format!("livedesk={0},tower_http={0}", level);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let sub = tracing_subscriber::fmt().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(sub).expect("Failed to set global subscriber");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    info!(
        "livedesk starting. host={} port={} auto_assign={}",
        args.host, args.port, args.auto_assign_enabled
    );

    if let Err(e) = run_server(args).await {
        error!("Server error: {:?}", e);
    }

    info!("Main finished. Goodbye!");
    Ok(())
}

async fn run_server(args: Args) -> Result<(), anyhow::Error> {
    let ctx = ServerContext::new(&args).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher_handle = ctx.dispatcher.handle();
    let dispatcher_task = ctx.dispatcher.spawn(shutdown_rx.clone());
    let reaper_task = spawn_idle_reaper(ctx.session_service.clone(), shutdown_rx.clone());
    let fanout_task = spawn_presence_fanout(
        ctx.registry.as_ref().clone(),
        ctx.broker.clone(),
        shutdown_rx.clone(),
    );

    // Anything still waiting from before the restart gets a placement pass.
    dispatcher_handle.nudge();

    let app = gateway::router(ctx.app_state.clone());
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("gateway listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Flush presence before the tasks go away: every agent is offline once
    // the process stops serving sockets.
    if let Err(e) = ctx.session_service.shutdown_flush().await {
        error!("presence flush failed during shutdown: {e}");
    }

    let _ = shutdown_tx.send(true);
    let _ = dispatcher_task.await;
    let _ = reaper_task.await;
    let _ = fanout_task.await;

    info!("livedesk stopped");
    Ok(())
}
