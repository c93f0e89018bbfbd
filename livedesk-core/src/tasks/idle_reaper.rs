//! Periodic task that abandons sessions with no recent activity.
//!
//! A session's clock is its newest message (creation time when the
//! transcript is empty); anything older than `chat_idle_timeout` is closed
//! through the normal abandon transition, so capacity release and fan-out
//! behave exactly as a customer leave.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use livedesk_common::Error;

use crate::services::session_service::SessionService;

pub fn spawn_idle_reaper(
    service: Arc<SessionService>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(service.config().reaper_interval);
        // The first tick fires immediately; skip it so startup is quiet.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = reap_idle_sessions(&service).await {
                        warn!("idle reaper pass failed: {e}");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("idle reaper shutting down");
                        break;
                    }
                }
            }
        }
    })
}

/// One reaper pass. Public so tests can drive it without the timer.
pub async fn reap_idle_sessions(service: &SessionService) -> Result<usize, Error> {
    let timeout = service.config().chat_idle_timeout;
    let cutoff = Utc::now()
        - ChronoDuration::from_std(timeout)
            .map_err(|e| Error::Config(format!("bad idle timeout: {e}")))?;

    let candidates = service.sessions().idle_candidates(cutoff).await?;
    let mut reaped = 0usize;
    for session in candidates {
        // A message may have landed between the scan and this pass.
        if let Ok(Some(last)) = service.messages().last_activity(session.session_id).await {
            if last >= cutoff {
                continue;
            }
        }
        match service.abandon_idle(session.session_id).await {
            Ok(_) => {
                info!(session = %session.session_id, "abandoned idle session");
                reaped += 1;
            }
            // Lost a race with resolve/end; nothing to do.
            Err(Error::SessionNotFound(_)) => {}
            Err(e) => warn!(session = %session.session_id, "failed to abandon idle session: {e}"),
        }
    }
    Ok(reaped)
}
