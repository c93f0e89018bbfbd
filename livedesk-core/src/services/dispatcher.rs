//! Auto-assignment loop.
//!
//! The waiting queue is a query over the store, not a structure with its
//! own lock; this loop wakes on queue or capacity changes, walks the queue
//! head-first, and places each session on the least-loaded available agent
//! (ties to the longest idle). Races are resolved by the assignment
//! transaction; a lost session is skipped, a lost agent re-selected.

use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::services::session_service::SessionService;

/// Cheap handle other services use to wake the dispatcher.
#[derive(Clone)]
pub struct DispatchHandle {
    notify: Arc<Notify>,
}

impl DispatchHandle {
    pub fn new() -> Self {
        Self { notify: Arc::new(Notify::new()) }
    }

    pub fn nudge(&self) {
        self.notify.notify_one();
    }
}

impl Default for DispatchHandle {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Dispatcher {
    service: Arc<SessionService>,
    handle: DispatchHandle,
}

impl Dispatcher {
    pub fn new(service: Arc<SessionService>, handle: DispatchHandle) -> Self {
        Self { service, handle }
    }

    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Run until shutdown. Each wakeup drains as much of the queue as the
    /// current pool allows.
    pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.handle.notify.notified() => {
                        self.drain().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("dispatcher shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One pass over the waiting queue in FIFO order.
    pub async fn drain(&self) {
        if !self.service.config().auto_assign_enabled {
            return;
        }

        let waiting = match self.service.sessions().waiting_ordered().await {
            Ok(list) => list,
            Err(e) => {
                warn!("dispatcher could not read the waiting queue: {e}");
                return;
            }
        };
        if waiting.is_empty() {
            return;
        }

        let mut placed = 0usize;
        for session in waiting {
            if self.service.registry().available().is_empty() {
                break;
            }
            if self.service.try_place(session.session_id).await.is_some() {
                placed += 1;
            }
        }
        if placed > 0 {
            debug!(placed, "dispatcher placed waiting sessions");
        }
    }
}
