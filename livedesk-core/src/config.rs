// livedesk-core/src/config.rs

use std::time::Duration;

/// Runtime knobs for the routing engine. Built by the server binary from
/// CLI flags and handed to the services.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Default per-agent concurrent chat cap for new presence rows.
    pub max_chats_per_cs: i32,
    /// A session with no activity for this long is abandoned by the reaper.
    pub chat_idle_timeout: Duration,
    /// How often the idle reaper scans.
    pub reaper_interval: Duration,
    /// Whether the dispatcher auto-assigns waiting sessions.
    pub auto_assign_enabled: bool,
    /// Deadline applied to store operations on the hot path.
    pub store_deadline: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_chats_per_cs: 5,
            chat_idle_timeout: Duration::from_secs(1800),
            reaper_interval: Duration::from_secs(60),
            auto_assign_enabled: true,
            store_deadline: Duration::from_secs(5),
        }
    }
}
