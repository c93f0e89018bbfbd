// File: livedesk-core/src/tasks/mod.rs
pub mod idle_reaper;
pub mod presence_fanout;

pub use idle_reaper::spawn_idle_reaper;
pub use presence_fanout::spawn_presence_fanout;
