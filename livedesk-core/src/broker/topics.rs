//! Topic names are constructed by convention; nothing registers them ahead
//! of time.

use uuid::Uuid;

pub const QUEUE: &str = "queue";
pub const ADMIN_STATS: &str = "admin-stats";
pub const BROADCAST: &str = "broadcast";

pub fn session(session_id: Uuid) -> String {
    format!("session:{session_id}")
}

pub fn agent(user_id: Uuid) -> String {
    format!("agent:{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_follow_convention() {
        let id = Uuid::nil();
        assert_eq!(session(id), format!("session:{id}"));
        assert_eq!(agent(id), format!("agent:{id}"));
        assert_eq!(QUEUE, "queue");
        assert_eq!(ADMIN_STATS, "admin-stats");
    }
}
