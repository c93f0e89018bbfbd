use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// Staff role. Credentials and password hashes live in the external identity
/// layer; we only read the account record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaffRole {
    Cs,
    Admin,
}

impl StaffRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StaffRole::Cs => "cs",
            StaffRole::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "cs" => Ok(StaffRole::Cs),
            "admin" => Ok(StaffRole::Admin),
            other => Err(Error::Parse(format!("unknown staff role '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub role: StaffRole,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl User {
    /// Name shown to customers: display name if set, otherwise the username.
    pub fn public_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_name_prefers_display_name() {
        let mut u = User {
            user_id: Uuid::new_v4(),
            username: "jsmith".into(),
            email: None,
            display_name: Some("Jo Smith".into()),
            role: StaffRole::Cs,
            is_active: true,
            created_at: Utc::now(),
            last_login_at: None,
        };
        assert_eq!(u.public_name(), "Jo Smith");
        u.display_name = None;
        assert_eq!(u.public_name(), "jsmith");
    }

    #[test]
    fn role_round_trips() {
        assert_eq!(StaffRole::from_str("cs").unwrap(), StaffRole::Cs);
        assert_eq!(StaffRole::from_str("admin").unwrap(), StaffRole::Admin);
        assert!(StaffRole::from_str("root").is_err());
    }
}
