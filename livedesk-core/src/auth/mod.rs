//! Authentication boundary.
//!
//! The identity layer (password hashing, token issuance) lives outside this
//! process; we only consume `authenticate(token) -> Principal | Invalid`.
//! The default implementation validates HS256 bearer tokens and checks the
//! subject against the staff table.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use livedesk_common::models::StaffRole;
use livedesk_common::traits::UserRepository;
use livedesk_common::Error;

/// Identity bound to a connection for its lifetime.
#[derive(Debug, Clone)]
pub enum Principal {
    /// Anonymous visitor. Both fields are `None` until `start_chat` creates
    /// the session or a resume token binds an existing one.
    Customer {
        session_id: Option<Uuid>,
        customer_token: Option<String>,
    },
    Agent {
        user_id: Uuid,
        role: StaffRole,
    },
}

impl Principal {
    pub fn latent_customer() -> Self {
        Principal::Customer { session_id: None, customer_token: None }
    }

    pub fn agent_id(&self) -> Option<Uuid> {
        match self {
            Principal::Agent { user_id, .. } => Some(*user_id),
            Principal::Customer { .. } => None,
        }
    }
}

/// A validated staff identity.
#[derive(Debug, Clone)]
pub struct AuthedStaff {
    pub user_id: Uuid,
    pub role: StaffRole,
    pub display_name: String,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<AuthedStaff, Error>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    role: String,
    exp: u64,
    iat: u64,
}

/// HS256 bearer-token validator backed by the staff table.
///
/// `token_ttl` is the configured `jwt_expires_in`: besides the `exp`
/// claim, a token whose `iat` is older than this is rejected, so a token
/// minted with a far-future expiry cannot outlive the configured lifetime.
pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
    users: Arc<dyn UserRepository>,
    token_ttl: Duration,
}

impl JwtAuthenticator {
    pub fn new(secret: &str, users: Arc<dyn UserRepository>, token_ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            users,
            token_ttl,
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<AuthedStaff, Error> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| Error::Auth(format!("token rejected: {e}")))?;

        let now = Utc::now().timestamp().max(0) as u64;
        if now.saturating_sub(data.claims.iat) > self.token_ttl.as_secs() {
            return Err(Error::Auth(
                "token is older than the configured lifetime".to_string(),
            ));
        }

        let user_id = Uuid::parse_str(&data.claims.sub)
            .map_err(|_| Error::Auth("token subject is not a user id".to_string()))?;

        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or_else(|| Error::Auth(format!("unknown user {user_id}")))?;
        if !user.is_active {
            return Err(Error::Auth(format!("user {user_id} is deactivated")));
        }

        // The claim's role must not outrank the account's.
        let claimed = StaffRole::from_str(&data.claims.role)
            .map_err(|_| Error::Auth("token carries an unknown role".to_string()))?;
        let role = if claimed == StaffRole::Admin && user.role != StaffRole::Admin {
            user.role
        } else {
            claimed
        };

        Ok(AuthedStaff {
            user_id,
            role,
            display_name: user.public_name().to_string(),
        })
    }
}

/// Generate an opaque resume credential for a new session: 32 random bytes,
/// hex-encoded. Enough entropy to resist enumeration.
pub fn generate_customer_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
