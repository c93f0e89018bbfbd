// livedesk-common/src/error.rs
use thiserror::Error;
use uuid::Uuid;

/// Which store-backed operation failed. Maps onto the `*_FAILED` wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Init,
    Send,
    Resolve,
    Transfer,
    Rating,
}

impl StoreOp {
    pub fn code(&self) -> &'static str {
        match self {
            StoreOp::Init => "INIT_FAILED",
            StoreOp::Send => "SEND_FAILED",
            StoreOp::Resolve => "RESOLVE_FAILED",
            StoreOp::Transfer => "TRANSFER_FAILED",
            StoreOp::Rating => "RATING_FAILED",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout error: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Session {0} does not belong to this connection")]
    InvalidSession(Uuid),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Message content is empty")]
    EmptyMessage,

    #[error("Session {0} is already assigned")]
    AlreadyAssigned(Uuid),

    #[error("Agent {0} is at capacity")]
    AtCapacity(Uuid),

    #[error("Agent {0} is not online")]
    NotOnline(Uuid),

    #[error("Agent {agent_id} is not assigned to session {session_id}")]
    NotAssigned { agent_id: Uuid, session_id: Uuid },

    #[error("Transfer target {0} is not online")]
    TargetNotOnline(Uuid),

    #[error("Transfer target {0} is at capacity")]
    TargetAtCapacity(Uuid),

    #[error("Rating {0} is outside 1..5")]
    InvalidRating(i32),

    #[error("{} during {op:?}: {reason}", .op.code())]
    StoreFailed { op: StoreOp, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Internal error: {0}")]
    Server(String),
}

impl Error {
    /// Wrap a lower-level failure into the `*_FAILED` class for the wire.
    pub fn store(op: StoreOp, source: impl std::fmt::Display) -> Self {
        Error::StoreFailed { op, reason: source.to_string() }
    }

    /// Stable wire identifier surfaced in `system:error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Auth(_) => "UNAUTHORIZED",
            Error::InvalidSession(_) => "INVALID_SESSION",
            Error::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Error::EmptyMessage => "EMPTY_MESSAGE",
            Error::AlreadyAssigned(_) => "ALREADY_ASSIGNED",
            Error::AtCapacity(_) => "AT_CAPACITY",
            Error::NotOnline(_) => "NOT_ONLINE",
            Error::NotAssigned { .. } => "NOT_ASSIGNED",
            Error::TargetNotOnline(_) => "TARGET_NOT_ONLINE",
            Error::TargetAtCapacity(_) => "TARGET_AT_CAPACITY",
            Error::InvalidRating(_) => "INVALID_RATING",
            Error::StoreFailed { op, .. } => op.code(),
            Error::Database(_)
            | Error::Json(_)
            | Error::Io(_)
            | Error::Timeout(_)
            | Error::Config(_)
            | Error::Parse(_)
            | Error::Server(_) => "SERVER_ERROR",
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Parse(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Parse(s.to_string())
    }
}
