use thiserror::Error;

/// Main error type for the trading server
#[derive(Error, Debug)]
pub enum MtLinkError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Broker gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Gateway rejected order: {0}")]
    OrderRejected(String),

    // Authentication / session errors
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Session token invalid: {0}")]
    TokenInvalid(String),

    /// The session manager is bound to a different account than the caller
    /// expects. Surfaced as its own variant so callers abort the mutating
    /// gateway call instead of retrying.
    #[error("Account mismatch: bound to {bound}, expected {expected}")]
    AccountMismatch { bound: String, expected: String },

    // Command state machine errors
    #[error("Invalid command transition: from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Agent session offline: {0}")]
    SessionOffline(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for MtLinkError
pub type Result<T> = std::result::Result<T, MtLinkError>;

impl MtLinkError {
    /// Transient infrastructure failures are retried with bounded backoff at
    /// the call site and never surfaced to the orchestrator.
    pub fn is_transient(&self) -> bool {
        match self {
            MtLinkError::Http(e) => e.is_timeout() || e.is_connect(),
            MtLinkError::Database(sqlx::Error::PoolTimedOut) => true,
            MtLinkError::Database(sqlx::Error::Io(_)) => true,
            _ => false,
        }
    }

    /// Authentication/session failures get one reconnect-and-retry before
    /// being surfaced as a distinct failure.
    pub fn is_session(&self) -> bool {
        matches!(
            self,
            MtLinkError::Auth(_)
                | MtLinkError::TokenInvalid(_)
                | MtLinkError::AccountMismatch { .. }
        )
    }
}
