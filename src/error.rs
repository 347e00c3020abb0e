//! Error types for the signup engine.

use uuid::Uuid;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Signup error: {0}")]
    Signup(#[from] SignupError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Classify a libSQL error raised by `op`, separating unique-constraint
    /// violations from every other query failure.
    pub fn from_libsql(op: &str, e: libsql::Error) -> Self {
        let text = e.to_string();
        if text.contains("UNIQUE constraint failed") {
            Self::Constraint(format!("{op}: {text}"))
        } else {
            Self::Query(format!("{op}: {text}"))
        }
    }
}

/// Welcome-notification delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("Delivery failed: {0}")]
    SendFailed(String),
}

/// Session token errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("malformed session token")]
    Malformed,

    #[error("session token signature mismatch")]
    InvalidSignature,

    #[error("session token expired")]
    Expired,

    #[error("session token signing failed: {0}")]
    Signing(String),
}

/// Failures of the onboarding operations, one variant per client-visible
/// reason.
#[derive(Debug, thiserror::Error)]
pub enum SignupError {
    #[error("{0}")]
    Validation(String),

    #[error("Handle must be 4-30 lowercase letters or digits")]
    InvalidHandle,

    #[error("An account with this email, handle or phone already exists")]
    AlreadyExists,

    #[error("Cannot go backwards from {current} to {requested}")]
    Regression { current: String, requested: String },

    #[error("Signup has not been started for this account")]
    NotStarted,

    #[error("Account {0} not found")]
    NotFound(Uuid),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Internal error: {0}")]
    Internal(DatabaseError),

    #[error("Credential processing failed: {0}")]
    Credential(String),
}

/// A unique-constraint violation means another registration already holds
/// the identity; every other storage failure is internal.
impl From<DatabaseError> for SignupError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::Constraint(_) => Self::AlreadyExists,
            other => Self::Internal(other),
        }
    }
}

impl SignupError {
    /// Stable machine-checkable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_failed",
            Self::InvalidHandle => "invalid_handle",
            Self::AlreadyExists => "already_exists",
            Self::Regression { .. } => "cannot_regress",
            Self::NotStarted => "signup_not_started",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Internal(_) | Self::Credential(_) => "internal_error",
        }
    }

    /// Message safe to show a client. Internal failures never leak detail.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) | Self::Credential(_) => {
                "Something went wrong, please try again".to_string()
            }
            Self::NotFound(_) => "Account not found".to_string(),
            other => other.to_string(),
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
