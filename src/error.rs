//! Error types for LeadAI.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Campaign error: {0}")]
    Campaign(#[from] CampaignError),

    #[error("Import error: {0}")]
    Import(#[from] ImportError),

    #[error("Compose error: {0}")]
    Compose(#[from] ComposeError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

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

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Classification of a failed transport attempt.
///
/// Drives the retry decision: only `Network` and `TransientRejection` loop.
/// `Auth` halts the whole campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad recipient address or unrenderable content.
    Validation,
    /// Credentials rejected or token exchange failed.
    Auth,
    /// Connection, TLS or timeout failure.
    Network,
    /// The server refused the message for good (5xx).
    PermanentRejection,
    /// The server deferred the message (4xx).
    TransientRejection,
}

impl ErrorClass {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::TransientRejection)
    }

    /// Whether the failure invalidates the transport profile for every recipient.
    pub fn is_campaign_fatal(&self) -> bool {
        matches!(self, Self::Auth)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::Network => "network",
            Self::PermanentRejection => "permanent_rejection",
            Self::TransientRejection => "transient_rejection",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "validation" => Ok(Self::Validation),
            "auth" => Ok(Self::Auth),
            "network" => Ok(Self::Network),
            "permanent_rejection" => Ok(Self::PermanentRejection),
            "transient_rejection" => Ok(Self::TransientRejection),
            other => Err(format!("unknown error class: {other}")),
        }
    }
}

/// A single failed transport attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class}: {message}")]
pub struct TransportError {
    pub class: ErrorClass,
    pub message: String,
}

impl TransportError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Validation, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Auth, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Network, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::PermanentRejection, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::TransientRejection, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }
}

/// Campaign lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("Campaign {id} not found")]
    NotFound { id: Uuid },

    #[error("Campaign {id} is {status}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        status: String,
        target: String,
    },

    #[error("Campaign {id} is already running")]
    AlreadyRunning { id: Uuid },

    #[error("Transport profile {profile} not configured")]
    UnknownProfile { profile: String },

    #[error("Invalid campaign: {0}")]
    Invalid(String),

    #[error("Campaign run failed: {0}")]
    RunFailed(String),
}

/// Lead import errors (batch-level only; bad rows are counted, not raised).
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Missing required column: {0}")]
    MissingColumn(String),

    #[error("Unreadable header row: {0}")]
    Header(String),

    #[error("Database error during import: {0}")]
    Database(#[from] DatabaseError),
}

/// CSV export errors.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("CSV write failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("Output flush failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Text generation errors.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("Unknown tone: {0}")]
    UnknownTone(String),

    #[error("Generator failed: {0}")]
    Failed(String),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(ErrorClass::Network.is_retryable());
        assert!(ErrorClass::TransientRejection.is_retryable());
        assert!(!ErrorClass::PermanentRejection.is_retryable());
        assert!(!ErrorClass::Validation.is_retryable());
        assert!(!ErrorClass::Auth.is_retryable());
    }

    #[test]
    fn only_auth_is_campaign_fatal() {
        assert!(ErrorClass::Auth.is_campaign_fatal());
        assert!(!ErrorClass::Network.is_campaign_fatal());
        assert!(!ErrorClass::PermanentRejection.is_campaign_fatal());
    }

    #[test]
    fn error_class_parses_its_own_display() {
        for class in [
            ErrorClass::Validation,
            ErrorClass::Auth,
            ErrorClass::Network,
            ErrorClass::PermanentRejection,
            ErrorClass::TransientRejection,
        ] {
            assert_eq!(class.to_string().parse::<ErrorClass>().unwrap(), class);
        }
        assert!("bogus".parse::<ErrorClass>().is_err());
    }

    #[test]
    fn transport_error_display() {
        let err = TransportError::transient("451 try later");
        assert_eq!(err.to_string(), "transient_rejection: 451 try later");
        assert!(err.is_retryable());
    }
}
