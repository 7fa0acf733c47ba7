//! Error types for the block array driver
//!
//! Provides structured error types for the array gateway, the mapping
//! orchestrator, the replication pair manager and the API surface.

use crate::array::model::codes;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the driver
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Array Object Errors
    // =========================================================================
    #[error("Array object not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Array error, code: {code}, description: {description}")]
    RemoteObject { code: i64, description: String },

    #[error("Initiator {initiator} is owned by another host and cannot be added to host {host}")]
    Conflict { initiator: String, host: String },

    #[error("No host initiator is online on the array: {initiators:?}")]
    NoAvailableInitiator { initiators: Vec<String> },

    #[error("Unsupported access protocol: {protocol}")]
    UnsupportedProtocol { protocol: String },

    #[error("LUN copy {name} failed: {reason}")]
    LunCopyFailed { name: String, reason: String },

    // =========================================================================
    // Replication Errors
    // =========================================================================
    #[error("Remote device unavailable: {reason}")]
    RemoteDeviceUnavailable { reason: String },

    #[error("Invalid replication state for pair {pair_id}: {reason}")]
    InvalidState { pair_id: String, reason: String },

    #[error("Missing {key} in replication metadata")]
    MissingMetadata { key: String },

    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Array authentication failed: {0}")]
    Authentication(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // API Errors
    // =========================================================================
    #[error("API request validation failed: {0}")]
    ApiValidation(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the layer above should do with a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Re-run the whole (idempotent) operation later
    RetryOperation,
    /// Report the failure; retrying with the same inputs cannot succeed
    Fail,
}

impl Error {
    /// Shorthand for a `NotFound` error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Shorthand for a `RemoteObject` error
    pub fn remote(code: i64, description: impl Into<String>) -> Self {
        Error::RemoteObject {
            code,
            description: description.into(),
        }
    }

    /// Array error code, if this error came from the array
    pub fn remote_code(&self) -> Option<i64> {
        match self {
            Error::RemoteObject { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient - the whole sequence converges when re-run
            Error::Timeout { .. }
            | Error::Http(_)
            | Error::RemoteDeviceUnavailable { .. }
            | Error::NoAvailableInitiator { .. } => ErrorAction::RetryOperation,

            Error::RemoteObject { code, .. } if is_session_code(*code) => {
                ErrorAction::RetryOperation
            }

            // Needs an operator or a different request
            Error::Conflict { .. }
            | Error::Configuration(_)
            | Error::ApiValidation(_)
            | Error::UnsupportedProtocol { .. }
            | Error::MissingMetadata { .. }
            | Error::Authentication(_)
            | Error::InvalidState { .. }
            | Error::LunCopyFailed { .. } => ErrorAction::Fail,

            _ => ErrorAction::Fail,
        }
    }

    /// Check if re-running the operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self.action(), ErrorAction::RetryOperation)
    }

    /// Absence of a named object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::RemoteObject { code, .. } => *code == codes::OBJECT_NOT_FOUND,
            _ => false,
        }
    }

    /// Array session expired or was never authorized
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Error::RemoteObject { code, .. } if is_session_code(*code))
    }

    /// Create rejected because an object with the same name or id exists
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::RemoteObject { code, .. }
                if *code == codes::OBJECT_NAME_ALREADY_EXISTS || *code == codes::OBJECT_ID_NOT_UNIQUE
        )
    }

    /// Association rejected because it is already in place
    pub fn is_already_associated(&self) -> bool {
        matches!(self, Error::RemoteObject { code, .. } if *code == codes::OBJECT_ALREADY_ASSOCIATED)
    }
}

fn is_session_code(code: i64) -> bool {
    code == codes::SESSION_EXPIRED || code == codes::UNAUTHORIZED
}

/// Result type alias for the driver
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::Timeout {
            what: "replication pair 1 ready".into(),
            after: Duration::from_secs(600),
        };
        assert_eq!(err.action(), ErrorAction::RetryOperation);

        let err = Error::Conflict {
            initiator: "21000024ff000001".into(),
            host: "3".into(),
        };
        assert_eq!(err.action(), ErrorAction::Fail);

        let err = Error::remote(codes::SESSION_EXPIRED, "session expired");
        assert!(err.is_retryable());
        assert!(err.is_session_expired());
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::not_found("host", "h1").is_not_found());
        assert!(Error::remote(codes::OBJECT_NOT_FOUND, "gone").is_not_found());
        assert!(Error::remote(codes::OBJECT_NAME_ALREADY_EXISTS, "dup").is_already_exists());
        assert!(Error::remote(codes::OBJECT_ID_NOT_UNIQUE, "dup").is_already_exists());
        assert!(Error::remote(codes::OBJECT_ALREADY_ASSOCIATED, "dup").is_already_associated());

        let other = Error::remote(50331651, "parameter error");
        assert!(!other.is_not_found());
        assert!(!other.is_already_exists());
        assert!(!other.is_retryable());
        assert_eq!(other.remote_code(), Some(50331651));
    }
}
