//! Error types for the NfsPvc Operator
//!
//! Provides structured error types for the reconciliation engine, the
//! object store adapters and the admission webhook.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
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
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Write conflict on {kind}/{name}: object was modified concurrently")]
    Conflict { kind: String, name: String },

    #[error("Gave up updating {kind}/{name} after {attempts} conflicting writes")]
    ConflictRetryExhausted {
        kind: String,
        name: String,
        attempts: u32,
    },

    #[error("Invalid resource {kind}/{name}: {reason}")]
    InvalidResource {
        kind: String,
        name: String,
        reason: String,
    },

    // =========================================================================
    // Webhook Errors
    // =========================================================================
    #[error("Webhook server error: {0}")]
    Webhook(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Quantity parse error: {0}")]
    QuantityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with the controller's default error delay
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::Conflict { .. } | Error::ConflictRetryExhausted { .. } => {
                ErrorAction::RequeueWithBackoff
            }

            // Another writer won the create race; the next pass observes it
            Error::ResourceExists { .. } => ErrorAction::RequeueAfter(Duration::from_secs(1)),

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_) | Error::InvalidResource { .. } | Error::QuantityParse(_) => {
                ErrorAction::NoRequeue
            }

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Check if this error reports a missing object
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ResourceNotFound { .. })
    }

    /// Check if this error reports an object that already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::ResourceExists { .. })
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

/// Swallow not-found errors, used where absence is the desired end state
pub fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::Conflict {
            kind: "PersistentVolume".into(),
            name: "data-default-pv".into(),
        };
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::ResourceExists {
            kind: "PersistentVolumeClaim".into(),
            name: "data".into(),
        };
        assert_eq!(err.action(), ErrorAction::RequeueAfter(Duration::from_secs(1)));
    }

    #[test]
    fn test_error_retryable() {
        let exhausted = Error::ConflictRetryExhausted {
            kind: "NfsPvc".into(),
            name: "data".into(),
            attempts: 5,
        };
        assert!(exhausted.is_retryable());
        assert!(!exhausted.is_conflict());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
    }

    #[test]
    fn test_ignore_not_found() {
        let missing = Err(Error::ResourceNotFound {
            kind: "PersistentVolume".into(),
            name: "gone".into(),
        });
        assert!(ignore_not_found(missing).is_ok());

        let other = Err(Error::Internal("boom".into()));
        assert!(ignore_not_found(other).is_err());
    }
}
