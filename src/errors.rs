use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::request::RideStatus;
use crate::services::storage_service::StoreError;

/// Main error type for the sparrow trip core
#[derive(Debug, Error)]
pub enum SparrowError {
    // Persistence errors
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Remote collaborator errors
    #[error("Network request timed out")]
    NetworkTimeout,
    #[error("Network connection error: {0}")]
    NetworkConnection(String),
    #[error("HTTP client error: {0}")]
    HttpClient(String),
    #[error("Remote call failed with status {status}: {message}")]
    RemoteStatus { status: u16, message: String },
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    // Business logic errors
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Request {request_id} is already {status}")]
    Conflict {
        request_id: String,
        status: RideStatus,
        driver_id: Option<String>,
    },
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: RideStatus, to: RideStatus },
    #[error("User {user_id} already has an active request: {request_id}")]
    ActiveRequestExists { user_id: String, request_id: String },

    // Validation errors
    #[error("Validation failed: {} errors", .0.len())]
    ValidationFailed(Vec<ValidationError>),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

// Convenience type alias for Results
pub type SparrowResult<T> = Result<T, SparrowError>;

impl From<StoreError> for SparrowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Serialization(msg) => SparrowError::Serialization(msg),
            other => SparrowError::Storage(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for SparrowError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::from(err).into()
    }
}

impl From<reqwest::Error> for SparrowError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SparrowError::NetworkTimeout
        } else if err.is_connect() {
            SparrowError::NetworkConnection(err.to_string())
        } else if let Some(status) = err.status() {
            SparrowError::RemoteStatus {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            SparrowError::HttpClient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SparrowError {
    fn from(err: serde_json::Error) -> Self {
        SparrowError::Serialization(err.to_string())
    }
}

// Helper functions for creating common errors
impl SparrowError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        SparrowError::NotFound(resource.into())
    }

    pub fn request_not_found(request_id: &str) -> Self {
        SparrowError::NotFound(format!("ride request {}", request_id))
    }

    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        SparrowError::ValidationFailed(vec![ValidationError {
            field: field.into(),
            message: message.into(),
        }])
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        SparrowError::Configuration(msg.into())
    }

    /// Whether a remote call failed in a way worth retrying later.
    pub fn is_transient(&self) -> bool {
        match self {
            SparrowError::NetworkTimeout
            | SparrowError::NetworkConnection(_)
            | SparrowError::HttpClient(_)
            | SparrowError::ServiceUnavailable(_)
            | SparrowError::Storage(_) => true,
            SparrowError::RemoteStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SparrowError::Conflict { .. })
    }
}
