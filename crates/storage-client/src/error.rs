//! Storage client errors

use thiserror::Error;

/// Errors that can occur when talking to the block-storage service
#[derive(Debug, Error)]
pub enum StorageError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service returned a non-success status
    #[error("storage API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request (missing fields, bad endpoint)
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
