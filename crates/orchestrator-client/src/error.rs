//! Pod API client errors

use thiserror::Error;

/// Errors that can occur when talking to the pod API
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Pod API returned an error
    #[error("Pod API error: {0}")]
    Api(String),

    /// Authentication failed (invalid token, expired, etc.)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Pod not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Pod is locked by another operation or otherwise refuses the command
    #[error("Conflict: {0}")]
    Conflict(String),
}
