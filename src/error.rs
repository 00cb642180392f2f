//! Error types for dispatch and row validation.
//!
//! Neither type escapes the engine: both are folded into failed results.

use std::time::Duration;

/// Errors raised while sending a request or reading its response.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to read response body: {0}")]
    Body(String),

    #[error("Forwarding service error: {0}")]
    Forwarder(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl DispatchError {
    /// Classify a reqwest error, reporting timeouts with the configured
    /// limit.
    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            DispatchError::Timeout(timeout)
        } else if err.is_builder() {
            DispatchError::InvalidRequest(err.to_string())
        } else if err.is_body() || err.is_decode() {
            DispatchError::Body(err.to_string())
        } else {
            DispatchError::Transport(err.to_string())
        }
    }
}

/// Reasons a test-data row cannot be executed at all.
#[derive(Debug, thiserror::Error)]
pub enum RowError {
    #[error("Column '{column}' holds a nested value; only scalars can be substituted")]
    NonScalarCell { column: String },
}
