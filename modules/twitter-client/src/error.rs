use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TwitterError>;

#[derive(Debug, Error)]
pub enum TwitterError {
    #[error("Rate limited (reset after {reset_after:?})")]
    RateLimited { reset_after: Option<Duration> },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized (status {status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// How a caller should treat a failed page fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Cool down and retry the same cursor.
    RateLimited,
    /// The resource is gone or the request can never succeed. Stop, keep partial results.
    Terminal,
    /// Generic platform failure. Stop, keep partial results.
    Degraded,
    /// Credentials or payload are broken. Must propagate.
    Unexpected,
}

impl TwitterError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TwitterError::RateLimited { .. } => ErrorClass::RateLimited,
            TwitterError::NotFound(_) | TwitterError::BadRequest(_) => ErrorClass::Terminal,
            TwitterError::Api { .. } | TwitterError::Network(_) => ErrorClass::Degraded,
            TwitterError::Unauthorized { .. } | TwitterError::Parse(_) => ErrorClass::Unexpected,
        }
    }
}

impl From<reqwest::Error> for TwitterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TwitterError::Parse(err.to_string())
        } else {
            TwitterError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TwitterError {
    fn from(err: serde_json::Error) -> Self {
        TwitterError::Parse(err.to_string())
    }
}
