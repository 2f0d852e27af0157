use thiserror::Error;

/// Error kinds, grouped by handling behavior (spec §7 "Error handling
/// design"). `NotFound` and `MethodNotAllowed` are normalized to success by
/// the client layer before they ever reach callers as errors — they're kept
/// here only for the rare case an internal helper needs to match on them
/// before translation.
#[derive(Error, Debug)]
pub enum PurgeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PurgeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PurgeError::NotFound(_))
    }

    pub fn is_method_not_allowed(&self) -> bool {
        matches!(self, PurgeError::MethodNotAllowed(_))
    }
}

pub type Result<T> = std::result::Result<T, PurgeError>;
