use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AvionError>;

/// Marker the upstream uses when a model identifier is no longer served.
const MODEL_UNAVAILABLE_MARKER: &str = "decommissioned";

#[derive(Debug, Error)]
pub enum AvionError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Upstream error: {status} - {message}")]
    Upstream { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Upstream timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed model response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Model response missing required field: {0}")]
    Schema(String),

    #[error("Upstream failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("Store error: {0}")]
    Store(String),
}

/// How the retry policy treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Missing credential or bad endpoint; retrying cannot help.
    Config,
    /// Network, HTTP or timeout failure; retried with backoff.
    Transient,
    /// The requested model is no longer served; switch models immediately.
    ModelUnavailable,
    /// Model answered but the payload is unusable.
    Parse,
}

impl AvionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AvionError::Config(_) => ErrorClass::Config,
            AvionError::Parse(_) | AvionError::Schema(_) => ErrorClass::Parse,
            other if other.to_string().contains(MODEL_UNAVAILABLE_MARKER) => {
                ErrorClass::ModelUnavailable
            }
            _ => ErrorClass::Transient,
        }
    }
}
