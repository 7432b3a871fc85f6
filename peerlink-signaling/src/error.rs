//! Error types for the signaling mailbox

use thiserror::Error;

/// Mailbox error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Mailbox returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Whether another attempt of the same request may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::Serialization(_) | Self::InvalidMessage(_) | Self::Configuration(_) => false,
        }
    }
}

/// Result type for mailbox operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Transport("reset".into()).is_transient());
        assert!(Error::Status {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(Error::Status {
            status: 429,
            body: String::new()
        }
        .is_transient());
        assert!(!Error::Status {
            status: 401,
            body: "bad key".into()
        }
        .is_transient());
        assert!(!Error::InvalidMessage("x".into()).is_transient());
    }
}
