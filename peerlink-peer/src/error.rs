//! Error types for peer negotiation

use thiserror::Error;

use crate::state::SignalingState;

/// Negotiation error types
#[derive(Debug, Error)]
pub enum Error {
    /// Mailbox append or read failed
    #[error("Transport error: {0}")]
    Transport(#[from] peerlink_signaling::Error),

    /// Operation invoked in a signaling state that does not allow it
    #[error("Negotiation error: {operation} is not valid in state {state}")]
    Negotiation {
        operation: &'static str,
        state: SignalingState,
    },

    /// Malformed or self-referential message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connectivity could not be restored within the recovery budget
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// The underlying peer connection rejected an operation
    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    /// Swapping the local media source failed; the previous source is still attached
    #[error("Track error: {0}")]
    Track(String),

    #[error("Session closed")]
    SessionClosed,
}

impl Error {
    pub fn peer(err: impl std::fmt::Display) -> Self {
        Self::PeerConnection(err.to_string())
    }
}

/// Result type for negotiation operations
pub type Result<T> = std::result::Result<T, Error>;
