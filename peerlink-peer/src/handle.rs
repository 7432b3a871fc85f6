//! Peer connection abstraction
//!
//! The negotiation logic never talks to a concrete WebRTC stack. It drives a
//! [`PeerConnectionHandle`] and receives [`PeerEvent`]s through the
//! [`PeerEventSink`] the handle was created with. [`crate::rtc`] implements
//! this over `webrtc`, [`crate::testing`] provides an in-memory fake.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use peerlink_signaling::{IceCandidate, SessionDescription};

use crate::error::Result;
use crate::media::{LocalTrack, MediaKind, RemoteTrack};
use crate::state::{ConnectionState, IceConnectionState};

/// Incarnation counter of the peer connection within one session
pub type Generation = u64;

/// Notification raised by the peer connection
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local candidate was gathered and should be sent to the peer
    LocalCandidate(IceCandidate),
    IceStateChanged(IceConnectionState),
    ConnectionStateChanged(ConnectionState),
    /// The peer started sending a track
    RemoteTrack(RemoteTrack),
}

/// A peer event stamped with the handle incarnation that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEvent {
    pub generation: Generation,
    pub event: PeerEvent,
}

/// Channel end handed to a peer connection for its callbacks
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    generation: Generation,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl PeerEventSink {
    #[must_use]
    pub fn new(generation: Generation, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { generation, tx }
    }

    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns `false` once the owning session is gone
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Operations the negotiation core needs from a peer connection
#[async_trait]
pub trait PeerConnectionHandle: Send + Sync {
    /// Create an offer; `ice_restart` requests fresh ICE credentials
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Roll back a pending local or remote offer to `stable`
    async fn rollback(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Start sending `track` on a new line
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    /// Swap the track sent on the already negotiated line of `track.kind`
    async fn replace_track(&self, track: &LocalTrack) -> Result<()>;

    /// Stop sending `kind` altogether
    async fn remove_track(&self, kind: MediaKind) -> Result<()>;

    /// Whether `replace_track` works for a negotiated line of `kind`
    fn supports_replace(&self, kind: MediaKind) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Creates peer connections; a session asks for a new one on every full reinitialization
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnectionHandle>>;
}
