//! Peer-to-peer call negotiation for PeerLink
//!
//! Drives one WebRTC peer connection between two participants of a room,
//! using the signaling mailbox from `peerlink-signaling` as the only channel
//! between them.
//!
//! ## Architecture
//!
//! - [`role`]: decides who offers, from the two participant ids alone
//! - [`negotiation`]: offer/answer state machine with deterministic glare handling
//! - [`candidate_buffer`]: holds remote ICE candidates until a remote description exists
//! - [`recovery`]: escalates from waiting, to ICE restart, to a new peer connection
//! - [`track`]: swaps the outgoing media source mid-call
//! - [`session`]: the actor tying it together, fed by the mailbox poller and
//!   peer connection callbacks
//! - [`rtc`]: [`PeerConnectionHandle`] over the `webrtc` crate
//!
//! ## Usage
//!
//! ```rust,ignore
//! use peerlink_peer::{MediaSource, RtcPeerConnectionFactory, Session, SessionConfig};
//!
//! let session = Session::join(
//!     SessionConfig::from(&config),
//!     mailbox,
//!     Arc::new(RtcPeerConnectionFactory::new(&config.webrtc)),
//!     RoomId::from("room-42"),
//!     PeerInfo { id: UserId::from("a1"), name: "Alice".into() },
//!     MediaSource::camera(),
//! )
//! .await?;
//!
//! session.replace_local_source(MediaSource::screen_share()).await?;
//! session.leave().await;
//! ```

pub mod candidate_buffer;
pub mod config;
pub mod error;
pub mod handle;
pub mod media;
pub mod negotiation;
mod poller;
pub mod recovery;
pub mod role;
pub mod rtc;
pub mod session;
pub mod state;
pub mod track;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use candidate_buffer::{Admission, CandidateBuffer};
pub use config::SessionConfig;
pub use error::{Error, Result};
pub use handle::{
    Generation, PeerConnectionFactory, PeerConnectionHandle, PeerEvent, PeerEventSink, TaggedEvent,
};
pub use media::{LocalTrack, MediaKind, MediaSource, RemoteSource, RemoteTrack, TrackId};
pub use negotiation::{AnswerOutcome, JoinOutcome, Negotiator, OfferOutcome, OfferReason};
pub use recovery::{RecoveryAction, RecoveryController, RecoveryPolicy};
pub use role::{resolve_role, Role};
pub use rtc::{RtcPeerConnection, RtcPeerConnectionFactory};
pub use session::{EndReason, Session, SessionEvent, SessionStatus};
pub use state::{ConnectionState, IceConnectionState, SignalingState};
pub use track::{replace_source, Replacement};
