//! Signaling mailbox for PeerLink
//!
//! Two participants in a room exchange `join`, `offer`, `answer` and
//! `ice-candidate` messages through an append-only, room-scoped store. The
//! store assigns every message a monotonically increasing sequence number and
//! readers poll for messages newer than the last sequence they saw.
//!
//! ## Backends
//!
//! - [`MemoryMailbox`]: in-process store for tests and local demos
//! - [`RestMailbox`]: PostgREST-style HTTP table (e.g. a Supabase project)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use peerlink_signaling::{Mailbox, MemoryMailbox, RoomId, SignalBody, UserId};
//!
//! let mailbox = MemoryMailbox::new();
//! let room = RoomId::from("room-42");
//! let me = UserId::from("a1");
//! mailbox.append(&room, &me, &SignalBody::join(me.clone(), "Alice")).await?;
//! let fresh = mailbox.list_since(&room, &me, 0).await?;
//! ```

mod error;
mod mailbox;
mod memory;
mod message;
mod rest;
mod types;

pub use error::{Error, Result};
pub use mailbox::Mailbox;
#[cfg(any(test, feature = "mock"))]
pub use mailbox::MockMailbox;
pub use memory::MemoryMailbox;
pub use message::{
    AnswerPayload, CandidatePayload, JoinPayload, MessageKind, OfferPayload, PeerInfo,
    SignalBody, SignalingMessage,
};
pub use rest::RestMailbox;
pub use types::{IceCandidate, RoomId, SdpType, Sequence, SessionDescription, UserId};
