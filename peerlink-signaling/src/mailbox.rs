use async_trait::async_trait;

use crate::error::Result;
use crate::message::{SignalBody, SignalingMessage};
use crate::types::{RoomId, Sequence, UserId};

/// Append-only, room-scoped message store polled by every participant.
///
/// Implementations must hand out strictly increasing sequence numbers and
/// return `list_since` results in ascending sequence order. Nobody mutates a
/// message after it is appended.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Store a message and return its assigned sequence number
    async fn append(&self, room: &RoomId, sender: &UserId, body: &SignalBody) -> Result<Sequence>;

    /// Messages in `room` with `sequence > cursor` not sent by `exclude_sender`,
    /// ascending. Empty when nothing is new.
    async fn list_since(
        &self,
        room: &RoomId,
        exclude_sender: &UserId,
        cursor: Sequence,
    ) -> Result<Vec<SignalingMessage>>;

    /// Drop every message in `room`. Best-effort cleanup at call end.
    async fn clear(&self, room: &RoomId) -> Result<()>;
}
