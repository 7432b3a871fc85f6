use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

use crate::error::Result;
use crate::mailbox::Mailbox;
use crate::message::{SignalBody, SignalingMessage};
use crate::types::{RoomId, Sequence, UserId};

/// In-process mailbox
///
/// Sequence numbers are global across rooms, like a database identity
/// column, and are assigned while the room's entry is locked so every room's
/// log stays in ascending order.
#[derive(Debug, Default)]
pub struct MemoryMailbox {
    rooms: DashMap<RoomId, Vec<SignalingMessage>>,
    last_sequence: AtomicI64,
}

impl MemoryMailbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every message in `room`, including the caller's own
    #[must_use]
    pub fn messages(&self, room: &RoomId) -> Vec<SignalingMessage> {
        self.rooms
            .get(room)
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Number of messages currently stored for `room`
    #[must_use]
    pub fn len(&self, room: &RoomId) -> usize {
        self.rooms.get(room).map_or(0, |log| log.len())
    }

    #[must_use]
    pub fn is_empty(&self, room: &RoomId) -> bool {
        self.len(room) == 0
    }
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    async fn append(&self, room: &RoomId, sender: &UserId, body: &SignalBody) -> Result<Sequence> {
        let mut log = self.rooms.entry(room.clone()).or_default();
        let sequence = self.last_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        log.push(SignalingMessage::new(
            sequence,
            room.clone(),
            sender.clone(),
            body,
        )?);

        debug!(
            room_id = %room,
            sender = %sender,
            kind = %body.kind(),
            sequence,
            "Appended signaling message"
        );
        Ok(sequence)
    }

    async fn list_since(
        &self,
        room: &RoomId,
        exclude_sender: &UserId,
        cursor: Sequence,
    ) -> Result<Vec<SignalingMessage>> {
        let Some(log) = self.rooms.get(room) else {
            return Ok(Vec::new());
        };

        Ok(log
            .iter()
            .filter(|m| m.sequence > cursor && &m.from_user_id != exclude_sender)
            .cloned()
            .collect())
    }

    async fn clear(&self, room: &RoomId) -> Result<()> {
        if let Some((_, log)) = self.rooms.remove(room) {
            debug!(room_id = %room, removed = log.len(), "Cleared signaling room");
        }
        Ok(())
    }
}
