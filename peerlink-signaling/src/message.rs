//! Signaling message wire model
//!
//! A stored message is a flat row: `room_id`, `from_user_id`,
//! `message_type`, a kind-specific `payload` object, the store-assigned
//! `sequence` and `created_at`. The payload stays untyped in
//! [`SignalingMessage`] so that one malformed row never poisons a whole poll;
//! [`SignalingMessage::decode`] turns it into a typed [`SignalBody`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::types::{IceCandidate, RoomId, Sequence, SessionDescription, UserId};

/// Message kind, stored in the `message_type` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Join,
    Offer,
    Answer,
    IceCandidate,
}

impl MessageKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: UserId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub user: PeerInfo,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub offer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub answer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
}

/// Typed message content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalBody {
    Join(JoinPayload),
    Offer(OfferPayload),
    Answer(AnswerPayload),
    IceCandidate(CandidatePayload),
}

impl SignalBody {
    pub fn join(id: UserId, name: impl Into<String>) -> Self {
        Self::Join(JoinPayload {
            user: PeerInfo {
                id,
                name: name.into(),
            },
            timestamp: Utc::now(),
        })
    }

    #[must_use]
    pub fn offer(offer: SessionDescription) -> Self {
        Self::Offer(OfferPayload { offer })
    }

    #[must_use]
    pub fn answer(answer: SessionDescription) -> Self {
        Self::Answer(AnswerPayload { answer })
    }

    #[must_use]
    pub fn candidate(candidate: IceCandidate) -> Self {
        Self::IceCandidate(CandidatePayload { candidate })
    }

    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Join(_) => MessageKind::Join,
            Self::Offer(_) => MessageKind::Offer,
            Self::Answer(_) => MessageKind::Answer,
            Self::IceCandidate(_) => MessageKind::IceCandidate,
        }
    }

    /// Serialize the payload object for storage
    pub fn payload(&self) -> Result<serde_json::Value> {
        let value = match self {
            Self::Join(p) => serde_json::to_value(p)?,
            Self::Offer(p) => serde_json::to_value(p)?,
            Self::Answer(p) => serde_json::to_value(p)?,
            Self::IceCandidate(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    /// Rebuild a typed body from a stored kind and payload
    pub fn from_parts(kind: MessageKind, payload: serde_json::Value) -> Result<Self> {
        let body = match kind {
            MessageKind::Join => Self::Join(serde_json::from_value(payload)?),
            MessageKind::Offer => Self::Offer(serde_json::from_value(payload)?),
            MessageKind::Answer => Self::Answer(serde_json::from_value(payload)?),
            MessageKind::IceCandidate => Self::IceCandidate(serde_json::from_value(payload)?),
        };
        Ok(body)
    }
}

/// One stored signaling message. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    /// Store-assigned, strictly increasing; PostgREST tables expose it as `id`
    #[serde(alias = "id")]
    pub sequence: Sequence,
    pub room_id: RoomId,
    pub from_user_id: UserId,
    pub message_type: MessageKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl SignalingMessage {
    pub fn new(
        sequence: Sequence,
        room_id: RoomId,
        from_user_id: UserId,
        body: &SignalBody,
    ) -> Result<Self> {
        Ok(Self {
            sequence,
            room_id,
            from_user_id,
            message_type: body.kind(),
            payload: body.payload()?,
            created_at: Utc::now(),
        })
    }

    /// Decode the typed body; fails for a payload that does not match `message_type`
    pub fn decode(&self) -> Result<SignalBody> {
        SignalBody::from_parts(self.message_type, self.payload.clone()).map_err(|e| {
            Error::InvalidMessage(format!(
                "{} #{} from {}: {e}",
                self.message_type, self.sequence, self.from_user_id
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_kind_wire_names() {
        assert_eq!(
            serde_json::to_value(MessageKind::IceCandidate).unwrap(),
            json!("ice-candidate")
        );
        let kind: MessageKind = serde_json::from_value(json!("join")).unwrap();
        assert_eq!(kind, MessageKind::Join);
    }

    #[test]
    fn test_join_payload_shape() {
        let body = SignalBody::join(UserId::from("a1"), "Alice");
        let payload = body.payload().unwrap();
        assert_eq!(payload["user"]["id"], "a1");
        assert_eq!(payload["user"]["name"], "Alice");
        assert!(payload["timestamp"].is_string());
    }

    #[test]
    fn test_decode_row_with_id_column() {
        let row = json!({
            "id": 17,
            "room_id": "room-42",
            "from_user_id": "b2",
            "message_type": "answer",
            "payload": {"answer": {"type": "answer", "sdp": "v=0\r\n"}},
            "created_at": "2024-05-01T12:00:00Z"
        });
        let message: SignalingMessage = serde_json::from_value(row).unwrap();
        assert_eq!(message.sequence, 17);
        assert_eq!(
            message.decode().unwrap(),
            SignalBody::answer(SessionDescription::answer("v=0\r\n"))
        );
    }

    #[test]
    fn test_decode_rejects_mismatched_payload() {
        let message = SignalingMessage {
            sequence: 3,
            room_id: RoomId::from("room-42"),
            from_user_id: UserId::from("b2"),
            message_type: MessageKind::Offer,
            payload: json!({"candidate": {"candidate": "candidate:1"}}),
            created_at: Utc::now(),
        };
        let err = message.decode().unwrap_err();
        assert!(matches!(err, Error::InvalidMessage(_)));
    }
}
