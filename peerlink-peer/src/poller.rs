//! Mailbox polling loop
//!
//! Runs beside the session actor so that reading the mailbox never waits on a
//! slow description operation. The poller owns the signaling cursor, which
//! therefore survives peer connection reinitialization, and routes ICE
//! candidates through the shared [`CandidateBuffer`] the moment they are read.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use peerlink_core::resilience::retry::{retry, RetryPolicy};
use peerlink_signaling::{
    IceCandidate, Mailbox, RoomId, Sequence, SignalBody, SignalingMessage, UserId,
};

use crate::candidate_buffer::{Admission, CandidateBuffer};

/// A message handed from the poller to the session actor
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inbound {
    Message {
        sequence: Sequence,
        from: UserId,
        body: SignalBody,
    },
    /// Candidate admitted while a remote description was set
    Candidate {
        sequence: Sequence,
        candidate: IceCandidate,
    },
}

pub(crate) struct Poller {
    pub mailbox: Arc<dyn Mailbox>,
    pub room: RoomId,
    pub local_id: UserId,
    pub interval: Duration,
    pub retry: RetryPolicy,
    pub candidates: Arc<CandidateBuffer>,
    pub tx: mpsc::UnboundedSender<Inbound>,
    pub cancel: CancellationToken,
}

impl Poller {
    pub async fn run(self) {
        let mut cursor: Sequence = 0;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let fetch = retry(
                &self.retry,
                "list_since",
                peerlink_signaling::Error::is_transient,
                || self.mailbox.list_since(&self.room, &self.local_id, cursor),
            );
            let batch = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = fetch => match result {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(error = %e, cursor, "Mailbox poll failed, retrying next interval");
                        continue;
                    }
                },
            };

            if self.dispatch(batch, &mut cursor).is_err() {
                break;
            }
        }
        debug!(cursor, "Mailbox poller stopped");
    }

    /// Forward every message newer than `cursor`, advancing it as we go
    fn dispatch(
        &self,
        mut batch: Vec<SignalingMessage>,
        cursor: &mut Sequence,
    ) -> Result<(), Stopped> {
        batch.sort_by_key(|m| m.sequence);

        for message in batch {
            if self.cancel.is_cancelled() {
                return Err(Stopped);
            }
            if message.sequence <= *cursor {
                debug!(sequence = message.sequence, "Skipping already processed message");
                continue;
            }
            *cursor = message.sequence;

            if message.from_user_id == self.local_id {
                continue;
            }

            let body = match message.decode() {
                Ok(body) => body,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed signaling message");
                    continue;
                }
            };

            let inbound = match body {
                SignalBody::IceCandidate(payload) => match self.candidates.admit(payload.candidate) {
                    Admission::Buffered => {
                        debug!(
                            sequence = message.sequence,
                            "Candidate buffered until remote description"
                        );
                        continue;
                    }
                    Admission::ApplyNow(candidate) => Inbound::Candidate {
                        sequence: message.sequence,
                        candidate,
                    },
                },
                body => Inbound::Message {
                    sequence: message.sequence,
                    from: message.from_user_id,
                    body,
                },
            };

            if self.tx.send(inbound).is_err() {
                return Err(Stopped);
            }
        }
        Ok(())
    }
}

/// The session is gone
#[derive(Debug)]
pub(crate) struct Stopped;
