//! Offer/answer state machine
//!
//! A [`Negotiator`] owns the peer connection handle for one session and moves
//! it along the signaling axis:
//!
//! ```text
//! Idle ──start──▶ Stable ◀──answer── HaveLocalOffer
//!                   │ ▲  ──create_offer──▶
//!                   │ └──── answer sent ──── HaveRemoteOffer ◀── offer
//!                   ▼
//!                 Closed
//! ```
//!
//! Simultaneous offers are resolved with the role order: the Initiator keeps
//! its offer and ignores the peer's, the Responder rolls back and answers.
//! The Negotiator is not thread-safe on its own; the session actor is the only
//! caller.

use std::sync::Arc;
use tracing::{debug, info, warn};

use peerlink_signaling::{IceCandidate, SessionDescription, SignalBody, UserId};

use crate::candidate_buffer::CandidateBuffer;
use crate::error::{Error, Result};
use crate::handle::PeerConnectionHandle;
use crate::media::MediaSource;
use crate::role::{resolve_role, Role};
use crate::state::SignalingState;

/// Why an offer is being created
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OfferReason {
    /// First offer of a peer connection
    Initial,
    /// The local media kinds changed
    Renegotiate,
    /// Fresh ICE credentials after a connectivity failure
    IceRestart,
}

impl OfferReason {
    /// The stronger of two deferred requests; an ICE restart also renegotiates media
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        self.max(other)
    }
}

/// Result of seeing the peer's `join`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Local side is Initiator and idle: offer after the configured delay
    ScheduleOffer,
    /// Responder, or a round is already in progress
    Wait,
    /// The peer announced itself again; its previous connection is gone
    PeerRestarted,
}

/// Result of an inbound offer
#[derive(Debug, Clone, PartialEq)]
pub enum OfferOutcome {
    /// The answer to send back
    Answered(SignalBody),
    /// Glare lost by the peer: keep waiting for the answer to our own offer
    IgnoredGlare,
}

/// Result of an inbound answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Applied,
    /// No local offer outstanding; duplicate or stale
    Discarded,
}

/// Signaling state machine over one peer connection handle
pub struct Negotiator {
    local_id: UserId,
    peer: Option<(UserId, Role)>,
    peer_joined: bool,
    state: SignalingState,
    handle: Arc<dyn PeerConnectionHandle>,
    candidates: Arc<CandidateBuffer>,
    local_offer: Option<OfferReason>,
    deferred_offer: Option<OfferReason>,
    rounds_completed: u64,
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("local_id", &self.local_id)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("local_offer", &self.local_offer)
            .field("deferred_offer", &self.deferred_offer)
            .field("rounds_completed", &self.rounds_completed)
            .finish_non_exhaustive()
    }
}

impl Negotiator {
    pub fn new(
        local_id: UserId,
        handle: Arc<dyn PeerConnectionHandle>,
        candidates: Arc<CandidateBuffer>,
    ) -> Self {
        Self {
            local_id,
            peer: None,
            peer_joined: false,
            state: SignalingState::Idle,
            handle,
            candidates,
            local_offer: None,
            deferred_offer: None,
            rounds_completed: 0,
        }
    }

    #[must_use]
    pub const fn state(&self) -> SignalingState {
        self.state
    }

    #[must_use]
    pub fn local_id(&self) -> &UserId {
        &self.local_id
    }

    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.peer.as_ref().map(|(_, role)| *role)
    }

    #[must_use]
    pub fn remote_id(&self) -> Option<&UserId> {
        self.peer.as_ref().map(|(id, _)| id)
    }

    #[must_use]
    pub fn handle(&self) -> &Arc<dyn PeerConnectionHandle> {
        &self.handle
    }

    /// Offer/answer rounds completed on the current handle
    #[must_use]
    pub const fn rounds_completed(&self) -> u64 {
        self.rounds_completed
    }

    #[must_use]
    pub const fn deferred_offer(&self) -> Option<OfferReason> {
        self.deferred_offer
    }

    /// Attach the local tracks and become ready to negotiate
    pub async fn start(&mut self, source: &MediaSource) -> Result<()> {
        if self.state != SignalingState::Idle {
            return Err(Error::Negotiation {
                operation: "start",
                state: self.state,
            });
        }
        for track in source.tracks() {
            self.handle.add_track(track).await?;
        }
        self.state = SignalingState::Stable;
        Ok(())
    }

    /// Record the peer's `join` and decide whether to offer
    pub fn on_peer_join(&mut self, peer: &UserId) -> Result<JoinOutcome> {
        let role = self.learn_peer(peer)?;
        if self.peer_joined {
            info!(peer = %peer, "Peer joined again");
            return Ok(JoinOutcome::PeerRestarted);
        }
        self.peer_joined = true;

        match (role, self.state) {
            (Role::Initiator, SignalingState::Stable) => Ok(JoinOutcome::ScheduleOffer),
            _ => Ok(JoinOutcome::Wait),
        }
    }

    /// Create and apply a local offer. Only valid in `Stable`.
    pub async fn create_offer(&mut self, reason: OfferReason) -> Result<SignalBody> {
        if self.state != SignalingState::Stable {
            return Err(Error::Negotiation {
                operation: "create_offer",
                state: self.state,
            });
        }

        let offer = self
            .handle
            .create_offer(reason == OfferReason::IceRestart)
            .await?;
        self.handle.set_local_description(offer.clone()).await?;
        self.state = SignalingState::HaveLocalOffer;
        self.local_offer = Some(reason);

        debug!(reason = ?reason, "Local offer applied");
        Ok(SignalBody::offer(offer))
    }

    /// Offer now if `Stable`, otherwise remember the request for later.
    ///
    /// Returns `None` when the offer was deferred or no peer is known yet.
    pub async fn request_offer(&mut self, reason: OfferReason) -> Result<Option<SignalBody>> {
        if self.peer.is_none() {
            debug!(reason = ?reason, "No peer yet, offer not needed");
            return Ok(None);
        }
        match self.state {
            SignalingState::Stable => self.create_offer(reason).await.map(Some),
            SignalingState::HaveLocalOffer | SignalingState::HaveRemoteOffer => {
                self.defer(reason);
                Ok(None)
            }
            SignalingState::Idle | SignalingState::Closed => Err(Error::Negotiation {
                operation: "request_offer",
                state: self.state,
            }),
        }
    }

    /// Create the deferred offer, if any, once back in `Stable`
    pub async fn flush_deferred_offer(&mut self) -> Result<Option<SignalBody>> {
        if self.state != SignalingState::Stable {
            return Ok(None);
        }
        match self.deferred_offer.take() {
            Some(reason) => {
                debug!(reason = ?reason, "Sending deferred offer");
                self.create_offer(reason).await.map(Some)
            }
            None => Ok(None),
        }
    }

    pub async fn handle_offer(
        &mut self,
        from: &UserId,
        offer: SessionDescription,
    ) -> Result<OfferOutcome> {
        let role = self.learn_peer(from)?;

        match self.state {
            SignalingState::Idle | SignalingState::Closed => {
                return Err(Error::Negotiation {
                    operation: "handle_offer",
                    state: self.state,
                });
            }
            SignalingState::HaveLocalOffer if role == Role::Initiator => {
                info!("Offer collision, keeping local offer");
                return Ok(OfferOutcome::IgnoredGlare);
            }
            SignalingState::HaveLocalOffer => {
                info!("Offer collision, rolling back local offer");
                self.handle.rollback().await?;
                self.state = SignalingState::Stable;
                if let Some(reason) = self.local_offer.take() {
                    if reason != OfferReason::Initial {
                        self.defer(reason);
                    }
                }
            }
            SignalingState::HaveRemoteOffer => {
                warn!("New remote offer replaces an unanswered one");
                self.handle.rollback().await?;
                self.state = SignalingState::Stable;
            }
            SignalingState::Stable => {}
        }

        self.handle.set_remote_description(offer).await?;
        self.state = SignalingState::HaveRemoteOffer;
        self.drain_candidates().await;

        let answer = self.handle.create_answer().await?;
        self.handle.set_local_description(answer.clone()).await?;
        self.state = SignalingState::Stable;
        self.rounds_completed += 1;

        debug!(round = self.rounds_completed, "Answered remote offer");
        Ok(OfferOutcome::Answered(SignalBody::answer(answer)))
    }

    pub async fn handle_answer(
        &mut self,
        from: &UserId,
        answer: SessionDescription,
    ) -> Result<AnswerOutcome> {
        self.learn_peer(from)?;

        if self.state != SignalingState::HaveLocalOffer {
            debug!(state = %self.state, "Discarding answer without an outstanding offer");
            return Ok(AnswerOutcome::Discarded);
        }

        self.handle.set_remote_description(answer).await?;
        self.state = SignalingState::Stable;
        self.local_offer = None;
        self.rounds_completed += 1;
        self.drain_candidates().await;

        debug!(round = self.rounds_completed, "Remote answer applied");
        Ok(AnswerOutcome::Applied)
    }

    /// Apply one remote candidate. A rejected candidate is logged, never fatal.
    pub async fn apply_candidate(&self, candidate: IceCandidate) -> bool {
        match self.handle.add_ice_candidate(candidate).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to apply remote ICE candidate");
                false
            }
        }
    }

    /// Withdraw a local offer that never reached the peer. Returns why it was made.
    pub async fn rollback_local_offer(&mut self) -> Result<Option<OfferReason>> {
        if self.state != SignalingState::HaveLocalOffer {
            return Ok(None);
        }
        self.handle.rollback().await?;
        self.state = SignalingState::Stable;
        Ok(self.local_offer.take())
    }

    /// Swap in a fresh handle, closing the old one. Returns to `Idle`; call
    /// [`Self::start`] next. The peer and its role are kept.
    pub async fn replace_handle(&mut self, handle: Arc<dyn PeerConnectionHandle>) {
        let old = std::mem::replace(&mut self.handle, handle);
        if let Err(e) = old.close().await {
            warn!(error = %e, "Failed to close replaced peer connection");
        }
        let dropped = self.candidates.reset();
        if dropped > 0 {
            debug!(dropped, "Discarded buffered candidates of the old connection");
        }
        self.state = SignalingState::Idle;
        self.local_offer = None;
        self.deferred_offer = None;
        self.rounds_completed = 0;
    }

    pub async fn close(&mut self) {
        if self.state == SignalingState::Closed {
            return;
        }
        if let Err(e) = self.handle.close().await {
            warn!(error = %e, "Failed to close peer connection");
        }
        self.candidates.reset();
        self.state = SignalingState::Closed;
        self.local_offer = None;
        self.deferred_offer = None;
    }

    fn defer(&mut self, reason: OfferReason) {
        let merged = self
            .deferred_offer
            .map_or(reason, |pending| pending.merge(reason));
        debug!(reason = ?merged, state = %self.state, "Offer deferred until stable");
        self.deferred_offer = Some(merged);
    }

    async fn drain_candidates(&self) {
        let queued = self.candidates.open();
        if !queued.is_empty() {
            debug!(count = queued.len(), "Applying buffered candidates");
        }
        for candidate in queued {
            self.apply_candidate(candidate).await;
        }
    }

    fn learn_peer(&mut self, peer: &UserId) -> Result<Role> {
        match &self.peer {
            Some((known, role)) if known == peer => Ok(*role),
            Some((known, _)) => Err(Error::Protocol(format!(
                "message from {peer} but the call is with {known}"
            ))),
            None => {
                let role = resolve_role(&self.local_id, peer)?;
                info!(peer = %peer, role = %role, "Role resolved");
                self.peer = Some((peer.clone(), role));
                Ok(role)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate_buffer::Admission;
    use crate::handle::{PeerEventSink, TaggedEvent};
    use crate::testing::{FakeOp, FakePeerConnection};
    use peerlink_signaling::SdpType;
    use tokio::sync::mpsc;

    struct Side {
        negotiator: Negotiator,
        fake: Arc<FakePeerConnection>,
        candidates: Arc<CandidateBuffer>,
        _events: mpsc::UnboundedReceiver<TaggedEvent>,
    }

    async fn side(id: &str) -> Side {
        let (tx, rx) = mpsc::unbounded_channel();
        let fake = Arc::new(FakePeerConnection::new(PeerEventSink::new(0, tx)));
        let candidates = Arc::new(CandidateBuffer::new());
        let mut negotiator = Negotiator::new(
            UserId::from(id),
            Arc::clone(&fake) as Arc<dyn PeerConnectionHandle>,
            Arc::clone(&candidates),
        );
        negotiator.start(&MediaSource::camera()).await.unwrap();
        Side {
            negotiator,
            fake,
            candidates,
            _events: rx,
        }
    }

    fn offer_sdp(body: SignalBody) -> SessionDescription {
        match body {
            SignalBody::Offer(p) => p.offer,
            other => panic!("expected offer, got {other:?}"),
        }
    }

    fn answer_sdp(outcome: OfferOutcome) -> SessionDescription {
        match outcome {
            OfferOutcome::Answered(SignalBody::Answer(p)) => p.answer,
            other => panic!("expected answer, got {other:?}"),
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 198.51.100.{n} 4000 typ host"))
    }

    #[tokio::test]
    async fn test_start_attaches_tracks() {
        let a = side("a1").await;
        assert_eq!(a.negotiator.state(), SignalingState::Stable);
        assert_eq!(a.fake.sending().len(), 2);
    }

    #[tokio::test]
    async fn test_join_schedules_offer_only_for_initiator() {
        let mut a = side("a1").await;
        let mut b = side("b2").await;

        assert_eq!(
            a.negotiator.on_peer_join(&UserId::from("b2")).unwrap(),
            JoinOutcome::ScheduleOffer
        );
        assert_eq!(
            b.negotiator.on_peer_join(&UserId::from("a1")).unwrap(),
            JoinOutcome::Wait
        );
        assert_eq!(a.negotiator.role(), Some(Role::Initiator));
        assert_eq!(b.negotiator.role(), Some(Role::Responder));

        assert_eq!(
            a.negotiator.on_peer_join(&UserId::from("b2")).unwrap(),
            JoinOutcome::PeerRestarted
        );
    }

    #[tokio::test]
    async fn test_join_from_self_is_protocol_error() {
        let mut a = side("a1").await;
        let result = a.negotiator.on_peer_join(&UserId::from("a1"));
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert_eq!(a.negotiator.role(), None);
        assert_eq!(a.negotiator.state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_offer_answer_round() {
        let mut a = side("a1").await;
        let mut b = side("b2").await;
        a.negotiator.on_peer_join(&UserId::from("b2")).unwrap();

        let offer = a.negotiator.create_offer(OfferReason::Initial).await.unwrap();
        assert_eq!(a.negotiator.state(), SignalingState::HaveLocalOffer);

        let outcome = b
            .negotiator
            .handle_offer(&UserId::from("a1"), offer_sdp(offer))
            .await
            .unwrap();
        assert_eq!(b.negotiator.state(), SignalingState::Stable);

        let applied = a
            .negotiator
            .handle_answer(&UserId::from("b2"), answer_sdp(outcome))
            .await
            .unwrap();
        assert_eq!(applied, AnswerOutcome::Applied);
        assert_eq!(a.negotiator.state(), SignalingState::Stable);
        assert_eq!(a.negotiator.rounds_completed(), 1);
        assert_eq!(b.negotiator.rounds_completed(), 1);
    }

    #[tokio::test]
    async fn test_create_offer_outside_stable_fails() {
        let mut a = side("a1").await;
        a.negotiator.on_peer_join(&UserId::from("b2")).unwrap();
        a.negotiator.create_offer(OfferReason::Initial).await.unwrap();

        let ops_before = a.fake.ops().len();
        let err = a
            .negotiator
            .create_offer(OfferReason::Initial)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Negotiation {
                operation: "create_offer",
                state: SignalingState::HaveLocalOffer
            }
        ));
        assert_eq!(a.fake.ops().len(), ops_before);
    }

    #[tokio::test]
    async fn test_glare_resolves_to_one_round() {
        let mut a = side("a1").await;
        let mut b = side("b2").await;
        a.negotiator.on_peer_join(&UserId::from("b2")).unwrap();
        b.negotiator.on_peer_join(&UserId::from("a1")).unwrap();

        let offer_a = offer_sdp(a.negotiator.create_offer(OfferReason::Initial).await.unwrap());
        let offer_b = offer_sdp(
            b.negotiator
                .create_offer(OfferReason::Renegotiate)
                .await
                .unwrap(),
        );

        // Initiator ignores the colliding offer
        assert_eq!(
            a.negotiator
                .handle_offer(&UserId::from("b2"), offer_b)
                .await
                .unwrap(),
            OfferOutcome::IgnoredGlare
        );
        assert_eq!(a.negotiator.state(), SignalingState::HaveLocalOffer);

        // Responder rolls back and answers
        let outcome = b
            .negotiator
            .handle_offer(&UserId::from("a1"), offer_a)
            .await
            .unwrap();
        assert!(b.fake.ops().contains(&FakeOp::Rollback));
        assert_eq!(b.negotiator.state(), SignalingState::Stable);

        a.negotiator
            .handle_answer(&UserId::from("b2"), answer_sdp(outcome))
            .await
            .unwrap();
        assert_eq!(a.negotiator.state(), SignalingState::Stable);
        assert_eq!(a.negotiator.rounds_completed(), 1);
        assert_eq!(b.negotiator.rounds_completed(), 1);

        // The rolled-back renegotiation is re-issued afterwards
        assert_eq!(b.negotiator.deferred_offer(), Some(OfferReason::Renegotiate));
        assert!(b.negotiator.flush_deferred_offer().await.unwrap().is_some());
        assert_eq!(b.negotiator.state(), SignalingState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn test_answer_outside_have_local_offer_is_discarded() {
        let mut a = side("a1").await;
        a.negotiator.on_peer_join(&UserId::from("b2")).unwrap();
        let stray = SessionDescription::answer("v=0\r\n");

        let ops_before = a.fake.ops();
        let outcome = a
            .negotiator
            .handle_answer(&UserId::from("b2"), stray)
            .await
            .unwrap();
        assert_eq!(outcome, AnswerOutcome::Discarded);
        assert_eq!(a.negotiator.state(), SignalingState::Stable);
        assert_eq!(a.fake.ops(), ops_before);
    }

    #[tokio::test]
    async fn test_early_candidates_applied_in_order_after_offer() {
        let mut a = side("a1").await;
        let mut b = side("b2").await;
        a.negotiator.on_peer_join(&UserId::from("b2")).unwrap();

        for n in 1..=3 {
            assert_eq!(b.candidates.admit(candidate(n)), Admission::Buffered);
        }

        let offer = a.negotiator.create_offer(OfferReason::Initial).await.unwrap();
        b.negotiator
            .handle_offer(&UserId::from("a1"), offer_sdp(offer))
            .await
            .unwrap();

        assert_eq!(
            b.fake.applied_candidates(),
            vec![
                candidate(1).candidate,
                candidate(2).candidate,
                candidate(3).candidate
            ]
        );
        assert!(b.candidates.is_empty());

        // Candidates were applied after the remote offer, before the answer
        let ops = b.fake.ops();
        let remote = ops
            .iter()
            .position(|op| *op == FakeOp::SetRemote(SdpType::Offer))
            .unwrap();
        let first = ops
            .iter()
            .position(|op| matches!(op, FakeOp::AddCandidate(_)))
            .unwrap();
        let answer = ops.iter().position(|op| *op == FakeOp::CreateAnswer).unwrap();
        assert!(remote < first && first < answer);
    }

    #[tokio::test]
    async fn test_bad_candidate_does_not_abort_handshake() {
        let mut a = side("a1").await;
        let mut b = side("b2").await;
        a.negotiator.on_peer_join(&UserId::from("b2")).unwrap();

        b.candidates.admit(candidate(1));
        b.candidates
            .admit(IceCandidate::new("candidate:malformed"));
        b.candidates.admit(candidate(2));

        let offer = a.negotiator.create_offer(OfferReason::Initial).await.unwrap();
        let outcome = b
            .negotiator
            .handle_offer(&UserId::from("a1"), offer_sdp(offer))
            .await
            .unwrap();

        assert!(matches!(outcome, OfferOutcome::Answered(_)));
        assert_eq!(b.fake.applied_candidates().len(), 2);
    }

    #[tokio::test]
    async fn test_offer_from_stranger_is_rejected() {
        let mut b = side("b2").await;
        b.negotiator.on_peer_join(&UserId::from("a1")).unwrap();

        let result = b
            .negotiator
            .handle_offer(&UserId::from("c3"), SessionDescription::offer("v=0\r\n"))
            .await;
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert_eq!(b.negotiator.state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_request_offer_defers_until_stable() {
        let mut a = side("a1").await;
        let mut b = side("b2").await;
        a.negotiator.on_peer_join(&UserId::from("b2")).unwrap();

        let offer = a.negotiator.create_offer(OfferReason::Initial).await.unwrap();
        assert!(a
            .negotiator
            .request_offer(OfferReason::Renegotiate)
            .await
            .unwrap()
            .is_none());
        assert!(a
            .negotiator
            .request_offer(OfferReason::IceRestart)
            .await
            .unwrap()
            .is_none());
        assert_eq!(a.negotiator.deferred_offer(), Some(OfferReason::IceRestart));
        // Still mid-round
        assert!(a.negotiator.flush_deferred_offer().await.unwrap().is_none());

        let outcome = b
            .negotiator
            .handle_offer(&UserId::from("a1"), offer_sdp(offer))
            .await
            .unwrap();
        a.negotiator
            .handle_answer(&UserId::from("b2"), answer_sdp(outcome))
            .await
            .unwrap();

        assert!(a.negotiator.flush_deferred_offer().await.unwrap().is_some());
        assert_eq!(a.fake.offers_created(), vec![false, true]);
    }

    #[tokio::test]
    async fn test_request_offer_without_peer_is_noop() {
        let mut a = side("a1").await;
        assert!(a
            .negotiator
            .request_offer(OfferReason::Renegotiate)
            .await
            .unwrap()
            .is_none());
        assert!(a.fake.offers_created().is_empty());
    }

    #[tokio::test]
    async fn test_close_discards_buffer() {
        let mut a = side("a1").await;
        a.candidates.admit(candidate(1));
        a.negotiator.close().await;

        assert_eq!(a.negotiator.state(), SignalingState::Closed);
        assert!(a.candidates.is_empty());
        assert!(a.fake.is_closed());
        assert!(matches!(
            a.negotiator.create_offer(OfferReason::Initial).await,
            Err(Error::Negotiation { .. })
        ));
    }
}
