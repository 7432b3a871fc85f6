//! One participant's view of one call
//!
//! A [`Session`] is a handle to two tasks:
//!
//! - the **poller** reads the mailbox on a fixed interval, drops duplicates by
//!   sequence number and queues early ICE candidates;
//! - the **actor** owns the [`Negotiator`], the [`RecoveryController`] and the
//!   peer connection, and is the only place negotiation state changes. Mailbox
//!   messages, peer connection callbacks, timers and API commands all reach it
//!   through channels and are handled one at a time.
//!
//! Peer connection callbacks carry the generation of the handle that raised
//! them. After a full reinitialization, events from the old handle are
//! dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use peerlink_core::resilience::retry::retry;
use peerlink_signaling::{
    JoinPayload, Mailbox, PeerInfo, RoomId, Sequence, SessionDescription, SignalBody, UserId,
};

use crate::candidate_buffer::CandidateBuffer;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::handle::{Generation, PeerConnectionFactory, PeerEvent, PeerEventSink, TaggedEvent};
use crate::media::{MediaSource, RemoteSource};
use crate::negotiation::{JoinOutcome, Negotiator, OfferOutcome, OfferReason};
use crate::poller::{Inbound, Poller};
use crate::recovery::{CheckToken, RecoveryAction, RecoveryController};
use crate::role::Role;
use crate::state::{ConnectionState, IceConnectionState, SignalingState};
use crate::track::replace_source;

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The local participant left
    Left,
    /// Connectivity could not be restored
    ConnectionLost,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left => f.write_str("left the call"),
            Self::ConnectionLost => f.write_str("connection lost"),
        }
    }
}

/// Snapshot of a session, published on every change
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub signaling: SignalingState,
    pub ice: IceConnectionState,
    pub connection: ConnectionState,
    pub role: Option<Role>,
    pub remote_peer: Option<UserId>,
    /// `None` until the peer's first track arrives on the current connection
    pub remote_source: Option<RemoteSource>,
    /// Incarnation of the peer connection; bumped by every reinitialization
    pub generation: Generation,
    pub ended: Option<EndReason>,
}

impl SessionStatus {
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.ice.is_connected()
    }
}

/// Notable transitions, for applications that prefer a stream over snapshots
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    RoleResolved { peer: UserId, role: Role },
    SignalingStateChanged(SignalingState),
    IceStateChanged(IceConnectionState),
    ConnectionStateChanged(ConnectionState),
    RemoteSourceChanged(RemoteSource),
    /// A message was rejected as malformed or contradictory
    ProtocolViolation(String),
    CallEnded(EndReason),
}

enum Command {
    ReplaceSource {
        source: MediaSource,
        reply: oneshot::Sender<Result<()>>,
    },
}

#[derive(Debug)]
enum Timer {
    Offer {
        generation: Generation,
        reason: OfferReason,
    },
    RecoveryCheck {
        token: CheckToken,
    },
}

/// A joined call. Dropping it tears the call down in the background; use
/// [`Session::leave`] to wait for teardown to finish.
pub struct Session {
    room: RoomId,
    local_id: UserId,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("room", &self.room)
            .field("local_id", &self.local_id)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create the peer connection, announce ourselves in `room` and start
    /// polling. Fails if the `join` cannot be appended.
    pub async fn join(
        config: SessionConfig,
        mailbox: Arc<dyn Mailbox>,
        factory: Arc<dyn PeerConnectionFactory>,
        room: RoomId,
        local: PeerInfo,
        source: MediaSource,
    ) -> Result<Self> {
        let span = info_span!("session", room_id = %room, user_id = %local.id);

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let handle = factory
            .create(PeerEventSink::new(0, peer_tx.clone()))
            .instrument(span.clone())
            .await?;
        let candidates = Arc::new(CandidateBuffer::new());
        let mut negotiator = Negotiator::new(local.id.clone(), handle, Arc::clone(&candidates));

        let announced = async {
            negotiator.start(&source).await?;
            let join = SignalBody::join(local.id.clone(), local.name.clone());
            retry(
                &config.append_retry,
                "join",
                peerlink_signaling::Error::is_transient,
                || mailbox.append(&room, &local.id, &join),
            )
            .await?;
            Ok::<_, Error>(())
        }
        .instrument(span.clone())
        .await;
        if let Err(e) = announced {
            negotiator.close().await;
            return Err(e);
        }
        span.in_scope(|| info!("Joined room"));

        let cancel = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let poller = Poller {
            mailbox: Arc::clone(&mailbox),
            room: room.clone(),
            local_id: local.id.clone(),
            interval: config.poll_interval,
            retry: config.poll_retry,
            candidates: Arc::clone(&candidates),
            tx: inbound_tx,
            cancel: cancel.clone(),
        };
        let poller = tokio::spawn(poller.run().instrument(span.clone()));

        let initial = SessionStatus {
            signaling: negotiator.state(),
            ice: IceConnectionState::New,
            connection: ConnectionState::New,
            role: None,
            remote_peer: None,
            remote_source: None,
            generation: 0,
            ended: None,
        };
        let (status_tx, status_rx) = watch::channel(initial);
        let (events_tx, _) = broadcast::channel(64);
        let (command_tx, command_rx) = mpsc::channel(16);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            recovery: RecoveryController::new(config.recovery),
            config,
            room: room.clone(),
            local_name: local.name.clone(),
            mailbox,
            factory,
            negotiator,
            generation: 0,
            local_source: source,
            remote_source: None,
            ice: IceConnectionState::New,
            connection: ConnectionState::New,
            last_signaling: SignalingState::Stable,
            ended: None,
            status_tx,
            events_tx: events_tx.clone(),
            peer_tx,
            timer_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(
            actor
                .run(command_rx, peer_rx, inbound_rx, timer_rx, poller)
                .instrument(span),
        );

        Ok(Self {
            room,
            local_id: local.id,
            commands: command_tx,
            status: status_rx,
            events: events_tx,
            cancel,
            task: Some(task),
        })
    }

    #[must_use]
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    #[must_use]
    pub fn local_id(&self) -> &UserId {
        &self.local_id
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Watch the status snapshot
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Switch the outgoing media, e.g. from camera to screen share.
    ///
    /// Kinds carried by both sources are swapped without renegotiation where
    /// possible. On error the previous source is still being sent.
    pub async fn replace_local_source(&self, source: MediaSource) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ReplaceSource { source, reply })
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Resolves when the call ends, for whatever reason
    pub async fn ended(&self) -> EndReason {
        let mut status = self.status.clone();
        let reason = match status.wait_for(|s| s.ended.is_some()).await {
            Ok(s) => s.ended.unwrap_or(EndReason::Left),
            Err(_) => EndReason::Left,
        };
        reason
    }

    /// Leave the call: stop polling, close the peer connection and clear the room
    pub async fn leave(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Session task failed");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Actor {
    config: SessionConfig,
    room: RoomId,
    /// Display name repeated whenever the join is re-announced
    local_name: String,
    mailbox: Arc<dyn Mailbox>,
    factory: Arc<dyn PeerConnectionFactory>,
    negotiator: Negotiator,
    recovery: RecoveryController,
    generation: Generation,
    local_source: MediaSource,
    remote_source: Option<RemoteSource>,
    ice: IceConnectionState,
    connection: ConnectionState,
    last_signaling: SignalingState,
    ended: Option<EndReason>,
    status_tx: watch::Sender<SessionStatus>,
    events_tx: broadcast::Sender<SessionEvent>,
    peer_tx: mpsc::UnboundedSender<TaggedEvent>,
    timer_tx: mpsc::UnboundedSender<Timer>,
    cancel: CancellationToken,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut peer_events: mpsc::UnboundedReceiver<TaggedEvent>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        mut timers: mpsc::UnboundedReceiver<Timer>,
        poller: JoinHandle<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                Some(command) = commands.recv() => self.on_command(command).await,
                Some(tagged) = peer_events.recv() => self.on_peer_event(tagged).await,
                Some(message) = inbound.recv() => self.on_inbound(message).await,
                Some(timer) = timers.recv() => self.on_timer(timer).await,
            }

            if self.ended.is_some() {
                break;
            }
            self.flush_deferred_offer().await;
            self.publish_status();
        }

        self.shutdown(poller).await;
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::ReplaceSource { source, reply } => {
                let result = self.replace_local_source(source).await;
                // The caller may have given up waiting
                let _ = reply.send(result);
            }
        }
    }

    async fn replace_local_source(&mut self, source: MediaSource) -> Result<()> {
        let replacement =
            replace_source(self.negotiator.handle().as_ref(), &self.local_source, &source).await?;
        self.local_source = source;
        if replacement.renegotiate {
            self.request_offer(OfferReason::Renegotiate).await;
        }
        Ok(())
    }

    async fn on_peer_event(&mut self, tagged: TaggedEvent) {
        if tagged.generation != self.generation {
            debug!(
                generation = tagged.generation,
                current = self.generation,
                "Dropping event from replaced peer connection"
            );
            return;
        }

        match tagged.event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.send(SignalBody::candidate(candidate)).await {
                    warn!(error = %e, "Failed to send local candidate");
                }
            }
            PeerEvent::IceStateChanged(state) => {
                if state != self.ice {
                    debug!(state = %state, "ICE state changed");
                    self.ice = state;
                    self.emit(SessionEvent::IceStateChanged(state));
                }
                let action = self.recovery.on_ice_state(state);
                self.recover(action).await;
            }
            PeerEvent::ConnectionStateChanged(state) => {
                if state != self.connection {
                    debug!(state = %state, "Connection state changed");
                    self.connection = state;
                    self.emit(SessionEvent::ConnectionStateChanged(state));
                }
                let action = self.recovery.on_connection_state(state);
                self.recover(action).await;
            }
            PeerEvent::RemoteTrack(track) => {
                info!(kind = %track.kind, track_id = %track.id, "Receiving remote track");
                let remote = self.remote_source.get_or_insert_with(RemoteSource::default);
                remote.insert(track);
                let snapshot = remote.clone();
                self.emit(SessionEvent::RemoteSourceChanged(snapshot));
            }
        }
    }

    async fn on_inbound(&mut self, inbound: Inbound) {
        let (sequence, result) = match inbound {
            Inbound::Candidate {
                sequence,
                candidate,
            } => {
                debug!(sequence, "Applying remote candidate");
                self.negotiator.apply_candidate(candidate).await;
                (sequence, Ok(()))
            }
            Inbound::Message {
                sequence,
                from,
                body,
            } => {
                debug!(sequence, from = %from, kind = %body.kind(), "Handling signaling message");
                let result = match body {
                    SignalBody::Join(payload) => self.on_join(&from, payload).await,
                    SignalBody::Offer(payload) => self.on_offer(&from, payload.offer).await,
                    SignalBody::Answer(payload) => self.on_answer(&from, payload.answer).await,
                    SignalBody::IceCandidate(payload) => {
                        self.negotiator.apply_candidate(payload.candidate).await;
                        Ok(())
                    }
                };
                (sequence, result)
            }
        };

        if let Err(e) = result {
            match e {
                Error::Protocol(reason) => {
                    warn!(sequence, reason = %reason, "Rejected signaling message");
                    self.emit(SessionEvent::ProtocolViolation(reason));
                }
                e => warn!(sequence, error = %e, "Failed to handle signaling message"),
            }
        }
    }

    async fn on_join(&mut self, from: &UserId, payload: JoinPayload) -> Result<()> {
        if payload.user.id != *from {
            return Err(Error::Protocol(format!(
                "join announces {} but was sent by {from}",
                payload.user.id
            )));
        }

        let known = self.negotiator.role().is_some();
        let outcome = self.negotiator.on_peer_join(from)?;
        if let (false, Some(role)) = (known, self.negotiator.role()) {
            info!(peer = %from, name = %payload.user.name, role = %role, "Peer joined");
            self.emit(SessionEvent::RoleResolved {
                peer: from.clone(),
                role,
            });
        }

        match outcome {
            JoinOutcome::ScheduleOffer => {
                self.schedule_offer(self.config.offer_delay, OfferReason::Initial);
            }
            JoinOutcome::Wait => {}
            JoinOutcome::PeerRestarted => {
                self.reinitialize().await?;
                // Leaving cleared the room, so the restarted peer never saw our join
                let join = SignalBody::join(
                    self.negotiator.local_id().clone(),
                    self.local_name.clone(),
                );
                self.send(join).await?;
                if self.negotiator.role() == Some(Role::Initiator) {
                    self.schedule_offer(self.config.offer_delay, OfferReason::Initial);
                }
            }
        }
        Ok(())
    }

    async fn on_offer(&mut self, from: &UserId, offer: SessionDescription) -> Result<()> {
        let outcome = match self.negotiator.handle_offer(from, offer.clone()).await {
            Ok(outcome) => outcome,
            Err(Error::PeerConnection(reason)) => {
                warn!(reason = %reason, "Remote offer rejected, retrying on a fresh connection");
                self.reinitialize().await?;
                self.negotiator.handle_offer(from, offer).await?
            }
            Err(e) => return Err(e),
        };

        if let OfferOutcome::Answered(answer) = outcome {
            self.send(answer).await?;
        }
        Ok(())
    }

    async fn on_answer(&mut self, from: &UserId, answer: SessionDescription) -> Result<()> {
        match self.negotiator.handle_answer(from, answer).await {
            Ok(_) => Ok(()),
            Err(Error::PeerConnection(reason)) => {
                warn!(reason = %reason, "Remote answer rejected, starting over on a fresh connection");
                self.reinitialize().await?;
                self.schedule_offer(self.config.offer_delay, OfferReason::Initial);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Offer { generation, reason } => {
                if generation != self.generation {
                    return;
                }
                if reason == OfferReason::Initial
                    && (self.negotiator.rounds_completed() > 0
                        || self.negotiator.state() != SignalingState::Stable)
                {
                    debug!("Initial offer no longer needed");
                    return;
                }
                self.request_offer(reason).await;
            }
            Timer::RecoveryCheck { token } => {
                let action = self.recovery.on_check_expired(token);
                self.recover(action).await;
            }
        }
    }

    async fn recover(&mut self, action: RecoveryAction) {
        match action {
            RecoveryAction::None => {}
            RecoveryAction::ScheduleCheck { token, after } => {
                self.schedule(after, Timer::RecoveryCheck { token });
            }
            RecoveryAction::RestartIce => self.request_offer(OfferReason::IceRestart).await,
            RecoveryAction::Reinitialize { after } => {
                if let Err(e) = self.reinitialize().await {
                    error!(error = %e, "Failed to reinitialize peer connection");
                    return;
                }
                if self.negotiator.role() == Some(Role::Initiator) {
                    self.schedule_offer(after, OfferReason::Initial);
                }
            }
            RecoveryAction::GiveUp => {
                let reason = Error::Connectivity("recovery budget exhausted".to_string());
                error!(error = %reason, "Ending call");
                self.end(EndReason::ConnectionLost);
            }
        }
    }

    /// Offer now or once the current round completes
    async fn request_offer(&mut self, reason: OfferReason) {
        match self.negotiator.request_offer(reason).await {
            Ok(Some(offer)) => self.send_offer(offer).await,
            Ok(None) => {}
            Err(e) => warn!(reason = ?reason, error = %e, "Could not create offer"),
        }
    }

    async fn flush_deferred_offer(&mut self) {
        match self.negotiator.flush_deferred_offer().await {
            Ok(Some(offer)) => self.send_offer(offer).await,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not create deferred offer"),
        }
    }

    /// Send an applied local offer; withdraw it and try later if that fails
    async fn send_offer(&mut self, offer: SignalBody) {
        let Err(e) = self.send(offer).await else {
            return;
        };
        warn!(error = %e, "Failed to send offer, withdrawing it");
        match self.negotiator.rollback_local_offer().await {
            Ok(Some(reason)) => self.schedule_offer(self.config.offer_delay, reason),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to withdraw unsent offer"),
        }
    }

    async fn send(&self, body: SignalBody) -> Result<Sequence> {
        let local = self.negotiator.local_id();
        let sequence = retry(
            &self.config.append_retry,
            body.kind().as_str(),
            peerlink_signaling::Error::is_transient,
            || self.mailbox.append(&self.room, local, &body),
        )
        .await?;
        debug!(sequence, kind = %body.kind(), "Signaling message sent");
        Ok(sequence)
    }

    /// Replace the peer connection. The signaling cursor is untouched.
    async fn reinitialize(&mut self) -> Result<()> {
        let generation = self.generation + 1;
        let handle = self
            .factory
            .create(PeerEventSink::new(generation, self.peer_tx.clone()))
            .await?;

        self.generation = generation;
        self.negotiator.replace_handle(handle).await;
        self.negotiator.start(&self.local_source).await?;
        self.recovery.reset_for_new_handle();
        self.ice = IceConnectionState::New;
        self.connection = ConnectionState::New;
        self.remote_source = None;

        info!(generation, "Peer connection reinitialized");
        self.publish_status();
        Ok(())
    }

    fn schedule_offer(&self, after: Duration, reason: OfferReason) {
        self.schedule(
            after,
            Timer::Offer {
                generation: self.generation,
                reason,
            },
        );
    }

    fn schedule(&self, after: Duration, timer: Timer) {
        let tx = self.timer_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(after) => {
                    let _ = tx.send(timer);
                }
            }
        });
    }

    fn end(&mut self, reason: EndReason) {
        if self.ended.is_none() {
            self.ended = Some(reason);
            self.emit(SessionEvent::CallEnded(reason));
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn publish_status(&mut self) {
        let signaling = self.negotiator.state();
        if signaling != self.last_signaling {
            self.last_signaling = signaling;
            self.emit(SessionEvent::SignalingStateChanged(signaling));
        }

        let status = SessionStatus {
            signaling,
            ice: self.ice,
            connection: self.connection,
            role: self.negotiator.role(),
            remote_peer: self.negotiator.remote_id().cloned(),
            remote_source: self.remote_source.clone(),
            generation: self.generation,
            ended: self.ended,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    async fn shutdown(mut self, poller: JoinHandle<()>) {
        self.cancel.cancel();
        if let Err(e) = poller.await {
            error!(error = %e, "Mailbox poller failed");
        }

        self.negotiator.close().await;
        self.end(EndReason::Left);
        self.publish_status();

        if let Err(e) = self.mailbox.clear(&self.room).await {
            warn!(error = %e, "Failed to clear room");
        }
        info!(reason = ?self.ended, "Session ended");
    }
}
