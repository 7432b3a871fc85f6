//! In-memory peer connection for tests
//!
//! [`FakePeerConnection`] follows the browser signaling-state rules closely
//! enough to catch misuse (answering without a remote offer, applying a
//! candidate with no remote description, ...), records every call, and
//! reports itself connected once an offer/answer round completes.
//! Descriptions are plain text with one `m=<kind>` line per sent track so
//! the receiving fake can announce remote tracks.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use peerlink_signaling::{IceCandidate, SdpType, SessionDescription};

use crate::error::{Error, Result};
use crate::handle::{PeerConnectionFactory, PeerConnectionHandle, PeerEvent, PeerEventSink};
use crate::media::{LocalTrack, MediaKind, RemoteTrack, TrackId};
use crate::state::{ConnectionState, IceConnectionState, SignalingState};

/// One recorded call on the fake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeOp {
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    Rollback,
    AddCandidate(String),
    AddTrack(MediaKind, TrackId),
    ReplaceTrack(MediaKind, TrackId),
    RemoveTrack(MediaKind),
    Close,
}

#[derive(Debug)]
struct FakeState {
    signaling: SignalingState,
    has_remote_description: bool,
    senders: BTreeMap<MediaKind, TrackId>,
    announced: BTreeSet<MediaKind>,
    ops: Vec<FakeOp>,
    version: u32,
    candidates_gathered: u32,
    ice: IceConnectionState,
    restart_in_progress: bool,
    replace_supported: bool,
    failing_replace: Option<MediaKind>,
    failing_remote_offers: usize,
    failing_remote_answers: usize,
    auto_connect: bool,
}

/// Scriptable stand-in for a WebRTC peer connection
#[derive(Debug)]
pub struct FakePeerConnection {
    sink: PeerEventSink,
    state: Mutex<FakeState>,
}

impl FakePeerConnection {
    #[must_use]
    pub fn new(sink: PeerEventSink) -> Self {
        Self::with_auto_connect(sink, true)
    }

    #[must_use]
    pub fn with_auto_connect(sink: PeerEventSink, auto_connect: bool) -> Self {
        Self {
            sink,
            state: Mutex::new(FakeState {
                signaling: SignalingState::Stable,
                has_remote_description: false,
                senders: BTreeMap::new(),
                announced: BTreeSet::new(),
                ops: Vec::new(),
                version: 0,
                candidates_gathered: 0,
                ice: IceConnectionState::New,
                restart_in_progress: false,
                replace_supported: true,
                failing_replace: None,
                failing_remote_offers: 0,
                failing_remote_answers: 0,
                auto_connect,
            }),
        }
    }

    #[must_use]
    pub fn ops(&self) -> Vec<FakeOp> {
        self.state.lock().ops.clone()
    }

    /// Candidate lines successfully applied, in order
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<String> {
        self.state
            .lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                FakeOp::AddCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    /// `ice_restart` flag of every offer created so far
    #[must_use]
    pub fn offers_created(&self) -> Vec<bool> {
        self.state
            .lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                FakeOp::CreateOffer { ice_restart } => Some(*ice_restart),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    #[must_use]
    pub fn sending(&self) -> BTreeMap<MediaKind, TrackId> {
        self.state.lock().senders.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().signaling == SignalingState::Closed
    }

    pub fn set_replace_supported(&self, supported: bool) {
        self.state.lock().replace_supported = supported;
    }

    /// Make the next `replace_track` of `kind` fail, as if the device went away
    pub fn fail_next_replace(&self, kind: MediaKind) {
        self.state.lock().failing_replace = Some(kind);
    }

    /// Reject the next `count` remote offers
    pub fn fail_remote_offers(&self, count: usize) {
        self.state.lock().failing_remote_offers = count;
    }

    /// Reject the next `count` remote answers
    pub fn fail_remote_answers(&self, count: usize) {
        self.state.lock().failing_remote_answers = count;
    }

    /// Raise an event as if the underlying stack produced it
    pub fn inject(&self, event: PeerEvent) -> bool {
        if let PeerEvent::IceStateChanged(ice) = &event {
            self.state.lock().ice = *ice;
        }
        self.sink.emit(event)
    }

    fn describe(state: &mut FakeState, sdp_type: SdpType, ice_restart: bool) -> SessionDescription {
        state.version += 1;
        let mut sdp = format!("v=0\r\no=fake {} 0 IN IP4 127.0.0.1\r\n", state.version);
        if ice_restart {
            sdp.push_str("a=ice-restart\r\n");
        }
        for kind in state.senders.keys() {
            sdp.push_str(&format!("m={kind}\r\n"));
        }
        SessionDescription { sdp_type, sdp }
    }

    fn remote_kinds(description: &SessionDescription) -> Vec<MediaKind> {
        description
            .sdp
            .lines()
            .filter_map(|line| match line.strip_prefix("m=") {
                Some("audio") => Some(MediaKind::Audio),
                Some("video") => Some(MediaKind::Video),
                _ => None,
            })
            .collect()
    }

    fn announce_remote_tracks(&self, description: &SessionDescription) {
        let fresh: Vec<MediaKind> = {
            let mut state = self.state.lock();
            Self::remote_kinds(description)
                .into_iter()
                .filter(|kind| state.announced.insert(*kind))
                .collect()
        };
        for kind in fresh {
            self.sink.emit(PeerEvent::RemoteTrack(RemoteTrack {
                id: format!("remote-{kind}"),
                stream_id: "remote-stream".to_string(),
                kind,
            }));
        }
    }

    fn gather_candidate(&self) {
        let n = {
            let mut state = self.state.lock();
            state.candidates_gathered += 1;
            state.candidates_gathered
        };
        let mut candidate = IceCandidate::new(format!(
            "candidate:{n} 1 udp 2122260223 192.0.2.{n} {} typ host",
            50_000 + n
        ));
        candidate.sdp_mid = Some("0".to_string());
        candidate.sdp_mline_index = Some(0);
        self.sink.emit(PeerEvent::LocalCandidate(candidate));
    }

    fn round_completed(&self) {
        let connect = {
            let mut state = self.state.lock();
            let connect =
                state.auto_connect && (!state.ice.is_connected() || state.restart_in_progress);
            if connect {
                state.ice = IceConnectionState::Connected;
                state.restart_in_progress = false;
            }
            connect
        };
        if connect {
            self.sink
                .emit(PeerEvent::IceStateChanged(IceConnectionState::Checking));
            self.sink
                .emit(PeerEvent::IceStateChanged(IceConnectionState::Connected));
            self.sink
                .emit(PeerEvent::ConnectionStateChanged(ConnectionState::Connected));
        }
    }

    fn invalid(op: &str, state: SignalingState) -> Error {
        Error::PeerConnection(format!("{op} not allowed in {state}"))
    }
}

#[async_trait]
impl PeerConnectionHandle for FakePeerConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        if !matches!(
            state.signaling,
            SignalingState::Stable | SignalingState::HaveLocalOffer
        ) {
            return Err(Self::invalid("createOffer", state.signaling));
        }
        state.ops.push(FakeOp::CreateOffer { ice_restart });
        if ice_restart {
            state.restart_in_progress = true;
        }
        Ok(Self::describe(&mut state, SdpType::Offer, ice_restart))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(Self::invalid("createAnswer", state.signaling));
        }
        state.ops.push(FakeOp::CreateAnswer);
        Ok(Self::describe(&mut state, SdpType::Answer, false))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let completed = {
            let mut state = self.state.lock();
            let next = match (state.signaling, description.sdp_type) {
                (SignalingState::Stable | SignalingState::HaveLocalOffer, SdpType::Offer) => {
                    SignalingState::HaveLocalOffer
                }
                (SignalingState::HaveRemoteOffer, SdpType::Answer) => SignalingState::Stable,
                (current, _) => return Err(Self::invalid("setLocalDescription", current)),
            };
            state.ops.push(FakeOp::SetLocal(description.sdp_type));
            state.signaling = next;
            next == SignalingState::Stable
        };

        self.gather_candidate();
        if completed {
            self.round_completed();
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let completed = {
            let mut state = self.state.lock();
            if description.sdp_type == SdpType::Offer && state.failing_remote_offers > 0 {
                state.failing_remote_offers -= 1;
                return Err(Error::PeerConnection(
                    "remote fingerprint does not match".to_string(),
                ));
            }
            if description.sdp_type == SdpType::Answer && state.failing_remote_answers > 0 {
                state.failing_remote_answers -= 1;
                return Err(Error::PeerConnection(
                    "answer does not match the local offer".to_string(),
                ));
            }
            let next = match (state.signaling, description.sdp_type) {
                (SignalingState::Stable | SignalingState::HaveRemoteOffer, SdpType::Offer) => {
                    SignalingState::HaveRemoteOffer
                }
                (SignalingState::HaveLocalOffer, SdpType::Answer) => SignalingState::Stable,
                (current, _) => return Err(Self::invalid("setRemoteDescription", current)),
            };
            state.ops.push(FakeOp::SetRemote(description.sdp_type));
            state.signaling = next;
            state.has_remote_description = true;
            if description.sdp.contains("a=ice-restart") {
                state.restart_in_progress = true;
            }
            next == SignalingState::Stable
        };

        self.announce_remote_tracks(&description);
        if completed {
            self.round_completed();
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !matches!(
            state.signaling,
            SignalingState::HaveLocalOffer | SignalingState::HaveRemoteOffer
        ) {
            return Err(Self::invalid("rollback", state.signaling));
        }
        state.ops.push(FakeOp::Rollback);
        state.signaling = SignalingState::Stable;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if !state.has_remote_description {
            return Err(Error::PeerConnection(
                "no remote description for candidate".to_string(),
            ));
        }
        if candidate.candidate.contains("malformed") {
            return Err(Error::PeerConnection(format!(
                "cannot parse candidate {}",
                candidate.candidate
            )));
        }
        state.ops.push(FakeOp::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let mut state = self.state.lock();
        if state.senders.contains_key(&track.kind) {
            return Err(Error::PeerConnection(format!(
                "already sending {}",
                track.kind
            )));
        }
        state.senders.insert(track.kind, track.id.clone());
        state.ops.push(FakeOp::AddTrack(track.kind, track.id.clone()));
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<()> {
        let mut state = self.state.lock();
        if !state.replace_supported || !state.senders.contains_key(&track.kind) {
            return Err(Error::PeerConnection(format!(
                "no replaceable {} sender",
                track.kind
            )));
        }
        if state.failing_replace == Some(track.kind) {
            state.failing_replace = None;
            return Err(Error::PeerConnection(format!(
                "{} device unavailable",
                track.label
            )));
        }
        state.senders.insert(track.kind, track.id.clone());
        state
            .ops
            .push(FakeOp::ReplaceTrack(track.kind, track.id.clone()));
        Ok(())
    }

    async fn remove_track(&self, kind: MediaKind) -> Result<()> {
        let mut state = self.state.lock();
        if state.senders.remove(&kind).is_none() {
            return Err(Error::PeerConnection(format!("not sending {kind}")));
        }
        state.ops.push(FakeOp::RemoveTrack(kind));
        Ok(())
    }

    fn supports_replace(&self, _kind: MediaKind) -> bool {
        self.state.lock().replace_supported
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.signaling = SignalingState::Closed;
        state.ice = IceConnectionState::Closed;
        state.ops.push(FakeOp::Close);
        Ok(())
    }
}

/// Factory handing out [`FakePeerConnection`]s and keeping them for inspection
#[derive(Debug)]
pub struct FakeFactory {
    created: Mutex<Vec<Arc<FakePeerConnection>>>,
    auto_connect: bool,
}

impl Default for FakeFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeFactory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            auto_connect: true,
        }
    }

    /// Connections that never report ICE progress on their own
    #[must_use]
    pub fn manual() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            auto_connect: false,
        }
    }

    /// Most recently created connection
    #[must_use]
    pub fn latest(&self) -> Option<Arc<FakePeerConnection>> {
        self.created.lock().last().cloned()
    }

    #[must_use]
    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<FakePeerConnection>> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnectionHandle>> {
        let connection = Arc::new(FakePeerConnection::with_auto_connect(
            events,
            self.auto_connect,
        ));
        self.created.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}
