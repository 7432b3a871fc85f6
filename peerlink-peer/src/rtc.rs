//! `webrtc` implementation of [`PeerConnectionHandle`]
//!
//! Local tracks are `TrackLocalStaticSample`s (Opus for audio, VP8 for
//! video). The application writes captured samples into them through
//! [`RtcPeerConnection::local_track`] and reads received media through
//! [`RtcPeerConnection::remote_track`]; this module only wires them into the
//! peer connection.
//!
//! `webrtc` refuses a local rollback out of `have-local-offer`, which the
//! glare rule needs on the Responder side. A local offer is therefore staged
//! in the adapter and only applied to the peer connection together with the
//! matching answer; rolling it back just discards it. Local candidate
//! gathering starts when the answer arrives.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use peerlink_core::config::{IceServerConfig, WebRTCConfig};
use peerlink_signaling::{IceCandidate, SdpType, SessionDescription};

use crate::error::{Error, Result};
use crate::handle::{PeerConnectionFactory, PeerConnectionHandle, PeerEvent, PeerEventSink};
use crate::media::{LocalTrack, MediaKind, RemoteTrack};
use crate::state::{ConnectionState, IceConnectionState};

/// Media stream id shared by all local tracks
const LOCAL_STREAM_ID: &str = "peerlink";

impl From<RTCIceConnectionState> for IceConnectionState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => Self::New,
            RTCIceConnectionState::Checking => Self::Checking,
            RTCIceConnectionState::Connected => Self::Connected,
            RTCIceConnectionState::Completed => Self::Completed,
            RTCIceConnectionState::Disconnected => Self::Disconnected,
            RTCIceConnectionState::Failed => Self::Failed,
            RTCIceConnectionState::Closed => Self::Closed,
        }
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

fn media_kind(codec: RTPCodecType) -> Option<MediaKind> {
    match codec {
        RTPCodecType::Audio => Some(MediaKind::Audio),
        RTPCodecType::Video => Some(MediaKind::Video),
        RTPCodecType::Unspecified => None,
    }
}

fn codec_capability(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            ..Default::default()
        },
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let SessionDescription { sdp_type, sdp } = description;
    match sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp).map_err(Error::peer),
        SdpType::Answer => RTCSessionDescription::answer(sdp).map_err(Error::peer),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp).map_err(Error::peer),
        SdpType::Rollback => Err(Error::PeerConnection(
            "rollback is not a transmittable description".to_string(),
        )),
    }
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(Error::PeerConnection(
                "description without a type".to_string(),
            ))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

fn ice_server(server: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: vec![server.url()],
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// A `webrtc` peer connection driven by the negotiation core
pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    /// Local offer handed out but not yet applied to `pc`
    staged_offer: Mutex<Option<RTCSessionDescription>>,
    senders: Mutex<HashMap<MediaKind, Arc<RTCRtpSender>>>,
    local_tracks: DashMap<MediaKind, Arc<TrackLocalStaticSample>>,
    remote_tracks: Arc<DashMap<String, Arc<TrackRemote>>>,
}

impl std::fmt::Debug for RtcPeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcPeerConnection")
            .field("signaling_state", &self.pc.signaling_state())
            .field("offer_staged", &self.staged_offer.lock().is_some())
            .field("senders", &self.senders.lock().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl RtcPeerConnection {
    async fn new(ice_servers: Vec<RTCIceServer>, events: PeerEventSink) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(Error::peer)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(Error::peer)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(Error::peer)?);

        let connection = Self {
            pc,
            staged_offer: Mutex::new(None),
            senders: Mutex::new(HashMap::new()),
            local_tracks: DashMap::new(),
            remote_tracks: Arc::new(DashMap::new()),
        };
        connection.register_callbacks(events);
        Ok(connection)
    }

    fn register_callbacks(&self, events: PeerEventSink) {
        let sink = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                // `None` marks the end of gathering
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(RTCIceCandidateInit {
                            candidate,
                            sdp_mid,
                            sdp_mline_index,
                            username_fragment,
                        }) => {
                            sink.emit(PeerEvent::LocalCandidate(IceCandidate {
                                candidate,
                                sdp_mid,
                                sdp_mline_index,
                                username_fragment,
                            }));
                        }
                        Err(e) => warn!(error = %e, "Failed to serialize local candidate"),
                    }
                }
                Box::pin(async {})
            }));

        let sink = events.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                sink.emit(PeerEvent::IceStateChanged(state.into()));
                Box::pin(async {})
            }));

        let sink = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                sink.emit(PeerEvent::ConnectionStateChanged(state.into()));
                Box::pin(async {})
            }));

        let sink = events;
        let remote_tracks = Arc::clone(&self.remote_tracks);
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                if let Some(kind) = media_kind(track.kind()) {
                    let remote = RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    };
                    debug!(track_id = %remote.id, kind = %kind, "Remote track started");
                    remote_tracks.insert(remote.id.clone(), Arc::clone(&track));
                    sink.emit(PeerEvent::RemoteTrack(remote));
                }
                Box::pin(async {})
            },
        ));
    }

    /// The sample track currently sent for `kind`
    #[must_use]
    pub fn local_track(&self, kind: MediaKind) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.get(&kind).map(|t| Arc::clone(t.value()))
    }

    /// A received track, by the id reported in [`PeerEvent::RemoteTrack`]
    #[must_use]
    pub fn remote_track(&self, id: &str) -> Option<Arc<TrackRemote>> {
        self.remote_tracks.get(id).map(|t| Arc::clone(t.value()))
    }

    fn sample_track(track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            codec_capability(track.kind),
            track.id.to_string(),
            LOCAL_STREAM_ID.to_string(),
        ))
    }

    fn sender(&self, kind: MediaKind) -> Result<Arc<RTCRtpSender>> {
        self.senders
            .lock()
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::PeerConnection(format!("no {kind} sender")))
    }
}

#[async_trait]
impl PeerConnectionHandle for RtcPeerConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = RTCOfferOptions {
            ice_restart,
            voice_activity_detection: false,
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(Error::peer)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(Error::peer)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        if description.sdp_type != RTCSdpType::Offer {
            return self
                .pc
                .set_local_description(description)
                .await
                .map_err(Error::peer);
        }

        match self.pc.signaling_state() {
            RTCSignalingState::Stable => {
                *self.staged_offer.lock() = Some(description);
                debug!("Local offer staged until answered");
                Ok(())
            }
            other => Err(Error::PeerConnection(format!(
                "cannot apply local offer in {other}"
            ))),
        }
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        let staged = self.staged_offer.lock().take();
        match (staged, description.sdp_type) {
            (Some(offer), RTCSdpType::Answer) => {
                self.pc
                    .set_local_description(offer)
                    .await
                    .map_err(Error::peer)?;
            }
            (Some(offer), _) => {
                *self.staged_offer.lock() = Some(offer);
                return Err(Error::PeerConnection(format!(
                    "cannot apply remote {} with a local offer outstanding",
                    description.sdp_type
                )));
            }
            (None, _) => {}
        }
        self.pc
            .set_remote_description(description)
            .await
            .map_err(Error::peer)
    }

    async fn rollback(&self) -> Result<()> {
        if self.staged_offer.lock().take().is_some() {
            debug!("Staged local offer discarded");
            return Ok(());
        }

        // The pending description is reused so the rollback carries a parseable SDP
        let result = match self.pc.signaling_state() {
            RTCSignalingState::HaveRemoteOffer => {
                let mut rollback = self
                    .pc
                    .pending_remote_description()
                    .await
                    .unwrap_or_default();
                rollback.sdp_type = RTCSdpType::Rollback;
                self.pc.set_remote_description(rollback).await
            }
            other => {
                return Err(Error::PeerConnection(format!(
                    "nothing to roll back in {other}"
                )))
            }
        };
        result.map_err(Error::peer)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let IceCandidate {
            candidate,
            sdp_mid,
            sdp_mline_index,
            username_fragment,
        } = candidate;
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate,
                sdp_mid,
                sdp_mline_index,
                username_fragment,
            })
            .await
            .map_err(Error::peer)
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let local = Self::sample_track(track);
        let sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(Error::peer)?;

        // RTCP has to be read for interceptors (NACK, reports) to work
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        self.senders.lock().insert(track.kind, sender);
        self.local_tracks.insert(track.kind, local);
        debug!(kind = %track.kind, track_id = %track.id, "Local track added");
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<()> {
        let sender = self.sender(track.kind)?;
        let local = Self::sample_track(track);
        sender
            .replace_track(Some(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(Error::peer)?;
        self.local_tracks.insert(track.kind, local);
        Ok(())
    }

    async fn remove_track(&self, kind: MediaKind) -> Result<()> {
        let sender = self.sender(kind)?;
        self.pc.remove_track(&sender).await.map_err(Error::peer)?;
        self.senders.lock().remove(&kind);
        self.local_tracks.remove(&kind);
        Ok(())
    }

    fn supports_replace(&self, kind: MediaKind) -> bool {
        self.senders.lock().contains_key(&kind)
    }

    async fn close(&self) -> Result<()> {
        self.staged_offer.lock().take();
        self.senders.lock().clear();
        self.local_tracks.clear();
        self.remote_tracks.clear();
        self.pc.close().await.map_err(Error::peer)
    }
}

/// Creates [`RtcPeerConnection`]s with the configured ICE servers
#[derive(Debug)]
pub struct RtcPeerConnectionFactory {
    ice_servers: Vec<RTCIceServer>,
    current: Mutex<Option<Arc<RtcPeerConnection>>>,
}

impl RtcPeerConnectionFactory {
    #[must_use]
    pub fn new(config: &WebRTCConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.iter().map(ice_server).collect(),
            current: Mutex::new(None),
        }
    }

    /// The connection created last; replaced on every reinitialization
    #[must_use]
    pub fn current(&self) -> Option<Arc<RtcPeerConnection>> {
        self.current.lock().clone()
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerConnectionFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnectionHandle>> {
        let generation = events.generation();
        let connection = Arc::new(RtcPeerConnection::new(self.ice_servers.clone(), events).await?);
        *self.current.lock() = Some(Arc::clone(&connection));
        debug!(generation, "Peer connection created");
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::config::IceScheme;
    use tokio::sync::mpsc;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            IceConnectionState::from(RTCIceConnectionState::Unspecified),
            IceConnectionState::New
        );
        assert_eq!(
            IceConnectionState::from(RTCIceConnectionState::Disconnected),
            IceConnectionState::Disconnected
        );
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Failed),
            ConnectionState::Failed
        );
    }

    #[test]
    fn test_turn_server_carries_credentials() {
        let server = IceServerConfig {
            scheme: IceScheme::Turn,
            host: "turn.example.com".to_string(),
            port: 3478,
            username: Some("user".to_string()),
            credential: Some("secret".to_string()),
        };
        let rtc = ice_server(&server);
        assert_eq!(rtc.urls, vec!["turn:turn.example.com:3478".to_string()]);
        assert_eq!(rtc.username, "user");
        assert_eq!(rtc.credential, "secret");
    }

    #[test]
    fn test_rollback_is_not_transmittable() {
        let rollback = SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        };
        assert!(to_rtc_description(rollback).is_err());
    }

    #[tokio::test]
    async fn test_offer_lists_local_media() {
        let factory = RtcPeerConnectionFactory::new(&WebRTCConfig {
            ice_servers: Vec::new(),
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = factory.create(PeerEventSink::new(1, tx)).await.unwrap();

        handle.add_track(&LocalTrack::audio("microphone")).await.unwrap();
        handle.add_track(&LocalTrack::video("camera")).await.unwrap();
        assert!(handle.supports_replace(MediaKind::Video));

        let offer = handle.create_offer(false).await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        let current = factory.current().unwrap();
        assert!(current.local_track(MediaKind::Audio).is_some());

        handle.close().await.unwrap();
    }

    async fn connection(factory: &RtcPeerConnectionFactory) -> Arc<dyn PeerConnectionHandle> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = factory.create(PeerEventSink::new(0, tx)).await.unwrap();
        handle.add_track(&LocalTrack::audio("microphone")).await.unwrap();
        handle.add_track(&LocalTrack::video("camera")).await.unwrap();
        handle
    }

    #[tokio::test]
    async fn test_responder_yields_in_glare() {
        let factory = RtcPeerConnectionFactory::new(&WebRTCConfig {
            ice_servers: Vec::new(),
        });
        let initiator = connection(&factory).await;
        let responder = connection(&factory).await;

        // Both sides offer at once
        let offer_a = initiator.create_offer(false).await.unwrap();
        initiator.set_local_description(offer_a.clone()).await.unwrap();
        let offer_b = responder.create_offer(false).await.unwrap();
        responder.set_local_description(offer_b).await.unwrap();

        // The Responder withdraws its offer and answers
        responder.rollback().await.unwrap();
        responder.set_remote_description(offer_a).await.unwrap();
        let answer = responder.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        responder.set_local_description(answer.clone()).await.unwrap();
        initiator.set_remote_description(answer).await.unwrap();

        // Then re-issues its renegotiation on the settled connection
        let reoffer = responder.create_offer(false).await.unwrap();
        responder.set_local_description(reoffer.clone()).await.unwrap();
        initiator.set_remote_description(reoffer).await.unwrap();
        let answer = initiator.create_answer().await.unwrap();
        initiator.set_local_description(answer.clone()).await.unwrap();
        responder.set_remote_description(answer).await.unwrap();

        initiator.close().await.unwrap();
        responder.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_offer_rejected_while_offer_outstanding() {
        let factory = RtcPeerConnectionFactory::new(&WebRTCConfig {
            ice_servers: Vec::new(),
        });
        let a = connection(&factory).await;
        let b = connection(&factory).await;

        let offer_a = a.create_offer(false).await.unwrap();
        a.set_local_description(offer_a.clone()).await.unwrap();
        let offer_b = b.create_offer(false).await.unwrap();
        b.set_local_description(offer_b).await.unwrap();

        assert!(matches!(
            b.set_remote_description(offer_a).await,
            Err(Error::PeerConnection(_))
        ));
        // The outstanding offer survives and can still be withdrawn
        b.rollback().await.unwrap();
        assert!(b.rollback().await.is_err());

        a.close().await.unwrap();
        b.close().await.unwrap();
    }
}
