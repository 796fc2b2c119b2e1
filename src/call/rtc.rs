//! WebRTC Peer Adapter
//!
//! Wraps a webrtc-rs RTCPeerConnection behind [`PeerEndpoint`]: builds
//! the API with default codecs and interceptors, registers the event
//! handlers once at construction and republishes everything they see on
//! broadcast channels for the orchestrator.

use super::peer::{CallError, PeerEndpoint, EVENT_CHANNEL_CAPACITY};
use super::types::{
    ConnectionState, IceCandidate, IceConnectionState, OfferOptions, RemoteTrack, SdpType,
    SessionDescription, SignalingState, TrackKind,
};
use crate::media::LocalTrack;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// STUN configuration; a `LOOPCALL_STUN_URL` override (read by the
/// caller) replaces the default Google servers. A loopback call
/// connects over host candidates either way.
pub fn default_ice_servers(stun_override: Option<String>) -> Vec<RTCIceServer> {
    let urls = match stun_override {
        Some(url) => vec![url],
        None => vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
    };

    vec![RTCIceServer {
        urls,
        ..Default::default()
    }]
}

// ============================================================================
// TYPE CONVERSIONS
// ============================================================================

impl From<RTCSignalingState> for SignalingState {
    fn from(state: RTCSignalingState) -> Self {
        match state {
            RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
        }
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                ConnectionState::New
            }
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

impl From<RTCIceConnectionState> for IceConnectionState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => {
                IceConnectionState::New
            }
            RTCIceConnectionState::Checking => IceConnectionState::Checking,
            RTCIceConnectionState::Connected => IceConnectionState::Connected,
            RTCIceConnectionState::Completed => IceConnectionState::Completed,
            RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
            RTCIceConnectionState::Failed => IceConnectionState::Failed,
            RTCIceConnectionState::Closed => IceConnectionState::Closed,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, CallError> {
    let result = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    result.map_err(|e| CallError::InvalidSdp(e.to_string()))
}

// ============================================================================
// RTC PEER
// ============================================================================

/// One endpoint of the loopback pair, backed by webrtc-rs.
pub struct RtcPeer {
    label: &'static str,
    pc: Arc<RTCPeerConnection>,
    candidate_tx: broadcast::Sender<IceCandidate>,
    signaling_tx: broadcast::Sender<SignalingState>,
    connection_tx: broadcast::Sender<ConnectionState>,
    ice_connection_tx: broadcast::Sender<IceConnectionState>,
    track_tx: broadcast::Sender<RemoteTrack>,
}

impl RtcPeer {
    /// Builds the API, creates the peer connection and registers all
    /// event handlers before anything can fire.
    pub async fn connect(label: &'static str) -> Result<Arc<Self>, CallError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| CallError::Engine(e.to_string()))?;

        // Interceptors for RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| CallError::Engine(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: default_ice_servers(std::env::var("LOOPCALL_STUN_URL").ok()),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| CallError::Engine(e.to_string()))?,
        );

        let peer = Arc::new(Self {
            label,
            pc,
            candidate_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            signaling_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            connection_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            ice_connection_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            track_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        });
        peer.register_handlers();

        tracing::debug!("{} peer connection created", label);
        Ok(peer)
    }

    /// Republishes the engine callbacks onto the broadcast channels.
    ///
    /// Handlers return immediately; blocking here would stall the
    /// engine's callback dispatch.
    fn register_handlers(&self) {
        let label = self.label;

        let candidate_tx = self.candidate_tx.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx.send(IceCandidate::from(init));
                    }
                    Err(e) => tracing::error!("{} failed to serialize candidate: {}", label, e),
                }
            } else {
                tracing::debug!("{} candidate gathering complete", label);
            }
            Box::pin(async {})
        }));

        let signaling_tx = self.signaling_tx.clone();
        self.pc
            .on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
                let _ = signaling_tx.send(SignalingState::from(state));
                Box::pin(async {})
            }));

        let connection_tx = self.connection_tx.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let _ = connection_tx.send(ConnectionState::from(state));
                Box::pin(async {})
            }));

        let ice_connection_tx = self.ice_connection_tx.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let _ = ice_connection_tx.send(IceConnectionState::from(state));
                Box::pin(async {})
            }));

        let track_tx = self.track_tx.clone();
        self.pc.on_track(Box::new(move |track, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                RTPCodecType::Unspecified => None,
            };
            match kind {
                Some(kind) => {
                    let _ = track_tx.send(RemoteTrack {
                        id: track.id(),
                        kind,
                    });
                }
                None => tracing::warn!("{} inbound track with unspecified kind", label),
            }
            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl PeerEndpoint for RtcPeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), CallError> {
        self.pc
            .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| CallError::Engine(e.to_string()))?;
        tracing::debug!("{} added local {} track", self.label, track.kind());
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, CallError> {
        // webrtc-rs has no offerToReceive* flags; recvonly transceivers
        // put the m-lines into the offer instead.
        if options.offer_to_receive_audio {
            self.pc
                .add_transceiver_from_kind(
                    RTPCodecType::Audio,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| CallError::Engine(e.to_string()))?;
        }
        if options.offer_to_receive_video {
            self.pc
                .add_transceiver_from_kind(
                    RTPCodecType::Video,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| CallError::Engine(e.to_string()))?;
        }

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| CallError::Engine(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| CallError::Engine(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| CallError::Engine(e.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| CallError::Engine(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit::from(candidate))
            .await
            .map_err(|e| CallError::Engine(e.to_string()))
    }

    async fn close(&self) -> Result<(), CallError> {
        self.pc
            .close()
            .await
            .map_err(|e| CallError::Engine(e.to_string()))
    }

    fn signaling_state(&self) -> SignalingState {
        SignalingState::from(self.pc.signaling_state())
    }

    fn ice_candidates(&self) -> broadcast::Receiver<IceCandidate> {
        self.candidate_tx.subscribe()
    }

    fn signaling_state_changes(&self) -> broadcast::Receiver<SignalingState> {
        self.signaling_tx.subscribe()
    }

    fn connection_state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.connection_tx.subscribe()
    }

    fn ice_connection_state_changes(&self) -> broadcast::Receiver<IceConnectionState> {
        self.ice_connection_tx.subscribe()
    }

    fn inbound_tracks(&self) -> broadcast::Receiver<RemoteTrack> {
        self.track_tx.subscribe()
    }
}
