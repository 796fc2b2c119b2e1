//! Signaling Domain Types
//!
//! Plain data shared between the orchestrator, the peer-connection
//! adapter and the UI layer. SDP travels as strings and is only parsed
//! at the engine boundary.

use serde::{Deserialize, Serialize};

// ============================================================================
// SIGNALING STATE
// ============================================================================

/// Offer/answer negotiation state of one peer connection.
///
/// Tracks the SDP exchange only; actual network connectivity is reported
/// separately via [`ConnectionState`] and [`IceConnectionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

// ============================================================================
// SESSION DESCRIPTIONS
// ============================================================================

/// Whether a description is an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP session description exchanged between the two endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Options for offer creation.
///
/// webrtc-rs has no `offerToReceive*` flags; the adapter realizes these
/// by adding recvonly transceivers before creating the offer.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfferOptions {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
}

// ============================================================================
// ICE CANDIDATES
// ============================================================================

/// A potential network path advertised by a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
    pub username_fragment: Option<String>,
}

// ============================================================================
// CONNECTION STATES (observability only)
// ============================================================================

/// Aggregate peer-connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ICE transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

// ============================================================================
// TRACKS
// ============================================================================

/// Media kind of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Descriptor for an inbound track surfaced by a peer connection.
///
/// Rendering and decoding stay inside the WebRTC engine and the UI; the
/// orchestrator only reports which tracks became available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_description_constructors_set_kind() {
        assert_eq!(SessionDescription::offer("v=0").kind, SdpType::Offer);
        assert_eq!(SessionDescription::answer("v=0").kind, SdpType::Answer);
    }

    #[test]
    fn ice_candidate_serializes_camel_case() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 127.0.0.1 54400 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };

        let json = serde_json::to_string(&candidate).unwrap();
        assert!(json.contains("\"sdpMid\":\"0\""));
        assert!(json.contains("\"sdpMLineIndex\":0") || json.contains("\"sdpMlineIndex\":0"));
    }
}
