//! Peer Connection Capability Surface
//!
//! The orchestrator only ever talks to this trait. The production
//! implementation ([`crate::call::RtcPeer`]) wraps a webrtc-rs peer
//! connection; tests substitute a scripted mock.

use super::types::{
    ConnectionState, IceCandidate, IceConnectionState, OfferOptions, RemoteTrack,
    SessionDescription, SignalingState,
};
use crate::media::LocalTrack;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

/// Capacity of the per-stream event channels.
///
/// Events are buffered here until the orchestrator drains them, so the
/// capacity bounds how far event production may run ahead of handling.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("WebRTC error: {0}")]
    Engine(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Peer event stream closed")]
    StreamClosed,

    #[error("No active call")]
    NoActiveCall,

    #[error("Already in a call")]
    AlreadyInCall,
}

// ============================================================================
// PEER ENDPOINT TRAIT
// ============================================================================

/// One endpoint of the loopback call.
///
/// Mutating operations mirror the standard peer-connection API; the
/// `*_changes`/`ice_candidates`/`inbound_tracks` methods hand out fresh
/// broadcast subscriptions. Events on a single stream arrive in order;
/// different streams have no relative ordering guarantee.
#[async_trait]
pub trait PeerEndpoint: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), CallError>;

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, CallError>;

    async fn create_answer(&self) -> Result<SessionDescription, CallError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;

    async fn close(&self) -> Result<(), CallError>;

    /// Current offer/answer negotiation state.
    fn signaling_state(&self) -> SignalingState;

    fn ice_candidates(&self) -> broadcast::Receiver<IceCandidate>;

    fn signaling_state_changes(&self) -> broadcast::Receiver<SignalingState>;

    fn connection_state_changes(&self) -> broadcast::Receiver<ConnectionState>;

    fn ice_connection_state_changes(&self) -> broadcast::Receiver<IceConnectionState>;

    fn inbound_tracks(&self) -> broadcast::Receiver<RemoteTrack>;
}
