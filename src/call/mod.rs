//! Call Module - Loopback WebRTC
//!
//! This module manages:
//! - The two in-process peer connections
//! - Scripted offer/answer negotiation and candidate forwarding
//! - Call session lifecycle and UI events

mod engine;
mod orchestrator;
mod peer;
mod rtc;
pub mod types;

pub use engine::{CallEngine, CallEvent, CallState};
pub use orchestrator::run_call;
pub use peer::{CallError, PeerEndpoint, EVENT_CHANNEL_CAPACITY};
pub use rtc::RtcPeer;
