//! Media Module - Local Capture
//!
//! This module manages:
//! - Local media stream acquisition (microphone + camera)
//! - Microphone capture and level metering
//! - Device enumeration and camera switching

mod audio;
pub mod devices;
mod stream;

pub use audio::{AudioError, AudioHandler, SAMPLE_RATE};
pub use stream::{LocalTrack, MediaError, MediaStream};
