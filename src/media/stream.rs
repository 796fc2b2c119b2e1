//! Media Stream - Local Track Ownership
//!
//! A MediaStream is what the UI acquires with Start and hands to the
//! call engine with Call. It owns the local tracks plus the microphone
//! capture handler; releasing the stream stops capture and drops the
//! tracks.

use super::audio::{AudioError, AudioHandler, SAMPLE_RATE};
use super::devices::{self, CameraDevice};
use crate::call::types::TrackKind;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("No camera available")]
    NoCamera,

    #[error("Device enumeration failed: {0}")]
    DeviceQuery(String),

    #[error("Stream has no video track")]
    NoVideoTrack,

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),
}

// ============================================================================
// LOCAL TRACKS
// ============================================================================

/// Camera assignment of a video track; switching cycles through the
/// cameras present at acquisition time.
struct CameraSwitch {
    cameras: Vec<CameraDevice>,
    active: Mutex<usize>,
}

/// A locally captured track, backed by a webrtc-rs sample track.
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    rtc: Arc<TrackLocalStaticSample>,
    camera: Option<Arc<CameraSwitch>>,
}

impl LocalTrack {
    pub(crate) fn audio() -> Self {
        let id = Uuid::new_v4().to_string();
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            id.clone(),
            "loopcall".to_string(),
        ));

        Self {
            id,
            kind: TrackKind::Audio,
            rtc,
            camera: None,
        }
    }

    pub(crate) fn video(cameras: Vec<CameraDevice>) -> Self {
        let id = Uuid::new_v4().to_string();
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            id.clone(),
            "loopcall".to_string(),
        ));

        Self {
            id,
            kind: TrackKind::Video,
            rtc,
            camera: Some(Arc::new(CameraSwitch {
                cameras,
                active: Mutex::new(0),
            })),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// The underlying webrtc-rs track, for attaching to a peer connection.
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc)
    }

    /// The camera this video track currently captures from.
    pub fn active_camera(&self) -> Option<CameraDevice> {
        let switch = self.camera.as_ref()?;
        let active = *switch.active.lock();
        switch.cameras.get(active).cloned()
    }

    /// Cycles the video track to the next camera. Returns the name of the
    /// newly active camera. Has no effect on any peer connection.
    pub fn switch_camera(&self) -> Result<String, MediaError> {
        let switch = self.camera.as_ref().ok_or(MediaError::NoVideoTrack)?;
        if switch.cameras.is_empty() {
            return Err(MediaError::NoCamera);
        }

        let mut active = switch.active.lock();
        *active = (*active + 1) % switch.cameras.len();
        let name = switch.cameras[*active].name.clone();

        tracing::info!("Switched camera to '{}'", name);
        Ok(name)
    }
}

// ============================================================================
// MEDIA STREAM
// ============================================================================

/// A local media stream with zero or more tracks.
pub struct MediaStream {
    id: String,
    tracks: Vec<LocalTrack>,
    audio: Option<AudioHandler>,
}

impl MediaStream {
    /// Acquires a local stream with the requested kinds.
    ///
    /// Requesting audio starts microphone capture; requesting video
    /// requires at least one camera. With both flags off the stream is
    /// empty, which is still a valid input for a call.
    pub fn get_user_media(audio: bool, video: bool) -> Result<Self, MediaError> {
        let mut tracks = Vec::new();
        let mut audio_handler = None;

        if audio {
            let mut handler = AudioHandler::new()?;
            handler.start_capture()?;
            audio_handler = Some(handler);
            tracks.push(LocalTrack::audio());
        }

        if video {
            let cameras = devices::list_cameras()?;
            if cameras.is_empty() {
                return Err(MediaError::NoCamera);
            }
            tracks.push(LocalTrack::video(cameras));
        }

        let stream = Self {
            id: Uuid::new_v4().to_string(),
            tracks,
            audio: audio_handler,
        };

        tracing::info!(
            "Acquired local media stream {} ({} track(s))",
            stream.id,
            stream.tracks.len()
        );
        Ok(stream)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the stream's tracks (cheap: tracks are Arc-backed).
    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.tracks.clone()
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Video)
    }

    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Audio)
    }

    /// Switches the first video track to its next camera.
    pub fn switch_camera(&self) -> Result<String, MediaError> {
        let track = self
            .tracks
            .iter()
            .find(|t| t.kind() == TrackKind::Video)
            .ok_or(MediaError::NoVideoTrack)?;
        track.switch_camera()
    }

    pub fn set_muted(&self, muted: bool) {
        if let Some(audio) = &self.audio {
            audio.set_muted(muted);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.audio.as_ref().map(|a| a.is_muted()).unwrap_or(false)
    }

    /// Microphone input level (0.0 when no audio track exists).
    pub fn input_level(&self) -> f32 {
        self.audio.as_ref().map(|a| a.input_level()).unwrap_or(0.0)
    }

    /// Stops capture and drops all tracks.
    pub fn release(mut self) {
        if let Some(mut audio) = self.audio.take() {
            audio.stop();
        }
        tracing::info!("Released local media stream {}", self.id);
    }
}
