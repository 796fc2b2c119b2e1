//! Audio Handler - Microphone Capture
//!
//! Uses cpal for cross-platform audio input. Capture currently feeds the
//! input level meter and the mute flag; encoded audio flows through the
//! WebRTC engine's own pipeline.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample rate (48kHz, the Opus native rate).
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (mono for voice).
pub const CHANNELS: u16 = 1;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// AUDIO HANDLER
// ============================================================================

/// Handler for microphone input.
///
/// Note: cpal's Stream is not Send, so the handler keeps it in an Option
/// that is dropped on stop().
pub struct AudioHandler {
    input_device: Option<Device>,
    input_stream: Option<Stream>,

    /// Mute flag read by the capture callback.
    is_muted: Arc<Mutex<bool>>,

    /// Input level (0.0 - 1.0) for the UI meter.
    input_level: Arc<Mutex<f32>>,
}

// The contained Stream stays on this handler for its whole lifetime and
// is only dropped, never driven, from other threads.
unsafe impl Send for AudioHandler {}

impl AudioHandler {
    pub fn new() -> Result<Self, AudioError> {
        let host = cpal::default_host();

        let input_device = host.default_input_device();
        if input_device.is_none() {
            tracing::warn!("No audio input device found");
        }

        tracing::info!(
            "AudioHandler initialized: {}Hz, {} channel(s)",
            SAMPLE_RATE,
            CHANNELS
        );

        Ok(Self {
            input_device,
            input_stream: None,
            is_muted: Arc::new(Mutex::new(false)),
            input_level: Arc::new(Mutex::new(0.0)),
        })
    }

    /// Starts microphone capture.
    pub fn start_capture(&mut self) -> Result<(), AudioError> {
        let device = self
            .input_device
            .as_ref()
            .ok_or(AudioError::NoInputDevice)?;

        let config = Self::find_best_input_config(device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let is_muted = Arc::clone(&self.is_muted);
        let input_level = Arc::clone(&self.input_level);

        // TODO: feed captured frames through an Opus encoder into the
        // local audio track once the encode path is in place.
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let rms: f32 =
                        (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    let muted = *is_muted.lock();
                    *input_level.lock() = if muted { 0.0 } else { rms.min(1.0) };
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        self.input_stream = Some(stream);
        Ok(())
    }

    /// Stops capture.
    pub fn stop(&mut self) {
        self.input_stream = None;
        tracing::info!("Audio capture stopped");
    }

    pub fn set_muted(&self, muted: bool) {
        *self.is_muted.lock() = muted;
        tracing::debug!("Audio muted: {}", muted);
    }

    pub fn is_muted(&self) -> bool {
        *self.is_muted.lock()
    }

    /// Current input level (0.0 - 1.0).
    pub fn input_level(&self) -> f32 {
        *self.input_level.lock()
    }

    fn find_best_input_config(device: &Device) -> Result<StreamConfig, AudioError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

        Self::select_best_config(configs.collect())
    }

    /// Picks a configuration, preferring 48kHz F32.
    fn select_best_config(
        configs: Vec<SupportedStreamConfigRange>,
    ) -> Result<StreamConfig, AudioError> {
        let target_rate = cpal::SampleRate(SAMPLE_RATE);

        for config in &configs {
            if config.min_sample_rate() <= target_rate
                && config.max_sample_rate() >= target_rate
                && config.sample_format() == SampleFormat::F32
            {
                return Ok(config.with_sample_rate(target_rate).into());
            }
        }

        // Fall back to any F32 configuration at its closest rate.
        for config in &configs {
            if config.sample_format() == SampleFormat::F32 {
                let rate = if config.min_sample_rate() <= target_rate
                    && config.max_sample_rate() >= target_rate
                {
                    target_rate
                } else {
                    config.max_sample_rate()
                };
                return Ok(config.with_sample_rate(rate).into());
            }
        }

        if let Some(config) = configs.first() {
            return Ok(config.with_max_sample_rate().into());
        }

        Err(AudioError::UnsupportedConfig(
            "No suitable audio configuration found".to_string(),
        ))
    }

    /// True when a capture device is present.
    pub fn has_input_device(&self) -> bool {
        self.input_device.is_some()
    }
}

impl std::fmt::Debug for AudioHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioHandler")
            .field("capturing", &self.input_stream.is_some())
            .field("is_muted", &self.is_muted())
            .finish()
    }
}
