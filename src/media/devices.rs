//! Device Enumeration
//!
//! Cameras are listed through nokhwa, audio devices through cpal. Both
//! lists are snapshots; devices can appear or vanish at any time.

use super::stream::MediaError;
use serde::Serialize;

// ============================================================================
// CAMERAS
// ============================================================================

/// A connected camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraDevice {
    pub index: u32,
    pub name: String,
}

/// Lists the cameras visible to the platform backend.
pub fn list_cameras() -> Result<Vec<CameraDevice>, MediaError> {
    let cameras = nokhwa::query(nokhwa::utils::ApiBackend::Auto)
        .map_err(|e| MediaError::DeviceQuery(e.to_string()))?;

    let devices: Vec<CameraDevice> = cameras
        .into_iter()
        .enumerate()
        .map(|(index, info)| CameraDevice {
            index: index as u32,
            name: info.human_name(),
        })
        .collect();

    tracing::debug!("Found {} camera(s)", devices.len());
    Ok(devices)
}

// ============================================================================
// AUDIO DEVICES
// ============================================================================

/// A connected audio device.
#[derive(Debug, Clone, Serialize)]
pub struct AudioDevice {
    pub name: String,
    pub is_default: bool,
}

/// Lists audio input and output devices.
pub fn audio_devices() -> Result<(Vec<AudioDevice>, Vec<AudioDevice>), MediaError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    let input_devices: Vec<AudioDevice> = host
        .input_devices()
        .map_err(|e| MediaError::DeviceQuery(e.to_string()))?
        .filter_map(|d| {
            d.name().ok().map(|name| AudioDevice {
                is_default: Some(&name) == default_input.as_ref(),
                name,
            })
        })
        .collect();

    let output_devices: Vec<AudioDevice> = host
        .output_devices()
        .map_err(|e| MediaError::DeviceQuery(e.to_string()))?
        .filter_map(|d| {
            d.name().ok().map(|name| AudioDevice {
                is_default: Some(&name) == default_output.as_ref(),
                name,
            })
        })
        .collect();

    Ok((input_devices, output_devices))
}
