//! Loopcall - Loopback WebRTC Video Call Sample
//!
//! A desktop sample application demonstrating a local loopback call:
//! - Camera/microphone capture
//! - Two in-process WebRTC peer connections
//! - Scripted offer/answer negotiation with candidate forwarding
//! - Call state and remote tracks surfaced to the frontend

pub mod call;
pub mod media;

use call::{CallEngine, CallEvent, CallState};
use media::devices::{self, AudioDevice, CameraDevice};
use media::MediaStream;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::Arc;
use tauri::{AppHandle, Emitter, Manager, State};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Global application state.
pub struct AppState {
    media: Mutex<Option<MediaStream>>,
    engine: Arc<CallEngine>,
}

/// Singleton for the AppState.
static APP_STATE: OnceCell<Arc<AppState>> = OnceCell::new();

impl AppState {
    /// Initializes logging and the application state.
    pub fn init() -> Result<Arc<Self>, String> {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("loopcall=debug".parse().unwrap())
                    .add_directive("webrtc=warn".parse().unwrap()),
            )
            .init();

        tracing::info!("Initializing loopcall...");

        let state = Arc::new(Self {
            media: Mutex::new(None),
            engine: Arc::new(CallEngine::new()),
        });

        APP_STATE
            .set(Arc::clone(&state))
            .map_err(|_| "AppState already initialized")?;

        Ok(state)
    }

    /// Returns the global AppState.
    pub fn get() -> Option<Arc<Self>> {
        APP_STATE.get().cloned()
    }
}

// ============================================================================
// TAURI COMMANDS - MEDIA
// ============================================================================

/// Snapshot of the local and remote media situation for the frontend.
#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStatus {
    local_stream: bool,
    local_audio: bool,
    local_video: bool,
    remote_audio: bool,
    remote_video: bool,
    in_call: bool,
    muted: bool,
    active_camera: Option<String>,
}

fn media_status_snapshot(state: &AppState) -> MediaStatus {
    let media = state.media.lock();
    let remote = state.engine.remote_tracks();

    MediaStatus {
        local_stream: media.is_some(),
        local_audio: media.as_ref().map(|m| m.has_audio()).unwrap_or(false),
        local_video: media.as_ref().map(|m| m.has_video()).unwrap_or(false),
        remote_audio: remote
            .iter()
            .any(|t| t.kind == call::types::TrackKind::Audio),
        remote_video: remote
            .iter()
            .any(|t| t.kind == call::types::TrackKind::Video),
        in_call: state.engine.state() != CallState::Idle,
        muted: media.as_ref().map(|m| m.is_muted()).unwrap_or(false),
        active_camera: media.as_ref().and_then(|m| {
            m.tracks()
                .iter()
                .find_map(|t| t.active_camera().map(|c| c.name))
        }),
    }
}

/// Acquires the local media stream (Start button).
#[tauri::command]
async fn start_media(
    audio: bool,
    video: bool,
    state: State<'_, Arc<AppState>>,
    app_handle: AppHandle,
) -> Result<MediaStatus, String> {
    tracing::info!("Starting local media (audio: {}, video: {})", audio, video);

    {
        let media = state.media.lock();
        if media.is_some() {
            return Err("Local media already started".to_string());
        }
    }

    let stream = MediaStream::get_user_media(audio, video).map_err(|e| e.to_string())?;
    *state.media.lock() = Some(stream);

    let _ = app_handle.emit("media:started", ());
    Ok(media_status_snapshot(&state))
}

/// Releases the local media stream (Stop button).
///
/// Stop implies hangup: an active call is torn down first, then the
/// stream and the microphone capture are released.
#[tauri::command]
async fn stop_media(
    state: State<'_, Arc<AppState>>,
    app_handle: AppHandle,
) -> Result<(), String> {
    tracing::info!("Stopping local media");

    state.engine.hangup_if_active();

    let stream = state
        .media
        .lock()
        .take()
        .ok_or("No local media started")?;
    stream.release();

    let _ = app_handle.emit("media:stopped", ());
    Ok(())
}

/// Cycles the video track to the next camera. Returns the new camera name.
#[tauri::command]
async fn switch_camera(state: State<'_, Arc<AppState>>) -> Result<String, String> {
    let media = state.media.lock();
    let stream = media.as_ref().ok_or("No local media started")?;
    stream.switch_camera().map_err(|e| e.to_string())
}

/// Returns the current media status.
#[tauri::command]
async fn media_status(state: State<'_, Arc<AppState>>) -> Result<MediaStatus, String> {
    Ok(media_status_snapshot(&state))
}

/// Sets the microphone mute flag.
#[tauri::command]
async fn set_muted(muted: bool, state: State<'_, Arc<AppState>>) -> Result<(), String> {
    if let Some(media) = state.media.lock().as_ref() {
        media.set_muted(muted);
    }
    Ok(())
}

/// Returns the microphone mute flag.
#[tauri::command]
async fn is_muted(state: State<'_, Arc<AppState>>) -> Result<bool, String> {
    Ok(state
        .media
        .lock()
        .as_ref()
        .map(|m| m.is_muted())
        .unwrap_or(false))
}

/// Returns the microphone input level (0.0 - 1.0).
#[tauri::command]
async fn get_audio_levels(state: State<'_, Arc<AppState>>) -> Result<f32, String> {
    Ok(state
        .media
        .lock()
        .as_ref()
        .map(|m| m.input_level())
        .unwrap_or(0.0))
}

// ============================================================================
// TAURI COMMANDS - DEVICES
// ============================================================================

/// Returns all available audio devices (inputs, outputs).
#[tauri::command]
async fn get_audio_devices() -> Result<(Vec<AudioDevice>, Vec<AudioDevice>), String> {
    devices::audio_devices().map_err(|e| e.to_string())
}

/// Returns all connected cameras.
#[tauri::command]
async fn get_cameras() -> Result<Vec<CameraDevice>, String> {
    devices::list_cameras().map_err(|e| e.to_string())
}

// ============================================================================
// TAURI COMMANDS - CALL
// ============================================================================

/// Starts the loopback call with the current local tracks (Call button).
#[tauri::command]
async fn call(state: State<'_, Arc<AppState>>) -> Result<(), String> {
    tracing::info!("Starting loopback call");

    // Clone the tracks out before awaiting; they are Arc-backed.
    let tracks = {
        let media = state.media.lock();
        media
            .as_ref()
            .ok_or("Local media not started")?
            .tracks()
    };

    state.engine.call(tracks).await.map_err(|e| e.to_string())
}

/// Ends the current call (Hangup button).
#[tauri::command]
async fn hangup(state: State<'_, Arc<AppState>>) -> Result<(), String> {
    tracing::info!("Hanging up");
    state.engine.hangup().map_err(|e| e.to_string())
}

/// Returns the current call state.
#[tauri::command]
async fn get_call_state(state: State<'_, Arc<AppState>>) -> Result<CallState, String> {
    Ok(state.engine.state())
}

// ============================================================================
// EVENT FORWARDING
// ============================================================================

/// Forwards engine events to the frontend.
async fn forward_call_events(engine: Arc<CallEngine>, app_handle: AppHandle) {
    let mut rx = engine.subscribe();

    while let Ok(event) = rx.recv().await {
        match event {
            CallEvent::StateChanged(state) => {
                tracing::info!("Call state changed: {:?}", state);
                let _ = app_handle.emit("call:state_changed", state);
            }
            CallEvent::RemoteTrack(track) => {
                tracing::info!("Remote {} track: {}", track.kind, track.id);
                let _ = app_handle.emit("call:remote_track", &track);
            }
            CallEvent::IceCandidate { candidate } => {
                // Observability only; the orchestrator forwards candidates.
                let _ = app_handle.emit("call:ice_candidate", &candidate);
            }
            CallEvent::Error(err) => {
                tracing::error!("Call error: {}", err);
                let _ = app_handle.emit("call:error", &err);
            }
        }
    }
}

// ============================================================================
// TAURI APP RUNNER
// ============================================================================

/// Runs the Tauri application.
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    tauri::Builder::default()
        .plugin(tauri_plugin_single_instance::init(|app, _args, _cwd| {
            let _ = app
                .get_webview_window("main")
                .expect("no main window")
                .set_focus();
        }))
        .plugin(tauri_plugin_opener::init())
        .setup(|app| {
            let state = AppState::init().expect("Failed to initialize app state");
            app.manage(Arc::clone(&state));

            let engine = Arc::clone(&state.engine);
            let app_handle = app.handle().clone();
            tauri::async_runtime::spawn(forward_call_events(engine, app_handle));

            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            // Media
            start_media,
            stop_media,
            switch_camera,
            media_status,
            set_muted,
            is_muted,
            get_audio_levels,
            // Devices
            get_audio_devices,
            get_cameras,
            // Call
            call,
            hangup,
            get_call_state,
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
