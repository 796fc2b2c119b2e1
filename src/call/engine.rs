//! Call Engine - Session Lifecycle
//!
//! Owns the loopback call session: creates the two peer connections,
//! spawns the orchestrator and the state watchers, and exposes the
//! Idle -> Connecting -> Connected -> Ended state machine to the UI.

use super::orchestrator::run_call;
use super::peer::{CallError, PeerEndpoint, EVENT_CHANNEL_CAPACITY};
use super::rtc::RtcPeer;
use super::types::{ConnectionState, IceCandidate, RemoteTrack};
use crate::media::LocalTrack;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

// ============================================================================
// CALL STATE
// ============================================================================

/// Lifecycle state of the loopback call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    /// No active call
    Idle,
    /// Peer connections are being created and negotiated
    Connecting,
    /// Call active
    Connected,
    /// Call ended, returns to Idle shortly after
    Ended,
}

/// Events emitted by the engine for the UI layer.
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    RemoteTrack(RemoteTrack),
    IceCandidate { candidate: IceCandidate },
    Error(String),
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Everything that belongs to one running call.
///
/// Aborting the orchestrator drops its subscriptions, which freezes all
/// candidate and track handling mid-call.
struct CallSession {
    orchestrator: JoinHandle<()>,
    watchers: Vec<JoinHandle<()>>,
    peers: (Arc<dyn PeerEndpoint>, Arc<dyn PeerEndpoint>),
}

// ============================================================================
// CALL ENGINE
// ============================================================================

pub struct CallEngine {
    state: Arc<Mutex<CallState>>,
    session: Arc<Mutex<Option<CallSession>>>,
    remote_tracks: Arc<Mutex<Vec<RemoteTrack>>>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallEngine {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            state: Arc::new(Mutex::new(CallState::Idle)),
            session: Arc::new(Mutex::new(None)),
            remote_tracks: Arc::new(Mutex::new(Vec::new())),
            event_tx,
        }
    }

    /// Returns an event receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Current call state.
    pub fn state(&self) -> CallState {
        *self.state.lock()
    }

    /// Remote tracks surfaced by the current call, in arrival order.
    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.remote_tracks.lock().clone()
    }

    /// Starts the loopback call with the given local tracks.
    ///
    /// Creates both peer connections and hands them to the orchestrator;
    /// the call then runs until [`hangup`](Self::hangup) or failure.
    pub async fn call(&self, local_tracks: Vec<LocalTrack>) -> Result<(), CallError> {
        self.begin_call()?;

        let (pc1, pc2) = match Self::connect_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                self.set_state(CallState::Idle);
                return Err(e);
            }
        };

        let watchers = vec![
            self.spawn_peer_watcher("pc1", &pc1),
            self.spawn_peer_watcher("pc2", &pc2),
        ];

        let on_remote_video = {
            let remote_tracks = Arc::clone(&self.remote_tracks);
            let event_tx = self.event_tx.clone();
            move |track: RemoteTrack| {
                remote_tracks.lock().push(track.clone());
                let _ = event_tx.send(CallEvent::RemoteTrack(track));
            }
        };
        let on_remote_audio = {
            let remote_tracks = Arc::clone(&self.remote_tracks);
            let event_tx = self.event_tx.clone();
            move |track: RemoteTrack| {
                remote_tracks.lock().push(track.clone());
                let _ = event_tx.send(CallEvent::RemoteTrack(track));
            }
        };

        let orchestrator = {
            let pc1 = Arc::clone(&pc1);
            let pc2 = Arc::clone(&pc2);
            let state = Arc::clone(&self.state);
            let session = Arc::clone(&self.session);
            let remote_tracks = Arc::clone(&self.remote_tracks);
            let event_tx = self.event_tx.clone();
            tokio::spawn(async move {
                let peers = (Arc::clone(&pc1), Arc::clone(&pc2));
                if let Err(e) =
                    run_call(peers, local_tracks, on_remote_video, on_remote_audio).await
                {
                    tracing::error!("Call failed: {}", e);
                    let _ = event_tx.send(CallEvent::Error(e.to_string()));

                    if Self::finish_call(&session, &remote_tracks, &state, &event_tx).is_err() {
                        // Failed before the session was stored; close what
                        // this task itself holds.
                        let _ = pc1.close().await;
                        let _ = pc2.close().await;
                        remote_tracks.lock().clear();
                        *state.lock() = CallState::Ended;
                        let _ = event_tx.send(CallEvent::StateChanged(CallState::Ended));
                        Self::schedule_idle(state, event_tx);
                    }
                }
            })
        };

        *self.session.lock() = Some(CallSession {
            orchestrator,
            watchers,
            peers: (pc1, pc2),
        });

        tracing::info!("Loopback call started");
        Ok(())
    }

    /// Ends the current call.
    pub fn hangup(&self) -> Result<(), CallError> {
        Self::finish_call(
            &self.session,
            &self.remote_tracks,
            &self.state,
            &self.event_tx,
        )?;

        tracing::info!("Call ended");
        Ok(())
    }

    /// Ends the call if one is active. Stop implies hangup; the local
    /// stream must not be released out from under a running call.
    pub fn hangup_if_active(&self) {
        let _ = self.hangup();
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Claims the Idle state for a new call.
    ///
    /// The check and the transition to Connecting happen under one lock;
    /// two concurrent callers cannot both observe Idle.
    fn begin_call(&self) -> Result<(), CallError> {
        {
            let mut state = self.state.lock();
            if *state != CallState::Idle {
                return Err(CallError::AlreadyInCall);
            }
            *state = CallState::Connecting;
        }
        let _ = self
            .event_tx
            .send(CallEvent::StateChanged(CallState::Connecting));

        // A previous call that failed on its own may leave a finished
        // session behind; clear it before starting over.
        self.session.lock().take();
        Ok(())
    }

    /// Tears down the stored session: aborts the orchestrator and the
    /// watchers, closes both peers, clears the remote tracks and walks
    /// the state through Ended back to Idle.
    fn finish_call(
        session_slot: &Mutex<Option<CallSession>>,
        remote_tracks: &Mutex<Vec<RemoteTrack>>,
        state: &Arc<Mutex<CallState>>,
        event_tx: &broadcast::Sender<CallEvent>,
    ) -> Result<(), CallError> {
        let session = session_slot.lock().take().ok_or(CallError::NoActiveCall)?;

        session.orchestrator.abort();
        for watcher in session.watchers {
            watcher.abort();
        }

        let (pc1, pc2) = session.peers;
        tokio::spawn(async move {
            let _ = pc1.close().await;
            let _ = pc2.close().await;
        });

        remote_tracks.lock().clear();
        *state.lock() = CallState::Ended;
        let _ = event_tx.send(CallEvent::StateChanged(CallState::Ended));
        Self::schedule_idle(Arc::clone(state), event_tx.clone());
        Ok(())
    }

    async fn connect_peers(
    ) -> Result<(Arc<dyn PeerEndpoint>, Arc<dyn PeerEndpoint>), CallError> {
        let pc1: Arc<dyn PeerEndpoint> = RtcPeer::connect("pc1").await?;
        let pc2: Arc<dyn PeerEndpoint> = RtcPeer::connect("pc2").await?;
        Ok((pc1, pc2))
    }

    /// Watches one peer's connection states and candidates.
    ///
    /// Connection states drive the engine state; ICE connection states
    /// are logged; candidates are republished for the UI.
    fn spawn_peer_watcher(
        &self,
        label: &'static str,
        peer: &Arc<dyn PeerEndpoint>,
    ) -> JoinHandle<()> {
        let mut connection = peer.connection_state_changes();
        let mut ice_connection = peer.ice_connection_state_changes();
        let mut candidates = peer.ice_candidates();
        let state = Arc::clone(&self.state);
        let session = Arc::clone(&self.session);
        let remote_tracks = Arc::clone(&self.remote_tracks);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = connection.recv() => match event {
                        Ok(s) => {
                            tracing::info!("{} connection state: {:?}", label, s);
                            match s {
                                ConnectionState::Connected => {
                                    let became_connected = {
                                        let mut current = state.lock();
                                        if *current == CallState::Connecting {
                                            *current = CallState::Connected;
                                            true
                                        } else {
                                            false
                                        }
                                    };
                                    if became_connected {
                                        let _ = event_tx
                                            .send(CallEvent::StateChanged(CallState::Connected));
                                    }
                                }
                                ConnectionState::Disconnected
                                | ConnectionState::Failed
                                | ConnectionState::Closed => {
                                    tracing::warn!("{} connection lost: {:?}", label, s);
                                    let _ = Self::finish_call(
                                        &session,
                                        &remote_tracks,
                                        &state,
                                        &event_tx,
                                    );
                                    break;
                                }
                                _ => {}
                            }
                        }
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    },
                    event = ice_connection.recv() => match event {
                        Ok(s) => tracing::info!("{} ice connection state: {:?}", label, s),
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    },
                    event = candidates.recv() => match event {
                        Ok(candidate) => {
                            let _ = event_tx.send(CallEvent::IceCandidate { candidate });
                        }
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// Returns to Idle shortly after Ended, unless a new call started.
    fn schedule_idle(state: Arc<Mutex<CallState>>, event_tx: broadcast::Sender<CallEvent>) {
        tokio::spawn(async move {
            tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
            {
                let mut current = state.lock();
                if *current != CallState::Ended {
                    return;
                }
                *current = CallState::Idle;
            }
            let _ = event_tx.send(CallEvent::StateChanged(CallState::Idle));
        });
    }

    fn set_state(&self, new_state: CallState) {
        *self.state.lock() = new_state;
        let _ = self.event_tx.send(CallEvent::StateChanged(new_state));
    }
}

impl Default for CallEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("state", &self.state())
            .field("remote_tracks", &self.remote_tracks.lock().len())
            .finish()
    }
}
