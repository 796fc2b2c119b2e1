//! Call Orchestrator
//!
//! Drives the scripted two-party loopback negotiation: attaches the
//! local tracks to the first endpoint, forwards ICE candidates and
//! signaling events between the two endpoints, exchanges offer/answer,
//! then holds every subscription open until the session is cancelled.
//!
//! Candidate forwarding is deliberately cross-wired: candidates emitted
//! by one endpoint are buffered in that endpoint's queue until the
//! *other* endpoint reaches HaveRemoteOffer, at which point the queue is
//! flushed into it in arrival order. The two halves below are mirror
//! images of each other and must be kept that way.

use super::peer::{CallError, PeerEndpoint};
use super::types::{IceCandidate, OfferOptions, RemoteTrack, SignalingState, TrackKind};
use crate::media::LocalTrack;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

// ============================================================================
// EVENT SUBSCRIPTIONS
// ============================================================================

/// All event subscriptions for one call, taken before any SDP exchange
/// so that early events queue up instead of getting lost.
struct EventStreams {
    pc1_candidates: broadcast::Receiver<IceCandidate>,
    pc2_candidates: broadcast::Receiver<IceCandidate>,
    pc1_signaling: broadcast::Receiver<SignalingState>,
    pc2_signaling: broadcast::Receiver<SignalingState>,
    pc1_connection: broadcast::Receiver<super::types::ConnectionState>,
    pc2_connection: broadcast::Receiver<super::types::ConnectionState>,
    pc1_ice_connection: broadcast::Receiver<super::types::IceConnectionState>,
    pc2_ice_connection: broadcast::Receiver<super::types::IceConnectionState>,
    pc1_tracks: broadcast::Receiver<RemoteTrack>,
    pc2_tracks: broadcast::Receiver<RemoteTrack>,
}

impl EventStreams {
    fn subscribe<P: PeerEndpoint + ?Sized>(pc1: &P, pc2: &P) -> Self {
        Self {
            pc1_candidates: pc1.ice_candidates(),
            pc2_candidates: pc2.ice_candidates(),
            pc1_signaling: pc1.signaling_state_changes(),
            pc2_signaling: pc2.signaling_state_changes(),
            pc1_connection: pc1.connection_state_changes(),
            pc2_connection: pc2.connection_state_changes(),
            pc1_ice_connection: pc1.ice_connection_state_changes(),
            pc2_ice_connection: pc2.ice_connection_state_changes(),
            pc1_tracks: pc1.inbound_tracks(),
            pc2_tracks: pc2.inbound_tracks(),
        }
    }
}

/// Maps one broadcast receive result to an optional event.
///
/// A lagged stream drops events (logged loudly, should never happen with
/// the configured capacity); a closed stream ends the call scope.
fn next_event<T>(label: &str, result: Result<T, RecvError>) -> Result<Option<T>, CallError> {
    match result {
        Ok(event) => Ok(Some(event)),
        Err(RecvError::Lagged(missed)) => {
            tracing::error!("{label} stream lagged, {missed} events dropped");
            Ok(None)
        }
        Err(RecvError::Closed) => Err(CallError::StreamClosed),
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Runs a loopback call between two endpoints until cancelled.
///
/// Attaches `local_tracks` to the first endpoint, wires the signaling
/// events between both, performs the offer/answer exchange and then
/// suspends while the event loop keeps forwarding candidates and
/// surfacing remote tracks. Remote tracks arriving at the *second*
/// endpoint invoke the matching callback exactly once per track.
///
/// Returns only on failure or when the surrounding task is aborted; any
/// negotiation or subscription error tears the whole scope down.
pub async fn run_call<P: PeerEndpoint + ?Sized>(
    peers: (Arc<P>, Arc<P>),
    local_tracks: Vec<LocalTrack>,
    on_remote_video: impl Fn(RemoteTrack) + Send + Sync,
    on_remote_audio: impl Fn(RemoteTrack) + Send + Sync,
) -> Result<(), CallError> {
    let (pc1, pc2) = peers;

    for track in &local_tracks {
        pc1.add_track(track).await?;
    }

    // Subscribe before the first SDP call; candidates can start flowing
    // as soon as the local description is set.
    let streams = EventStreams::subscribe(pc1.as_ref(), pc2.as_ref());

    let negotiation = async {
        negotiate(pc1.as_ref(), pc2.as_ref()).await?;
        // Keep the scope alive; the event loop does the remaining work.
        futures::future::pending::<Result<(), CallError>>().await
    };

    let events = drive_events(
        pc1.as_ref(),
        pc2.as_ref(),
        streams,
        &on_remote_video,
        &on_remote_audio,
    );

    tokio::try_join!(events, negotiation)?;
    Ok(())
}

/// Offer/answer exchange, pc1 offering with audio+video reception.
async fn negotiate<P: PeerEndpoint + ?Sized>(pc1: &P, pc2: &P) -> Result<(), CallError> {
    let offer = pc1
        .create_offer(OfferOptions {
            offer_to_receive_audio: true,
            offer_to_receive_video: true,
        })
        .await?;
    pc1.set_local_description(offer.clone()).await?;
    pc2.set_remote_description(offer).await?;

    let answer = pc2.create_answer().await?;
    pc2.set_local_description(answer.clone()).await?;
    pc1.set_remote_description(answer).await?;

    tracing::info!("offer/answer exchange complete");
    Ok(())
}

/// Single event loop draining every subscription.
///
/// One stream's events are handled strictly in arrival order; the select
/// interleaves streams in no particular order. The pending queues have
/// exactly one writer: this loop.
async fn drive_events<P: PeerEndpoint + ?Sized>(
    pc1: &P,
    pc2: &P,
    mut streams: EventStreams,
    on_remote_video: &(impl Fn(RemoteTrack) + Send + Sync),
    on_remote_audio: &(impl Fn(RemoteTrack) + Send + Sync),
) -> Result<(), CallError> {
    let mut pc1_pending: Vec<IceCandidate> = Vec::new();
    let mut pc2_pending: Vec<IceCandidate> = Vec::new();
    let mut seen_tracks: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            event = streams.pc1_candidates.recv() => {
                if let Some(candidate) = next_event("pc1 ice-candidate", event)? {
                    tracing::debug!("pc1 ice candidate: {}", candidate.candidate);
                    if pc2.signaling_state() == SignalingState::HaveRemoteOffer {
                        pc2.add_ice_candidate(candidate).await?;
                    } else {
                        pc1_pending.push(candidate);
                    }
                }
            }
            event = streams.pc2_candidates.recv() => {
                if let Some(candidate) = next_event("pc2 ice-candidate", event)? {
                    tracing::debug!("pc2 ice candidate: {}", candidate.candidate);
                    if pc1.signaling_state() == SignalingState::HaveRemoteOffer {
                        pc1.add_ice_candidate(candidate).await?;
                    } else {
                        pc2_pending.push(candidate);
                    }
                }
            }
            event = streams.pc1_signaling.recv() => {
                if let Some(state) = next_event("pc1 signaling", event)? {
                    tracing::debug!("pc1 signaling state: {:?}", state);
                    if state == SignalingState::HaveRemoteOffer {
                        for candidate in pc2_pending.drain(..) {
                            pc1.add_ice_candidate(candidate).await?;
                        }
                    }
                }
            }
            event = streams.pc2_signaling.recv() => {
                if let Some(state) = next_event("pc2 signaling", event)? {
                    tracing::debug!("pc2 signaling state: {:?}", state);
                    if state == SignalingState::HaveRemoteOffer {
                        for candidate in pc1_pending.drain(..) {
                            pc2.add_ice_candidate(candidate).await?;
                        }
                    }
                }
            }
            event = streams.pc1_connection.recv() => {
                if let Some(state) = next_event("pc1 connection", event)? {
                    tracing::info!("pc1 connection state: {:?}", state);
                }
            }
            event = streams.pc2_connection.recv() => {
                if let Some(state) = next_event("pc2 connection", event)? {
                    tracing::info!("pc2 connection state: {:?}", state);
                }
            }
            event = streams.pc1_ice_connection.recv() => {
                if let Some(state) = next_event("pc1 ice-connection", event)? {
                    tracing::debug!("pc1 ice connection state: {:?}", state);
                }
            }
            event = streams.pc2_ice_connection.recv() => {
                if let Some(state) = next_event("pc2 ice-connection", event)? {
                    tracing::debug!("pc2 ice connection state: {:?}", state);
                }
            }
            event = streams.pc1_tracks.recv() => {
                if let Some(track) = next_event("pc1 track", event)? {
                    tracing::debug!("pc1 inbound track: {} ({})", track.id, track.kind);
                }
            }
            event = streams.pc2_tracks.recv() => {
                if let Some(track) = next_event("pc2 track", event)? {
                    tracing::debug!("pc2 inbound track: {} ({})", track.id, track.kind);
                    if seen_tracks.insert(track.id.clone()) {
                        match track.kind {
                            TrackKind::Audio => on_remote_audio(track),
                            TrackKind::Video => on_remote_video(track),
                        }
                    }
                }
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::peer::EVENT_CHANNEL_CAPACITY;
    use crate::call::types::{
        ConnectionState, IceConnectionState, SdpType, SessionDescription,
    };
    use crate::media::devices::CameraDevice;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};

    /// Scripted peer endpoint: records every mutation and lets tests feed
    /// events into the orchestrator through the broadcast senders.
    struct MockPeer {
        signaling: Mutex<SignalingState>,
        local_description: Mutex<Option<SessionDescription>>,
        remote_description: Mutex<Option<SessionDescription>>,
        applied_candidates: Mutex<Vec<IceCandidate>>,
        applied_without_remote: AtomicUsize,
        added_tracks: Mutex<Vec<String>>,
        fail_offer: AtomicBool,
        offer_gate: Mutex<Option<Arc<Notify>>>,
        candidate_tx: broadcast::Sender<IceCandidate>,
        signaling_tx: broadcast::Sender<SignalingState>,
        connection_tx: broadcast::Sender<ConnectionState>,
        ice_connection_tx: broadcast::Sender<IceConnectionState>,
        track_tx: broadcast::Sender<RemoteTrack>,
    }

    impl MockPeer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                signaling: Mutex::new(SignalingState::Stable),
                local_description: Mutex::new(None),
                remote_description: Mutex::new(None),
                applied_candidates: Mutex::new(Vec::new()),
                applied_without_remote: AtomicUsize::new(0),
                added_tracks: Mutex::new(Vec::new()),
                fail_offer: AtomicBool::new(false),
                offer_gate: Mutex::new(None),
                candidate_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
                signaling_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
                connection_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
                ice_connection_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
                track_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            })
        }

        fn set_signaling(&self, state: SignalingState) {
            *self.signaling.lock() = state;
            let _ = self.signaling_tx.send(state);
        }

        fn applied(&self) -> Vec<IceCandidate> {
            self.applied_candidates.lock().clone()
        }
    }

    #[async_trait]
    impl PeerEndpoint for MockPeer {
        async fn add_track(&self, track: &LocalTrack) -> Result<(), CallError> {
            self.added_tracks.lock().push(track.id().to_string());
            Ok(())
        }

        async fn create_offer(
            &self,
            _options: OfferOptions,
        ) -> Result<SessionDescription, CallError> {
            let gate = self.offer_gate.lock().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            if self.fail_offer.load(Ordering::SeqCst) {
                return Err(CallError::Engine("offer rejected".to_string()));
            }
            Ok(SessionDescription::offer("v=0 mock-offer"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, CallError> {
            Ok(SessionDescription::answer("v=0 mock-answer"))
        }

        async fn set_local_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), CallError> {
            let state = match desc.kind {
                SdpType::Offer => SignalingState::HaveLocalOffer,
                SdpType::Answer => SignalingState::Stable,
            };
            *self.local_description.lock() = Some(desc);
            self.set_signaling(state);
            Ok(())
        }

        async fn set_remote_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), CallError> {
            let state = match desc.kind {
                SdpType::Offer => SignalingState::HaveRemoteOffer,
                SdpType::Answer => SignalingState::Stable,
            };
            *self.remote_description.lock() = Some(desc);
            self.set_signaling(state);
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
            if self.remote_description.lock().is_none() {
                self.applied_without_remote.fetch_add(1, Ordering::SeqCst);
            }
            self.applied_candidates.lock().push(candidate);
            Ok(())
        }

        async fn close(&self) -> Result<(), CallError> {
            self.set_signaling(SignalingState::Closed);
            Ok(())
        }

        fn signaling_state(&self) -> SignalingState {
            *self.signaling.lock()
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

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2130706431 127.0.0.1 {} typ host", 50000 + n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn spawn_call(
        pc1: Arc<MockPeer>,
        pc2: Arc<MockPeer>,
        tracks: Vec<LocalTrack>,
    ) -> (JoinHandle<Result<(), CallError>>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let video_calls = Arc::new(AtomicUsize::new(0));
        let audio_calls = Arc::new(AtomicUsize::new(0));
        let video_counter = Arc::clone(&video_calls);
        let audio_counter = Arc::clone(&audio_calls);
        let handle = tokio::spawn(run_call(
            (pc1, pc2),
            tracks,
            move |_track| {
                video_counter.fetch_add(1, Ordering::SeqCst);
            },
            move |_track| {
                audio_counter.fetch_add(1, Ordering::SeqCst);
            },
        ));
        (handle, video_calls, audio_calls)
    }

    #[tokio::test]
    async fn buffered_candidates_flush_in_order_exactly_once() {
        let pc1 = MockPeer::new();
        let pc2 = MockPeer::new();

        // Hold the offer back so candidates arrive before any description.
        let gate = Arc::new(Notify::new());
        *pc1.offer_gate.lock() = Some(Arc::clone(&gate));

        let (handle, _, _) = spawn_call(Arc::clone(&pc1), Arc::clone(&pc2), Vec::new());
        sleep(Duration::from_millis(50)).await;

        for n in 1..=3 {
            pc1.candidate_tx.send(candidate(n)).unwrap();
        }
        sleep(Duration::from_millis(50)).await;

        // Negotiation has not started: nothing may be applied yet.
        assert!(pc2.applied().is_empty());

        gate.notify_one();
        sleep(Duration::from_millis(100)).await;

        // pc2 reaching HaveRemoteOffer flushed pc1's queue into it, in order.
        let applied = pc2.applied();
        assert_eq!(applied, vec![candidate(1), candidate(2), candidate(3)]);
        assert_eq!(pc2.applied_without_remote.load(Ordering::SeqCst), 0);
        assert!(pc1.applied().is_empty());

        handle.abort();
    }

    #[tokio::test]
    async fn candidate_applied_immediately_when_peer_has_remote_offer() {
        let pc1 = MockPeer::new();
        let pc2 = MockPeer::new();

        let (handle, _, _) = spawn_call(Arc::clone(&pc1), Arc::clone(&pc2), Vec::new());
        sleep(Duration::from_millis(50)).await;

        // Park pc2 in HaveRemoteOffer with a remote description present.
        *pc2.remote_description.lock() = Some(SessionDescription::offer("v=0 parked"));
        *pc2.signaling.lock() = SignalingState::HaveRemoteOffer;
        let already_applied = pc2.applied().len();

        pc1.candidate_tx.send(candidate(9)).unwrap();
        sleep(Duration::from_millis(50)).await;

        let applied = pc2.applied();
        assert_eq!(applied.len(), already_applied + 1);
        assert_eq!(applied.last(), Some(&candidate(9)));
        assert_eq!(pc2.applied_without_remote.load(Ordering::SeqCst), 0);

        handle.abort();
    }

    #[tokio::test]
    async fn remote_track_callbacks_fire_exactly_once_per_track() {
        let pc1 = MockPeer::new();
        let pc2 = MockPeer::new();

        let (handle, video_calls, audio_calls) =
            spawn_call(Arc::clone(&pc1), Arc::clone(&pc2), Vec::new());
        sleep(Duration::from_millis(50)).await;

        let audio = RemoteTrack {
            id: "remote-audio".to_string(),
            kind: TrackKind::Audio,
        };
        let video = RemoteTrack {
            id: "remote-video".to_string(),
            kind: TrackKind::Video,
        };

        pc2.track_tx.send(audio.clone()).unwrap();
        pc2.track_tx.send(video.clone()).unwrap();
        // A duplicate surfacing of the same track must not re-fire.
        pc2.track_tx.send(audio).unwrap();
        // pc1's inbound tracks are logged but never routed to callbacks.
        pc1.track_tx
            .send(RemoteTrack {
                id: "loop-echo".to_string(),
                kind: TrackKind::Video,
            })
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(audio_calls.load(Ordering::SeqCst), 1);
        assert_eq!(video_calls.load(Ordering::SeqCst), 1);

        handle.abort();
    }

    #[tokio::test]
    async fn cancellation_freezes_all_handlers() {
        let pc1 = MockPeer::new();
        let pc2 = MockPeer::new();

        let (handle, video_calls, _) = spawn_call(Arc::clone(&pc1), Arc::clone(&pc2), Vec::new());
        sleep(Duration::from_millis(50)).await;

        handle.abort();
        sleep(Duration::from_millis(20)).await;

        *pc2.signaling.lock() = SignalingState::HaveRemoteOffer;
        let before = pc2.applied().len();

        // With the session gone there is no subscriber left.
        assert!(pc1.candidate_tx.send(candidate(1)).is_err());
        assert!(pc2
            .track_tx
            .send(RemoteTrack {
                id: "late".to_string(),
                kind: TrackKind::Video,
            })
            .is_err());
        sleep(Duration::from_millis(50)).await;

        assert_eq!(pc2.applied().len(), before);
        assert_eq!(video_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hangup_before_candidates_applies_nothing() {
        let pc1 = MockPeer::new();
        let pc2 = MockPeer::new();

        let (handle, _, _) = spawn_call(Arc::clone(&pc1), Arc::clone(&pc2), Vec::new());
        sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert!(pc1.applied().is_empty());
        assert!(pc2.applied().is_empty());
        assert_eq!(pc1.applied_without_remote.load(Ordering::SeqCst), 0);
        assert_eq!(pc2.applied_without_remote.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn offer_failure_sets_no_descriptions_and_fires_no_callbacks() {
        let pc1 = MockPeer::new();
        let pc2 = MockPeer::new();
        pc1.fail_offer.store(true, Ordering::SeqCst);

        let (handle, video_calls, audio_calls) =
            spawn_call(Arc::clone(&pc1), Arc::clone(&pc2), Vec::new());

        let result = timeout(Duration::from_secs(1), handle)
            .await
            .expect("orchestrator should fail fast")
            .expect("task must not panic");
        assert!(matches!(result, Err(CallError::Engine(_))));

        assert!(pc1.local_description.lock().is_none());
        assert!(pc1.remote_description.lock().is_none());
        assert!(pc2.local_description.lock().is_none());
        assert!(pc2.remote_description.lock().is_none());
        assert_eq!(video_calls.load(Ordering::SeqCst), 0);
        assert_eq!(audio_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn switch_camera_leaves_signaling_state_untouched() {
        let pc1 = MockPeer::new();
        let pc2 = MockPeer::new();

        let track = LocalTrack::video(vec![
            CameraDevice {
                index: 0,
                name: "front".to_string(),
            },
            CameraDevice {
                index: 1,
                name: "back".to_string(),
            },
        ]);
        let (handle, _, _) = spawn_call(Arc::clone(&pc1), Arc::clone(&pc2), vec![track.clone()]);
        sleep(Duration::from_millis(100)).await;

        assert_eq!(pc1.added_tracks.lock().len(), 1);
        let pc1_state = pc1.signaling_state();
        let pc2_state = pc2.signaling_state();

        track.switch_camera().unwrap();

        assert_eq!(pc1.signaling_state(), pc1_state);
        assert_eq!(pc2.signaling_state(), pc2_state);
        assert_eq!(pc1.added_tracks.lock().len(), 1);

        handle.abort();
    }
}
