//! Fakes für Szenario-Tests: In-Memory-Signaling, skriptbare Connection
//! Cores und Geräte ohne Hardware.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use pulse_call::call_engine::{
    CallEngine, CallSnapshot, ConnectionCore, ConnectionFactory, ConnectivityState, CoreError,
    CoreEvent, CoreEventSender, EngineParts, RemoteTrack, SenderId, SignalingState,
    CandidatePairReport, InboundReport, StatsReport,
};
use pulse_call::config::{CallConfig, IceServerConfig};
use pulse_call::media::{
    AudioProcessing, LocalTrack, MediaAcquirer, MediaError, MicrophoneCapture, ScreenCapture,
    TrackKind, TrackSource, VideoConstraints,
};
use pulse_call::signaling::{
    IceCandidate, RoomId, SdpKind, SessionDescription, SignalingAdapter, SignalingError,
    SignalingMessage, SignalingSink,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

// ============================================================================
// LOOPBACK SIGNALING
// ============================================================================

#[derive(Default)]
struct HubState {
    rooms: HashMap<String, Vec<(String, SignalingSink)>>,
    log: Vec<(String, SignalingMessage)>,
    deaf: HashSet<String>,
}

/// Broadcast-Kanal im Speicher. Der Absender bekommt seine eigenen
/// Nachrichten nicht zurück.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adapter(&self, who: &str) -> Arc<LoopbackSignaling> {
        Arc::new(LoopbackSignaling {
            who: who.to_string(),
            hub: self.clone(),
            fail_publish: AtomicBool::new(false),
        })
    }

    /// Stellt eine Nachricht zu, als käme sie von `from`
    pub fn inject(&self, room: &RoomId, from: &str, message: SignalingMessage) {
        let mut state = self.state.lock();
        state.log.push((from.to_string(), message.clone()));
        if let Some(subscribers) = state.rooms.get(room.as_str()) {
            for (who, sink) in subscribers {
                if who != from && !state.deaf.contains(who) {
                    let _ = sink.send(message.clone());
                }
            }
        }
    }

    /// Anzahl publizierter Nachrichten eines Absenders mit `kind`
    pub fn sent(&self, from: &str, kind: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(who, message)| who == from && message.kind() == kind)
            .count()
    }

    /// Nachrichten an `who` gehen verloren
    pub fn set_deaf(&self, who: &str, deaf: bool) {
        let mut state = self.state.lock();
        if deaf {
            state.deaf.insert(who.to_string());
        } else {
            state.deaf.remove(who);
        }
    }

    pub fn subscribers(&self, room: &RoomId) -> usize {
        self.state
            .lock()
            .rooms
            .get(room.as_str())
            .map_or(0, |subscribers| subscribers.len())
    }
}

pub struct LoopbackSignaling {
    who: String,
    hub: LoopbackHub,
    pub fail_publish: AtomicBool,
}

impl SignalingAdapter for LoopbackSignaling {
    fn subscribe(&self, room: &RoomId, sink: SignalingSink) -> Result<(), SignalingError> {
        let mut state = self.hub.state.lock();
        let subscribers = state.rooms.entry(room.as_str().to_string()).or_default();
        if subscribers.iter().any(|(who, _)| *who == self.who) {
            return Err(SignalingError::AlreadySubscribed(room.to_string()));
        }
        subscribers.push((self.who.clone(), sink));
        Ok(())
    }

    fn publish(&self, room: &RoomId, message: &SignalingMessage) -> Result<(), SignalingError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(SignalingError::SendFailed("offline".into()));
        }
        self.hub.inject(room, &self.who, message.clone());
        Ok(())
    }

    fn unsubscribe(&self, room: &RoomId) {
        if let Some(subscribers) = self.hub.state.lock().rooms.get_mut(room.as_str()) {
            subscribers.retain(|(who, _)| *who != self.who);
        }
    }
}

// ============================================================================
// FAKE CONNECTION CORE
// ============================================================================

/// SDP der Fakes: eine Zeile pro gesendetem Track
pub fn fake_sdp(tracks: &[(&str, TrackKind, &str)]) -> String {
    let mut sdp = String::from("v=fake\n");
    for (id, kind, stream) in tracks {
        let kind = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        sdp.push_str(&format!("track {} {} {}\n", id, kind, stream));
    }
    sdp
}

fn parse_tracks(sdp: &str) -> Vec<RemoteTrack> {
    sdp.lines()
        .filter_map(|line| {
            let mut parts = line.strip_prefix("track ")?.split(' ');
            let id = parts.next()?;
            let kind = match parts.next()? {
                "video" => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            Some(RemoteTrack::new(id, kind, parts.next()?))
        })
        .collect()
}

#[derive(Default)]
struct CoreState {
    signaling: Option<SignalingState>,
    local_tracks: BTreeMap<u64, (String, TrackKind, String)>,
    next_sender: u64,
    candidates_emitted: usize,
    offers_created: usize,
    remote_descriptions: Vec<SdpKind>,
    applied_candidates: Vec<IceCandidate>,
    remote_tracks: HashSet<String>,
    has_local: bool,
    has_remote: bool,
    connected: bool,
    closed: bool,
}

/// Skriptbare Verbindung: verbindet sich, sobald beide Descriptions gesetzt
/// und ein Remote-Candidate angewendet wurde.
pub struct FakeCore {
    name: String,
    events: CoreEventSender,
    auto_connect: bool,
    state: Mutex<CoreState>,
}

impl FakeCore {
    fn new(name: String, events: CoreEventSender, auto_connect: bool) -> Self {
        Self {
            name,
            events,
            auto_connect,
            state: Mutex::new(CoreState::default()),
        }
    }

    /// Simuliert ein Event der Transportschicht
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.events.send(event);
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state
            .lock()
            .applied_candidates
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn remote_descriptions(&self) -> Vec<SdpKind> {
        self.state.lock().remote_descriptions.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn local_track_count(&self) -> usize {
        self.state.lock().local_tracks.len()
    }

    fn describe(&self, state: &mut CoreState) -> String {
        let tracks: Vec<(&str, TrackKind, &str)> = state
            .local_tracks
            .values()
            .map(|(id, kind, stream)| (id.as_str(), *kind, stream.as_str()))
            .collect();
        fake_sdp(&tracks)
    }

    fn gather_candidate(&self, state: &mut CoreState) {
        state.candidates_emitted += 1;
        let candidate = IceCandidate::new(format!(
            "candidate:{}-{}",
            self.name, state.candidates_emitted
        ));
        let _ = self.events.send(CoreEvent::LocalCandidate(candidate));
    }

    fn sync_remote_tracks(&self, state: &mut CoreState, sdp: &str) {
        let tracks = parse_tracks(sdp);
        let ids: HashSet<String> = tracks.iter().map(|t| t.id.clone()).collect();

        let removed: Vec<String> = state
            .remote_tracks
            .iter()
            .filter(|id| !ids.contains(*id))
            .cloned()
            .collect();
        for track_id in removed {
            state.remote_tracks.remove(&track_id);
            let _ = self.events.send(CoreEvent::TrackRemoved { track_id });
        }

        for track in tracks {
            if state.remote_tracks.insert(track.id.clone()) {
                let _ = self.events.send(CoreEvent::TrackAdded(track));
            }
        }
    }

    fn maybe_connect(&self, state: &mut CoreState) {
        if self.auto_connect
            && !state.connected
            && state.has_local
            && state.has_remote
            && !state.applied_candidates.is_empty()
        {
            state.connected = true;
            let _ = self
                .events
                .send(CoreEvent::ConnectivityChanged(ConnectivityState::Connected));
        }
    }

    fn signaling(state: &CoreState) -> SignalingState {
        state.signaling.unwrap_or(SignalingState::Stable)
    }
}

#[async_trait]
impl ConnectionCore for FakeCore {
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, CoreError> {
        let mut state = self.state.lock();
        state.next_sender += 1;
        let id = state.next_sender;
        state.local_tracks.insert(
            id,
            (
                track.id().to_string(),
                track.kind(),
                track.source().stream_id().to_string(),
            ),
        );
        Ok(SenderId(id))
    }

    async fn remove_track(&self, sender: SenderId) -> Result<(), CoreError> {
        self.state
            .lock()
            .local_tracks
            .remove(&sender.0)
            .map(|_| ())
            .ok_or(CoreError::UnknownSender(sender.0))
    }

    async fn create_offer(&self) -> Result<SessionDescription, CoreError> {
        let mut state = self.state.lock();
        if Self::signaling(&state) != SignalingState::Stable {
            return Err(CoreError::WebRTC("offer outside stable".into()));
        }
        state.signaling = Some(SignalingState::HaveLocalOffer);
        state.offers_created += 1;
        state.has_local = true;
        let sdp = self.describe(&mut state);
        self.gather_candidate(&mut state);
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CoreError> {
        let mut state = self.state.lock();
        if Self::signaling(&state) != SignalingState::HaveRemoteOffer {
            return Err(CoreError::WebRTC("answer without remote offer".into()));
        }
        state.signaling = Some(SignalingState::Stable);
        state.has_local = true;
        let sdp = self.describe(&mut state);
        self.gather_candidate(&mut state);
        self.maybe_connect(&mut state);
        Ok(SessionDescription::answer(sdp))
    }

    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<(), CoreError> {
        let mut state = self.state.lock();
        let current = Self::signaling(&state);
        let next = match (desc.kind, current) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(CoreError::InvalidSdp(format!("{:?} in {:?}", kind, current)))
            }
        };
        state.signaling = Some(next);
        state.remote_descriptions.push(desc.kind);
        state.has_remote = true;
        self.sync_remote_tracks(&mut state, &desc.sdp);
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), CoreError> {
        let mut state = self.state.lock();
        if !state.has_remote {
            return Err(CoreError::WebRTC("candidate before remote description".into()));
        }
        state.applied_candidates.push(candidate);
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), CoreError> {
        let mut state = self.state.lock();
        if Self::signaling(&state) == SignalingState::HaveLocalOffer {
            state.has_local = false;
        }
        state.signaling = Some(SignalingState::Stable);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        Self::signaling(&self.state.lock())
    }

    async fn stats(&self) -> Result<StatsReport, CoreError> {
        Ok(StatsReport {
            candidate_pair: Some(CandidatePairReport {
                current_round_trip_time: Some(0.05),
            }),
            inbound_audio: Some(InboundReport {
                packets_lost: 1,
                ..Default::default()
            }),
            inbound_video: Vec::new(),
        })
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.signaling = Some(SignalingState::Closed);
    }
}

/// Erstellt [`FakeCore`]s und merkt sie sich für Assertions
pub struct FakeFactory {
    name: String,
    pub auto_connect: AtomicBool,
    cores: Mutex<Vec<Arc<FakeCore>>>,
}

impl FakeFactory {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            auto_connect: AtomicBool::new(true),
            cores: Mutex::new(Vec::new()),
        }
    }

    pub fn cores(&self) -> Vec<Arc<FakeCore>> {
        self.cores.lock().clone()
    }

    pub fn last(&self) -> Arc<FakeCore> {
        self.cores.lock().last().cloned().expect("no connection created")
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServerConfig],
        events: CoreEventSender,
    ) -> Result<Arc<dyn ConnectionCore>, CoreError> {
        let core = Arc::new(FakeCore::new(
            self.name.clone(),
            events,
            self.auto_connect.load(Ordering::SeqCst),
        ));
        self.cores.lock().push(Arc::clone(&core));
        Ok(core)
    }
}

// ============================================================================
// FAKE MEDIA
// ============================================================================

#[derive(Default)]
pub struct FakeAcquirer {
    tracks: Mutex<Vec<LocalTrack>>,
    mics: Mutex<Vec<MicrophoneCapture>>,
    pub deny_microphone: AtomicBool,
    pub fail_camera: AtomicBool,
    mic_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeAcquirer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anzahl geöffneter, nicht gestoppter Tracks
    pub fn live(&self) -> usize {
        self.tracks.lock().iter().filter(|t| !t.is_stopped()).count()
    }

    pub fn last_microphone(&self) -> Option<MicrophoneCapture> {
        self.mics.lock().last().cloned()
    }

    /// Mikrofon-Anfragen warten, bis der zurückgegebene Notify auslöst
    pub fn hold_microphone(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.mic_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Simuliert ein abgestecktes Gerät
    pub fn unplug(&self, source: TrackSource) {
        if let Some(track) = self
            .tracks
            .lock()
            .iter()
            .rev()
            .find(|t| t.source() == source && !t.is_stopped())
        {
            track.end_of_stream();
        }
    }

    fn open(&self, source: TrackSource) -> LocalTrack {
        let track = LocalTrack::new(source);
        self.tracks.lock().push(track.clone());
        track
    }
}

#[async_trait]
impl MediaAcquirer for FakeAcquirer {
    async fn acquire_microphone(
        &self,
        _processing: AudioProcessing,
    ) -> Result<MicrophoneCapture, MediaError> {
        let gate = self.mic_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.deny_microphone.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("microphone".into()));
        }
        let capture = MicrophoneCapture::new(self.open(TrackSource::Microphone), None);
        self.tracks.lock().push(capture.processed.clone());
        self.mics.lock().push(capture.clone());
        Ok(capture)
    }

    async fn acquire_camera(&self, _constraints: VideoConstraints) -> Result<LocalTrack, MediaError> {
        if self.fail_camera.load(Ordering::SeqCst) {
            return Err(MediaError::NoDevice("camera".into()));
        }
        Ok(self.open(TrackSource::Camera))
    }

    async fn acquire_screen(&self) -> Result<ScreenCapture, MediaError> {
        Ok(ScreenCapture {
            video: self.open(TrackSource::Screen),
            audio: Some(self.open(TrackSource::SystemAudio)),
        })
    }
}

// ============================================================================
// PEERS
// ============================================================================

pub struct Peer {
    pub id: String,
    pub engine: CallEngine,
    pub connections: Arc<FakeFactory>,
    pub media: Arc<FakeAcquirer>,
    pub signaling: Arc<LoopbackSignaling>,
}

impl Peer {
    pub fn core(&self) -> Arc<FakeCore> {
        self.connections.last()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.engine.snapshot()
    }

    /// Wartet, bis der Snapshot `predicate` erfüllt
    pub async fn wait_until(&self, predicate: impl Fn(&CallSnapshot) -> bool) -> CallSnapshot {
        let mut rx = self.engine.watch();
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            let snapshot = rx.wait_for(|s| predicate(s)).await.expect("engine stopped");
            snapshot.clone()
        })
        .await;
        match result {
            Ok(snapshot) => snapshot,
            Err(_) => panic!("{}: condition not reached, last {:?}", self.id, self.snapshot()),
        }
    }
}

pub fn test_config() -> CallConfig {
    CallConfig {
        reconnect_grace: Duration::from_secs(120),
        ..CallConfig::default()
    }
}

pub fn peer(hub: &LoopbackHub, local: &str, remote: &str, config: CallConfig) -> Peer {
    let connections = Arc::new(FakeFactory::new(local));
    let media = Arc::new(FakeAcquirer::new());
    let signaling = hub.adapter(local);

    let engine = CallEngine::new(EngineParts {
        local_id: local.to_string(),
        remote_id: remote.to_string(),
        config,
        signaling: signaling.clone(),
        connections: connections.clone(),
        media: media.clone(),
    })
    .expect("engine");

    Peer {
        id: local.to_string(),
        engine,
        connections,
        media,
        signaling,
    }
}

/// Zwei verbundene Teilnehmer im selben Raum
pub fn pair(config: CallConfig) -> (LoopbackHub, Peer, Peer) {
    let hub = LoopbackHub::new();
    let alice = peer(&hub, "alice", "bob", config.clone());
    let bob = peer(&hub, "bob", "alice", config);
    (hub, alice, bob)
}

/// Baut einen Audio-Anruf bis CONNECTED auf beiden Seiten auf
pub async fn connect(alice: &Peer, bob: &Peer) {
    alice.engine.start_call();
    bob.wait_until(|s| s.remote_offer_pending).await;
    bob.engine.answer_call();
    alice.wait_until(|s| s.state == pulse_call::CallState::Connected).await;
    bob.wait_until(|s| s.state == pulse_call::CallState::Connected).await;
}

/// Gibt laufenden Tasks Zeit, ihre Ergebnisse einzureichen
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}
