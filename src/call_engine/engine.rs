//! Call Engine - Session State Machine
//!
//! Die Engine ist ein einzelner Actor-Task pro Raum. Alle Eingaben (UI-Befehle,
//! Signaling-Nachrichten, Core-Events, Timer) laufen durch eine Queue und
//! werden nacheinander vollständig abgearbeitet. Asynchrone Schritte
//! (Geräte, Offer/Answer) laufen in eigenen Tasks und melden ihr Ergebnis
//! zurück in die Queue, markiert mit der Epoche der Session. Nach einem
//! Teardown ist die Epoche eine andere und späte Ergebnisse werden verworfen.

use super::candidates::{CandidateApplier, CandidateBuffer};
use super::connection::{
    ConnectionCore, ConnectionFactory, ConnectivityState, CoreError, CoreEvent, CoreEventSender,
    SenderId, SignalingState,
};
use super::peer::WebRtcConnectionFactory;
use super::router::TrackRouter;
use super::state::{
    CallEngineError, CallEvent, CallSnapshot, CallState, ErrorKind, LocalTrackFlags, Negotiation,
};
use super::stats::{spawn_monitor, ConnectivityStats};
use crate::config::{CallConfig, IceServerConfig};
use crate::media::{
    clamp_gain, AudioProcessing, DeviceMediaAcquirer, LocalTrack, MediaAcquirer, MediaError,
    MicrophoneCapture, VideoConstraints,
};
use crate::signaling::{
    IceCandidate, RoomId, SessionDescription, SignalingAdapter, SignalingError, SignalingMessage,
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

// ============================================================================
// INPUTS
// ============================================================================

/// Befehle der UI
#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    StartCall,
    AnswerCall,
    EndCall,
    ToggleMute,
    ToggleCamera,
    ToggleScreenShare,
    ToggleRemoteAudio,
    SetInputGain(f32),
    Shutdown,
}

/// Ergebnis eines asynchronen Schritts
enum StepResult {
    CallPrepared(Result<PreparedCall, CallEngineError>),
    AnswerPrepared(Result<PreparedCall, CallEngineError>),
    OfferCreated {
        round: u64,
        result: Result<SessionDescription, CoreError>,
    },
    AnswerApplied {
        round: u64,
        result: Result<(), CoreError>,
    },
    RenegotiationAnswered {
        round: u64,
        result: Result<SessionDescription, CoreError>,
    },
    RolledBack {
        round: u64,
    },
    TracksAdded {
        slot: SlotKind,
        acquisition: u64,
        result: Result<Vec<SentTrack>, CallEngineError>,
    },
    TracksRemoved {
        result: Result<(), CoreError>,
    },
}

enum Input {
    Command(Command),
    Signal(SignalingMessage),
    Core { epoch: u64, event: CoreEvent },
    Step { epoch: u64, step: StepResult },
    LocalTrackEnded { epoch: u64, track_id: String },
    ReconnectExpired { epoch: u64 },
    NegotiationTimeout { epoch: u64, round: u64 },
    Stats { epoch: u64, stats: ConnectivityStats },
}

// ============================================================================
// SESSION RESOURCES
// ============================================================================

/// Mikrofon plus Connection Core nach erfolgreichem Start/Annehmen
struct PreparedCall {
    core: Arc<dyn ConnectionCore>,
    mic: MicrophoneCapture,
    mic_sender: SenderId,
    description: SessionDescription,
}

impl PreparedCall {
    /// Gibt Gerät und Verbindung frei (verspätetes Ergebnis)
    fn release(self) {
        self.mic.stop();
        let core = self.core;
        tokio::spawn(async move {
            core.close().await;
        });
    }
}

/// Ein an die Connection Core übergebener lokaler Track
struct SentTrack {
    track: LocalTrack,
    sender: SenderId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Camera,
    Screen,
}

enum MediaSlot {
    Absent,
    /// Erwerb läuft; nur das Ergebnis mit dieser Nummer wird übernommen
    Acquiring(u64),
    Present(Vec<SentTrack>),
}

impl MediaSlot {
    fn is_present(&self) -> bool {
        matches!(self, MediaSlot::Present(_))
    }

    fn contains(&self, track_id: &str) -> bool {
        match self {
            MediaSlot::Present(tracks) => tracks.iter().any(|t| t.track.id() == track_id),
            _ => false,
        }
    }
}

struct MicSlot {
    capture: MicrophoneCapture,
    sender: SenderId,
}

/// Kollaborateure der Engine
pub struct EngineParts {
    pub local_id: String,
    pub remote_id: String,
    pub config: CallConfig,
    pub signaling: Arc<dyn SignalingAdapter>,
    pub connections: Arc<dyn ConnectionFactory>,
    pub media: Arc<dyn MediaAcquirer>,
}

// ============================================================================
// CALL ENGINE (HANDLE)
// ============================================================================

/// Öffentliche Steuerung eines Zwei-Personen-Anrufs.
///
/// Alle Befehle sind nicht-blockierend; Ergebnisse und Fehler erscheinen im
/// [`CallSnapshot`] bzw. als [`CallEvent`].
pub struct CallEngine {
    input_tx: mpsc::UnboundedSender<Input>,
    snapshot_rx: watch::Receiver<CallSnapshot>,
    event_tx: broadcast::Sender<CallEvent>,
    room: RoomId,
}

impl CallEngine {
    /// Erstellt eine Engine mit WebRTC-Verbindung und echten Geräten
    pub fn with_webrtc(
        local_id: String,
        remote_id: String,
        config: CallConfig,
        signaling: Arc<dyn SignalingAdapter>,
    ) -> Result<Self, CallEngineError> {
        Self::new(EngineParts {
            local_id,
            remote_id,
            config,
            signaling,
            connections: Arc::new(WebRtcConnectionFactory::new()),
            media: Arc::new(DeviceMediaAcquirer::new()),
        })
    }

    /// Erstellt die Engine und abonniert den Room-Topic.
    ///
    /// Muss innerhalb einer Tokio-Runtime aufgerufen werden.
    pub fn new(parts: EngineParts) -> Result<Self, CallEngineError> {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::default());
        let (event_tx, _) = broadcast::channel(100);
        let room = RoomId::between(&parts.local_id, &parts.remote_id);

        // Signaling-Nachrichten in die Actor-Queue weiterleiten
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<SignalingMessage>();
        parts.signaling.subscribe(&room, signal_tx)?;
        let forward_tx = input_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = signal_rx.recv().await {
                if forward_tx.send(Input::Signal(message)).is_err() {
                    break;
                }
            }
        });

        tracing::info!(
            "Call engine for {} <-> {} on room {}",
            parts.local_id,
            parts.remote_id,
            room
        );

        let session = CallSession::new(
            parts,
            room.clone(),
            input_tx.clone(),
            snapshot_tx,
            event_tx.clone(),
        );
        tokio::spawn(session.run(input_rx));

        Ok(Self {
            input_tx,
            snapshot_rx,
            event_tx,
            room,
        })
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Beobachter für den Snapshot
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Gibt den aktuellen Call-Status zurück
    pub fn state(&self) -> CallState {
        self.snapshot_rx.borrow().state
    }

    /// Startet einen ausgehenden Anruf (nur aus IDLE)
    pub fn start_call(&self) {
        self.send(Command::StartCall);
    }

    /// Nimmt einen eingehenden Anruf an (nur aus RECEIVING)
    pub fn answer_call(&self) {
        self.send(Command::AnswerCall);
    }

    /// Legt auf und räumt die Session ab
    pub fn end_call(&self) {
        self.send(Command::EndCall);
    }

    pub fn toggle_mute(&self) {
        self.send(Command::ToggleMute);
    }

    pub fn toggle_camera(&self) {
        self.send(Command::ToggleCamera);
    }

    pub fn toggle_screen_share(&self) {
        self.send(Command::ToggleScreenShare);
    }

    pub fn toggle_remote_audio(&self) {
        self.send(Command::ToggleRemoteAudio);
    }

    /// Setzt den Software-Gain des Mikrofons (0.0 - 3.0)
    pub fn set_input_gain(&self, gain: f32) {
        self.send(Command::SetInputGain(gain));
    }

    /// Beendet einen laufenden Anruf und meldet den Room-Topic ab
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    fn send(&self, command: Command) {
        if self.input_tx.send(Input::Command(command)).is_err() {
            tracing::warn!("Call engine stopped, dropping {:?}", command);
        }
    }
}

impl Drop for CallEngine {
    fn drop(&mut self) {
        let _ = self.input_tx.send(Input::Command(Command::Shutdown));
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("room", &self.room)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// CALL SESSION (ACTOR)
// ============================================================================

/// Einziger Besitzer des Session-Zustands
struct CallSession {
    local_id: String,
    remote_id: String,
    room: RoomId,
    config: CallConfig,
    signaling: Arc<dyn SignalingAdapter>,
    connections: Arc<dyn ConnectionFactory>,
    media: Arc<dyn MediaAcquirer>,

    input_tx: mpsc::UnboundedSender<Input>,
    snapshot_tx: watch::Sender<CallSnapshot>,
    event_tx: broadcast::Sender<CallEvent>,

    state: CallState,
    negotiation: Negotiation,
    /// Wechselt bei jedem Teardown; Ergebnisse älterer Epochen sind irrelevant
    epoch: u64,
    /// Wechselt bei jeder Verhandlung
    round: u64,
    renegotiation_pending: bool,
    acquisitions: u64,

    muted: bool,
    input_gain: f32,
    remote_audio_enabled: bool,
    last_error: Option<ErrorKind>,
    stats: Option<ConnectivityStats>,

    core: Option<Arc<dyn ConnectionCore>>,
    applier: Option<CandidateApplier>,
    candidates: CandidateBuffer,
    router: TrackRouter,
    mic: Option<MicSlot>,
    camera: MediaSlot,
    screen: MediaSlot,

    remote_offer: Option<SessionDescription>,
    glare_offer: Option<SessionDescription>,
    local_description_sent: bool,
    held_local_candidates: Vec<IceCandidate>,

    reconnect_timer: Option<JoinHandle<()>>,
    negotiation_timer: Option<JoinHandle<()>>,
    stats_task: Option<JoinHandle<()>>,
}

impl CallSession {
    fn new(
        parts: EngineParts,
        room: RoomId,
        input_tx: mpsc::UnboundedSender<Input>,
        snapshot_tx: watch::Sender<CallSnapshot>,
        event_tx: broadcast::Sender<CallEvent>,
    ) -> Self {
        Self {
            local_id: parts.local_id,
            remote_id: parts.remote_id,
            room,
            config: parts.config,
            signaling: parts.signaling,
            connections: parts.connections,
            media: parts.media,
            input_tx,
            snapshot_tx,
            event_tx,
            state: CallState::Idle,
            negotiation: Negotiation::Stable,
            epoch: 0,
            round: 0,
            renegotiation_pending: false,
            acquisitions: 0,
            muted: false,
            input_gain: 1.0,
            remote_audio_enabled: true,
            last_error: None,
            stats: None,
            core: None,
            applier: None,
            candidates: CandidateBuffer::new(),
            router: TrackRouter::new(),
            mic: None,
            camera: MediaSlot::Absent,
            screen: MediaSlot::Absent,
            remote_offer: None,
            glare_offer: None,
            local_description_sent: false,
            held_local_candidates: Vec::new(),
            reconnect_timer: None,
            negotiation_timer: None,
            stats_task: None,
        }
    }

    async fn run(mut self, mut input_rx: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = input_rx.recv().await {
            if let Input::Command(Command::Shutdown) = input {
                self.end_call();
                self.signaling.unsubscribe(&self.room);
                self.publish_snapshot();
                tracing::info!("Call engine for room {} shut down", self.room);
                break;
            }
            self.handle(input);
            self.publish_snapshot();
        }
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::Command(command) => self.handle_command(command),
            Input::Signal(message) => self.handle_signal(message),
            Input::Core { epoch, event } if epoch == self.epoch => self.handle_core_event(event),
            Input::Step { epoch, step } if epoch == self.epoch => self.handle_step(step),
            Input::Step { step, .. } => Self::release_stale(step),
            Input::LocalTrackEnded { epoch, track_id } if epoch == self.epoch => {
                self.handle_track_ended(&track_id)
            }
            Input::ReconnectExpired { epoch } if epoch == self.epoch => {
                if self.state == CallState::Reconnecting {
                    tracing::warn!("Reconnect grace period expired");
                    self.reconnect_timer = None;
                    self.teardown(Some(CallEngineError::ConnectivityLost));
                }
            }
            Input::NegotiationTimeout { epoch, round } if epoch == self.epoch => {
                self.handle_negotiation_timeout(round)
            }
            Input::Stats { epoch, stats } if epoch == self.epoch => {
                if self.state == CallState::Connected {
                    self.stats = Some(stats.clone());
                    let _ = self.event_tx.send(CallEvent::Stats(stats));
                }
            }
            _ => tracing::debug!("Dropping input from a previous session"),
        }
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartCall => self.start_call(),
            Command::AnswerCall => self.answer_call(),
            Command::EndCall => self.end_call(),
            Command::ToggleMute => {
                self.muted = !self.muted;
                if let Some(mic) = &self.mic {
                    mic.capture.gain.set_muted(self.muted);
                }
                tracing::info!("Microphone muted: {}", self.muted);
            }
            Command::SetInputGain(gain) => {
                self.input_gain = clamp_gain(gain);
                if let Some(mic) = &self.mic {
                    mic.capture.gain.set_gain(self.input_gain);
                }
                tracing::debug!("Input gain set to {}", self.input_gain);
            }
            Command::ToggleRemoteAudio => {
                self.remote_audio_enabled = !self.remote_audio_enabled;
                tracing::info!("Remote audio enabled: {}", self.remote_audio_enabled);
            }
            Command::ToggleCamera => self.toggle_slot(SlotKind::Camera),
            Command::ToggleScreenShare => self.toggle_slot(SlotKind::Screen),
            Command::Shutdown => {}
        }
    }

    fn start_call(&mut self) {
        if self.state != CallState::Idle {
            tracing::warn!("start_call ignored in state {:?}", self.state);
            return;
        }

        self.begin_session();
        self.last_error = None;
        self.set_state(CallState::Offering);

        let media = Arc::clone(&self.media);
        let connections = Arc::clone(&self.connections);
        let ice_servers = self.config.ice_servers.clone();
        let events = self.core_event_sender();
        let (muted, gain) = (self.muted, self.input_gain);

        self.spawn_step(async move {
            StepResult::CallPrepared(
                prepare_call(media, connections, ice_servers, events, muted, gain, None).await,
            )
        });
    }

    fn answer_call(&mut self) {
        if self.state != CallState::Receiving || self.negotiation.is_in_flight() {
            tracing::warn!("answer_call ignored in state {:?}", self.state);
            return;
        }
        let Some(offer) = self.remote_offer.clone() else {
            tracing::warn!("answer_call without a pending offer");
            return;
        };

        self.negotiation = Negotiation::Answering;
        self.last_error = None;

        let media = Arc::clone(&self.media);
        let connections = Arc::clone(&self.connections);
        let ice_servers = self.config.ice_servers.clone();
        let events = self.core_event_sender();
        let (muted, gain) = (self.muted, self.input_gain);

        self.spawn_step(async move {
            StepResult::AnswerPrepared(
                prepare_call(media, connections, ice_servers, events, muted, gain, Some(offer))
                    .await,
            )
        });
    }

    fn end_call(&mut self) {
        if self.state.is_idle() {
            return;
        }
        tracing::info!("Hanging up");
        // Best-effort, ein Fehler hält den Teardown nicht auf
        if let Err(e) = self.publish(SignalingMessage::Hangup) {
            tracing::warn!("Failed to publish hangup: {}", e);
        }
        self.teardown(None);
    }

    fn toggle_slot(&mut self, kind: SlotKind) {
        if !self.can_renegotiate() {
            tracing::warn!("{:?} toggle ignored in state {:?}", kind, self.state);
            return;
        }

        if self.slot(kind).is_present() {
            self.release_slot(kind);
        } else if matches!(self.slot(kind), MediaSlot::Acquiring(_)) {
            // Noch nicht da: das Ergebnis wird bei Ankunft freigegeben
            *self.slot_mut(kind) = MediaSlot::Absent;
        } else {
            self.acquire_slot(kind);
        }
    }

    fn acquire_slot(&mut self, kind: SlotKind) {
        let Some(core) = self.core.clone() else {
            return;
        };
        self.acquisitions += 1;
        let acquisition = self.acquisitions;
        *self.slot_mut(kind) = MediaSlot::Acquiring(acquisition);
        let media = Arc::clone(&self.media);

        self.spawn_step(async move {
            StepResult::TracksAdded {
                slot: kind,
                acquisition,
                result: add_local_tracks(media, core, kind).await,
            }
        });
    }

    fn release_slot(&mut self, kind: SlotKind) {
        let MediaSlot::Present(tracks) = std::mem::replace(self.slot_mut(kind), MediaSlot::Absent)
        else {
            return;
        };
        let senders: Vec<SenderId> = tracks
            .iter()
            .map(|sent| {
                sent.track.stop();
                sent.sender
            })
            .collect();
        tracing::info!("{:?} stopped", kind);

        let Some(core) = self.core.clone() else {
            return;
        };
        self.spawn_step(async move {
            let mut result = Ok(());
            for sender in senders {
                if let Err(e) = core.remove_track(sender).await {
                    result = Err(e);
                }
            }
            StepResult::TracksRemoved { result }
        });
    }

    // ========================================================================
    // SIGNALING
    // ========================================================================

    fn handle_signal(&mut self, message: SignalingMessage) {
        tracing::debug!("Received {} in state {:?}", message.kind(), self.state);

        match message {
            SignalingMessage::Offer { sdp, caller_id } => self.handle_offer(sdp, &caller_id),
            SignalingMessage::Answer { sdp } => self.handle_answer(sdp),
            SignalingMessage::Candidate { candidate } => self.handle_remote_candidate(candidate),
            SignalingMessage::Hangup => {
                if !self.state.is_idle() {
                    tracing::info!("Call ended by {}", self.remote_id);
                    self.teardown(None);
                }
            }
        }
    }

    fn handle_offer(&mut self, sdp: SessionDescription, caller_id: &str) {
        if caller_id == self.local_id {
            tracing::debug!("Ignoring own offer echo");
            return;
        }
        if !caller_id.is_empty() && caller_id != self.remote_id {
            tracing::warn!("Ignoring offer from unexpected caller {}", caller_id);
            return;
        }

        match self.state {
            CallState::Idle => {
                tracing::info!("Incoming call from {}", self.remote_id);
                self.begin_session();
                self.last_error = None;
                self.remote_offer = Some(sdp);
                self.set_state(CallState::Receiving);
            }
            CallState::Receiving => {
                // Anrufer hat neu angesetzt
                self.remote_offer = Some(sdp);
            }
            CallState::Offering => {
                // Beide Seiten rufen gleichzeitig an
                if !self.is_polite() {
                    tracing::info!("Glare during call setup, keeping own offer");
                    return;
                }
                tracing::info!("Glare during call setup, answering remote offer");
                match self.core.clone() {
                    Some(_) if self.negotiation == Negotiation::AwaitingAnswer => {
                        self.answer_remote_offer(sdp, true)
                    }
                    Some(_) => tracing::warn!("Dropping offer, negotiation {:?}", self.negotiation),
                    None => self.glare_offer = Some(sdp),
                }
            }
            CallState::Connecting | CallState::Connected | CallState::Reconnecting => {
                self.handle_renegotiation_offer(sdp)
            }
        }
    }

    fn handle_renegotiation_offer(&mut self, sdp: SessionDescription) {
        match self.negotiation {
            Negotiation::Stable => {
                let stable = self
                    .core
                    .as_ref()
                    .is_some_and(|core| core.signaling_state() == SignalingState::Stable);
                if stable {
                    self.answer_remote_offer(sdp, false);
                } else {
                    tracing::warn!("Dropping offer, connection not stable");
                }
            }
            Negotiation::AwaitingAnswer if self.is_polite() => {
                tracing::info!("Glare: rolling back own offer");
                // Eigene Änderung wird nach dieser Runde neu angeboten
                self.renegotiation_pending = true;
                self.answer_remote_offer(sdp, true);
            }
            in_flight => {
                tracing::warn!("Dropping offer while negotiation is {:?}", in_flight);
            }
        }
    }

    fn answer_remote_offer(&mut self, sdp: SessionDescription, rollback: bool) {
        let Some(core) = self.core.clone() else {
            return;
        };
        self.cancel_negotiation_timer();
        self.negotiation = Negotiation::Answering;
        self.round += 1;
        let round = self.round;

        self.spawn_step(async move {
            let result = async {
                if rollback {
                    core.rollback().await?;
                }
                core.apply_remote_description(sdp).await?;
                core.create_answer().await
            }
            .await;
            StepResult::RenegotiationAnswered { round, result }
        });
    }

    fn handle_answer(&mut self, sdp: SessionDescription) {
        if self.negotiation != Negotiation::AwaitingAnswer {
            tracing::debug!("Ignoring answer while negotiation is {:?}", self.negotiation);
            return;
        }
        let Some(core) = self.core.clone() else {
            return;
        };

        self.cancel_negotiation_timer();
        self.negotiation = Negotiation::ApplyingAnswer;
        let round = self.round;

        self.spawn_step(async move {
            StepResult::AnswerApplied {
                round,
                result: core.apply_remote_description(sdp).await,
            }
        });
    }

    fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.state.is_idle() {
            tracing::debug!("Dropping candidate while idle");
            return;
        }
        if let Some(candidate) = self.candidates.receive(candidate) {
            match &self.applier {
                Some(applier) => applier.apply(candidate),
                None => tracing::warn!("Remote description set without a connection"),
            }
        } else {
            tracing::debug!("Buffered candidate ({} pending)", self.candidates.len());
        }
    }

    /// Nach erfolgreicher Remote Description: Puffer in Reihenfolge anwenden
    fn remote_description_applied(&mut self) {
        let buffered = self.candidates.flush();
        if buffered.is_empty() {
            return;
        }
        tracing::debug!("Flushing {} buffered candidates", buffered.len());
        if let Some(applier) = &self.applier {
            for candidate in buffered {
                applier.apply(candidate);
            }
        }
    }

    // ========================================================================
    // STEP RESULTS
    // ========================================================================

    fn handle_step(&mut self, step: StepResult) {
        match step {
            StepResult::CallPrepared(result) => self.on_call_prepared(result),
            StepResult::AnswerPrepared(result) => self.on_answer_prepared(result),
            StepResult::OfferCreated { round, result } => self.on_offer_created(round, result),
            StepResult::AnswerApplied { round, result } => self.on_answer_applied(round, result),
            StepResult::RenegotiationAnswered { round, result } => {
                self.on_renegotiation_answered(round, result)
            }
            StepResult::RolledBack { round } => {
                if round == self.round && self.negotiation == Negotiation::RollingBack {
                    self.negotiation = Negotiation::Stable;
                    self.negotiation_settled();
                }
            }
            StepResult::TracksAdded {
                slot,
                acquisition,
                result,
            } => self.on_tracks_added(slot, acquisition, result),
            StepResult::TracksRemoved { result } => {
                if let Err(e) = result {
                    self.record_error(&CallEngineError::Negotiation(e));
                }
                self.request_renegotiation();
            }
        }
    }

    fn on_call_prepared(&mut self, result: Result<PreparedCall, CallEngineError>) {
        if self.state != CallState::Offering {
            if let Ok(prepared) = result {
                prepared.release();
            }
            return;
        }
        let prepared = match result {
            Ok(prepared) => prepared,
            Err(e) => return self.teardown(Some(e)),
        };

        let offer = self.install(prepared);

        if let Some(remote_offer) = self.glare_offer.take() {
            // Höfliche Seite: eigenes Offer verwerfen, fremdes beantworten
            self.answer_remote_offer(remote_offer, true);
            return;
        }

        let message = SignalingMessage::Offer {
            sdp: offer,
            caller_id: self.local_id.clone(),
        };
        if let Err(e) = self.publish(message) {
            return self.teardown(Some(e.into()));
        }

        self.round += 1;
        self.negotiation = Negotiation::AwaitingAnswer;
        self.local_description_published();
        tracing::info!("Offer sent to {}", self.remote_id);
    }

    fn on_answer_prepared(&mut self, result: Result<PreparedCall, CallEngineError>) {
        if self.state != CallState::Receiving {
            if let Ok(prepared) = result {
                prepared.release();
            }
            return;
        }
        let prepared = match result {
            Ok(prepared) => prepared,
            Err(e) => return self.teardown(Some(e)),
        };

        let answer = self.install(prepared);
        self.remote_offer = None;

        if let Err(e) = self.publish(SignalingMessage::Answer { sdp: answer }) {
            return self.teardown(Some(e.into()));
        }

        self.negotiation = Negotiation::Stable;
        self.remote_description_applied();
        self.local_description_published();
        self.set_state(CallState::Connecting);
    }

    fn on_offer_created(&mut self, round: u64, result: Result<SessionDescription, CoreError>) {
        if round != self.round || self.negotiation != Negotiation::AwaitingAnswer {
            return;
        }
        let offer = match result {
            Ok(offer) => offer,
            Err(e) => {
                self.record_error(&CallEngineError::Negotiation(e));
                self.negotiation = Negotiation::Stable;
                self.renegotiation_pending = false;
                return;
            }
        };

        let message = SignalingMessage::Offer {
            sdp: offer,
            caller_id: self.local_id.clone(),
        };
        if let Err(e) = self.publish(message) {
            self.record_error(&e.into());
            self.rollback();
            return;
        }

        tracing::info!("Renegotiation offer sent");
        self.arm_negotiation_timer();
    }

    fn on_answer_applied(&mut self, round: u64, result: Result<(), CoreError>) {
        if round != self.round || self.negotiation != Negotiation::ApplyingAnswer {
            return;
        }
        if let Err(e) = result {
            if self.state == CallState::Offering {
                return self.teardown(Some(e.into()));
            }
            self.record_error(&CallEngineError::Negotiation(e));
            self.rollback();
            return;
        }

        self.remote_description_applied();
        if self.state == CallState::Offering {
            self.set_state(CallState::Connecting);
        }
        self.negotiation = Negotiation::Stable;
        self.negotiation_settled();
    }

    fn on_renegotiation_answered(
        &mut self,
        round: u64,
        result: Result<SessionDescription, CoreError>,
    ) {
        if round != self.round || self.negotiation != Negotiation::Answering {
            return;
        }
        let answer = match result {
            Ok(answer) => answer,
            Err(e) => {
                if self.state == CallState::Offering {
                    return self.teardown(Some(e.into()));
                }
                self.record_error(&CallEngineError::Negotiation(e));
                self.rollback();
                return;
            }
        };

        self.remote_description_applied();

        if let Err(e) = self.publish(SignalingMessage::Answer { sdp: answer }) {
            if self.state == CallState::Offering {
                return self.teardown(Some(e.into()));
            }
            self.record_error(&e.into());
        }
        self.local_description_published();

        match self.state {
            CallState::Offering => self.set_state(CallState::Connecting),
            CallState::Reconnecting => self.enter_connected(),
            _ => {}
        }
        self.negotiation = Negotiation::Stable;
        self.negotiation_settled();
    }

    fn on_tracks_added(
        &mut self,
        kind: SlotKind,
        acquisition: u64,
        result: Result<Vec<SentTrack>, CallEngineError>,
    ) {
        let wanted = matches!(self.slot(kind), MediaSlot::Acquiring(n) if *n == acquisition);
        match result {
            Ok(tracks) if wanted && self.can_renegotiate() => {
                for sent in &tracks {
                    self.watch_local_track(&sent.track);
                }
                *self.slot_mut(kind) = MediaSlot::Present(tracks);
                tracing::info!("{:?} started", kind);
                self.request_renegotiation();
            }
            Ok(tracks) if wanted => {
                *self.slot_mut(kind) = MediaSlot::Absent;
                self.discard_tracks(tracks);
            }
            Ok(tracks) => {
                // Inzwischen abgeschaltet oder durch einen neueren Erwerb ersetzt,
                // der Slot selbst bleibt unberührt
                tracing::debug!("Discarding superseded {:?} acquisition {}", kind, acquisition);
                self.discard_tracks(tracks);
            }
            Err(e) => {
                if wanted {
                    *self.slot_mut(kind) = MediaSlot::Absent;
                }
                self.record_error(&e);
            }
        }
    }

    fn discard_tracks(&self, tracks: Vec<SentTrack>) {
        for sent in &tracks {
            sent.track.stop();
        }
        if let Some(core) = self.core.clone() {
            tokio::spawn(async move {
                for sent in tracks {
                    let _ = core.remove_track(sent.sender).await;
                }
            });
        }
    }

    /// Gibt Ressourcen aus Ergebnissen einer alten Session frei
    fn release_stale(step: StepResult) {
        match step {
            StepResult::CallPrepared(Ok(prepared)) | StepResult::AnswerPrepared(Ok(prepared)) => {
                tracing::debug!("Releasing call prepared for a torn-down session");
                prepared.release();
            }
            StepResult::TracksAdded {
                result: Ok(tracks), ..
            } => {
                for sent in tracks {
                    sent.track.stop();
                }
            }
            _ => {}
        }
    }

    // ========================================================================
    // RENEGOTIATION
    // ========================================================================

    fn can_renegotiate(&self) -> bool {
        matches!(
            self.state,
            CallState::Connecting | CallState::Connected | CallState::Reconnecting
        )
    }

    /// Startet eine Offer/Answer-Runde, sobald die Verbindung stabil ist
    fn request_renegotiation(&mut self) {
        if !self.can_renegotiate() {
            return;
        }
        let Some(core) = self.core.clone() else {
            return;
        };

        if self.negotiation.is_in_flight() || core.signaling_state() != SignalingState::Stable {
            tracing::debug!("Renegotiation deferred, negotiation {:?}", self.negotiation);
            self.renegotiation_pending = true;
            return;
        }

        self.renegotiation_pending = false;
        self.negotiation = Negotiation::AwaitingAnswer;
        self.round += 1;
        let round = self.round;

        tracing::info!("Starting renegotiation (round {})", round);
        self.spawn_step(async move {
            StepResult::OfferCreated {
                round,
                result: core.create_offer().await,
            }
        });
    }

    /// Ende einer Verhandlung: ggf. aufgeschobene Runde starten
    fn negotiation_settled(&mut self) {
        if self.renegotiation_pending {
            self.request_renegotiation();
        }
    }

    fn rollback(&mut self) {
        self.cancel_negotiation_timer();
        let Some(core) = self.core.clone() else {
            self.negotiation = Negotiation::Stable;
            return;
        };
        self.negotiation = Negotiation::RollingBack;
        let round = self.round;

        self.spawn_step(async move {
            if let Err(e) = core.rollback().await {
                tracing::warn!("Rollback failed: {}", e);
            }
            StepResult::RolledBack { round }
        });
    }

    fn handle_negotiation_timeout(&mut self, round: u64) {
        if round != self.round || self.negotiation != Negotiation::AwaitingAnswer {
            return;
        }
        tracing::warn!("No answer for renegotiation round {}", round);
        self.negotiation_timer = None;
        self.record_error(&CallEngineError::Negotiation(CoreError::WebRTC(
            "renegotiation timed out".to_string(),
        )));
        self.rollback();
    }

    fn arm_negotiation_timer(&mut self) {
        self.cancel_negotiation_timer();
        let tx = self.input_tx.clone();
        let (epoch, round) = (self.epoch, self.round);
        let timeout = self.config.negotiation_timeout;

        self.negotiation_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Input::NegotiationTimeout { epoch, round });
        }));
    }

    fn cancel_negotiation_timer(&mut self) {
        if let Some(timer) = self.negotiation_timer.take() {
            timer.abort();
        }
    }

    /// Regel gegen Glare: die Seite mit der kleineren ID setzt sich durch
    fn is_polite(&self) -> bool {
        self.local_id > self.remote_id
    }

    // ========================================================================
    // CONNECTION EVENTS
    // ========================================================================

    fn handle_core_event(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::LocalCandidate(candidate) => {
                if !self.local_description_sent {
                    self.held_local_candidates.push(candidate);
                    return;
                }
                if let Err(e) = self.publish(SignalingMessage::Candidate { candidate }) {
                    tracing::warn!("Failed to publish candidate: {}", e);
                }
            }
            CoreEvent::ConnectivityChanged(state) => self.handle_connectivity(state),
            CoreEvent::TrackAdded(track) => {
                if let Some(sink) = self.router.route(track.clone()) {
                    tracing::info!("Remote {:?} track {} -> {:?}", track.kind, track.id, sink);
                    let _ = self.event_tx.send(CallEvent::RemoteTrack { sink, track });
                }
            }
            CoreEvent::TrackRemoved { track_id } => {
                if let Some(sink) = self.router.remove(&track_id) {
                    tracing::info!("Remote track {} removed from {:?}", track_id, sink);
                    let _ = self
                        .event_tx
                        .send(CallEvent::RemoteTrackRemoved { sink, track_id });
                }
            }
        }
    }

    fn handle_connectivity(&mut self, connectivity: ConnectivityState) {
        tracing::info!("Peer connection state: {:?}", connectivity);

        match connectivity {
            ConnectivityState::Connected => {
                if matches!(
                    self.state,
                    CallState::Offering | CallState::Connecting | CallState::Reconnecting
                ) {
                    self.enter_connected();
                }
            }
            ConnectivityState::Disconnected => {
                if matches!(self.state, CallState::Connecting | CallState::Connected) {
                    self.enter_reconnecting();
                }
            }
            ConnectivityState::Failed => {
                if !self.state.is_idle() {
                    self.teardown(Some(CallEngineError::ConnectivityLost));
                }
            }
            ConnectivityState::New | ConnectivityState::Connecting | ConnectivityState::Closed => {}
        }
    }

    fn enter_connected(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.set_state(CallState::Connected);

        if self.stats_task.is_none() {
            if let Some(core) = self.core.clone() {
                let tx = self.input_tx.clone();
                let epoch = self.epoch;
                self.stats_task = Some(spawn_monitor(core, self.config.stats_interval, move |stats| {
                    tx.send(Input::Stats { epoch, stats }).is_ok()
                }));
            }
        }
    }

    fn enter_reconnecting(&mut self) {
        self.stop_stats();
        self.set_state(CallState::Reconnecting);

        let tx = self.input_tx.clone();
        let epoch = self.epoch;
        let grace = self.config.reconnect_grace;
        tracing::info!("Connection lost, waiting up to {:?} for recovery", grace);

        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(Input::ReconnectExpired { epoch });
        }));
    }

    fn stop_stats(&mut self) {
        if let Some(task) = self.stats_task.take() {
            task.abort();
        }
        self.stats = None;
    }

    fn handle_track_ended(&mut self, track_id: &str) {
        for kind in [SlotKind::Camera, SlotKind::Screen] {
            if self.slot(kind).contains(track_id) {
                tracing::warn!("{:?} ended unexpectedly, falling back", kind);
                self.record_error(&CallEngineError::Media(MediaError::Stream(
                    format!("{:?} capture ended", kind),
                )));
                self.release_slot(kind);
                return;
            }
        }

        let mic_ended = self
            .mic
            .as_ref()
            .is_some_and(|mic| mic.capture.raw.id() == track_id && !mic.capture.raw.is_stopped());
        if mic_ended {
            self.record_error(&CallEngineError::Media(MediaError::Stream(
                "microphone capture ended".to_string(),
            )));
        }
    }

    // ========================================================================
    // SESSION LIFECYCLE
    // ========================================================================

    /// Neue Epoche für eine neue Session
    fn begin_session(&mut self) {
        self.epoch += 1;
        self.candidates.clear();
        self.router.clear();
        self.local_description_sent = false;
        self.held_local_candidates.clear();
    }

    /// Übernimmt Core und Mikrofon in die Session
    fn install(&mut self, prepared: PreparedCall) -> SessionDescription {
        self.watch_local_track(&prepared.mic.raw);
        self.applier = Some(CandidateApplier::spawn(Arc::clone(&prepared.core)));
        self.core = Some(prepared.core);
        self.mic = Some(MicSlot {
            capture: prepared.mic,
            sender: prepared.mic_sender,
        });
        prepared.description
    }

    fn local_description_published(&mut self) {
        if self.local_description_sent {
            return;
        }
        self.local_description_sent = true;
        for candidate in std::mem::take(&mut self.held_local_candidates) {
            if let Err(e) = self.publish(SignalingMessage::Candidate { candidate }) {
                tracing::warn!("Failed to publish candidate: {}", e);
            }
        }
    }

    /// Räumt die Session bedingungslos ab und geht nach IDLE
    fn teardown(&mut self, error: Option<CallEngineError>) {
        // Alle laufenden Schritte und Timer werden irrelevant
        self.epoch += 1;
        self.round += 1;

        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.cancel_negotiation_timer();
        self.stop_stats();

        for kind in [SlotKind::Camera, SlotKind::Screen] {
            if let MediaSlot::Present(tracks) =
                std::mem::replace(self.slot_mut(kind), MediaSlot::Absent)
            {
                for sent in tracks {
                    sent.track.stop();
                }
            }
        }
        if let Some(mic) = self.mic.take() {
            tracing::debug!("Releasing microphone (sender {:?})", mic.sender);
            mic.capture.stop();
        }

        if let Some(applier) = self.applier.take() {
            applier.stop();
        }
        self.candidates.clear();
        self.router.clear();

        if let Some(core) = self.core.take() {
            tokio::spawn(async move {
                core.close().await;
            });
        }

        self.negotiation = Negotiation::Stable;
        self.renegotiation_pending = false;
        self.remote_offer = None;
        self.glare_offer = None;
        self.local_description_sent = false;
        self.held_local_candidates.clear();

        if let Some(error) = error {
            self.record_error(&error);
        }
        self.set_state(CallState::Idle);
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn slot(&self, kind: SlotKind) -> &MediaSlot {
        match kind {
            SlotKind::Camera => &self.camera,
            SlotKind::Screen => &self.screen,
        }
    }

    fn slot_mut(&mut self, kind: SlotKind) -> &mut MediaSlot {
        match kind {
            SlotKind::Camera => &mut self.camera,
            SlotKind::Screen => &mut self.screen,
        }
    }

    fn spawn_step<F>(&self, step: F)
    where
        F: Future<Output = StepResult> + Send + 'static,
    {
        let tx = self.input_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let step = step.await;
            let _ = tx.send(Input::Step { epoch, step });
        });
    }

    /// Core-Events dieser Epoche in die Actor-Queue leiten
    fn core_event_sender(&self) -> CoreEventSender {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<CoreEvent>();
        let tx = self.input_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if tx.send(Input::Core { epoch, event }).is_err() {
                    break;
                }
            }
        });
        events_tx
    }

    fn watch_local_track(&self, track: &LocalTrack) {
        let mut ended = track.ended();
        let track_id = track.id().to_string();
        let tx = self.input_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            if ended.wait_for(|ended| *ended).await.is_ok() {
                let _ = tx.send(Input::LocalTrackEnded { epoch, track_id });
            }
        });
    }

    fn publish(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        self.signaling.publish(&self.room, &message)
    }

    fn record_error(&mut self, error: &CallEngineError) {
        tracing::error!("Call error: {}", error);
        self.last_error = Some(error.kind());
        let _ = self.event_tx.send(CallEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    /// Aktualisiert den State und sendet Event
    fn set_state(&mut self, new_state: CallState) {
        if self.state == new_state {
            return;
        }
        tracing::info!("Call state: {:?} -> {:?}", self.state, new_state);
        self.state = new_state;
        let _ = self.event_tx.send(CallEvent::StateChanged(new_state));
    }

    fn publish_snapshot(&self) {
        let snapshot = CallSnapshot {
            state: self.state,
            negotiation: self.negotiation,
            local: LocalTrackFlags {
                mic: self.mic.is_some(),
                camera: self.camera.is_present(),
                screen: self.screen.is_present(),
            },
            remote: self.router.flags(),
            muted: self.muted,
            input_gain: self.input_gain,
            remote_audio_enabled: self.remote_audio_enabled,
            stats: self.stats.clone(),
            last_error: self.last_error,
            reconnect_pending: self.reconnect_timer.is_some(),
            stats_active: self.stats_task.is_some(),
            remote_offer_pending: self.remote_offer.is_some(),
        };

        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}

// ============================================================================
// ASYNC STEPS
// ============================================================================

/// Mikrofon öffnen, Verbindung aufbauen, Offer bzw. Answer erzeugen.
///
/// Bei einem Fehler werden bereits erworbene Ressourcen hier freigegeben.
async fn prepare_call(
    media: Arc<dyn MediaAcquirer>,
    connections: Arc<dyn ConnectionFactory>,
    ice_servers: Vec<IceServerConfig>,
    events: CoreEventSender,
    muted: bool,
    gain: f32,
    remote_offer: Option<SessionDescription>,
) -> Result<PreparedCall, CallEngineError> {
    let mic = media.acquire_microphone(AudioProcessing::default()).await?;
    mic.gain.set_muted(muted);
    mic.gain.set_gain(gain);

    let core = match connections.create(&ice_servers, events).await {
        Ok(core) => core,
        Err(e) => {
            mic.stop();
            return Err(e.into());
        }
    };

    let negotiated = async {
        match remote_offer {
            Some(offer) => {
                core.apply_remote_description(offer).await?;
                let sender = core.add_track(&mic.processed).await?;
                Ok::<_, CoreError>((sender, core.create_answer().await?))
            }
            None => {
                let sender = core.add_track(&mic.processed).await?;
                Ok((sender, core.create_offer().await?))
            }
        }
    }
    .await;

    match negotiated {
        Ok((mic_sender, description)) => Ok(PreparedCall {
            core,
            mic,
            mic_sender,
            description,
        }),
        Err(e) => {
            mic.stop();
            core.close().await;
            Err(e.into())
        }
    }
}

/// Kamera bzw. Bildschirm öffnen und an die Verbindung hängen
async fn add_local_tracks(
    media: Arc<dyn MediaAcquirer>,
    core: Arc<dyn ConnectionCore>,
    kind: SlotKind,
) -> Result<Vec<SentTrack>, CallEngineError> {
    let tracks = match kind {
        SlotKind::Camera => vec![media.acquire_camera(VideoConstraints::HIGH_QUALITY).await?],
        SlotKind::Screen => media.acquire_screen().await?.tracks(),
    };

    let mut sent = Vec::with_capacity(tracks.len());
    for track in &tracks {
        match core.add_track(track).await {
            Ok(sender) => sent.push(SentTrack {
                track: track.clone(),
                sender,
            }),
            Err(e) => {
                for track in &tracks {
                    track.stop();
                }
                for done in sent {
                    let _ = core.remove_track(done.sender).await;
                }
                return Err(e.into());
            }
        }
    }
    Ok(sent)
}
