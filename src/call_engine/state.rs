//! Zustände, Fehler und beobachtbarer Snapshot der Call Engine

use super::connection::{CoreError, RemoteTrack};
use super::router::{RemoteSink, RemoteTrackFlags};
use super::stats::ConnectivityStats;
use crate::media::MediaError;
use crate::signaling::SignalingError;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Für die UI sichtbare Fehlerklasse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Capture-Gerät fehlt oder Berechtigung verweigert
    Device,
    /// Publish/Subscribe fehlgeschlagen
    Signaling,
    /// SDP erstellen/anwenden fehlgeschlagen
    Negotiation,
    /// Verbindung verloren (vorübergehend oder endgültig)
    ConnectivityLost,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallEngineError {
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] CoreError),

    #[error("Connection lost")]
    ConnectivityLost,

    #[error("Call engine has shut down")]
    EngineStopped,
}

impl CallEngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallEngineError::Media(_) => ErrorKind::Device,
            CallEngineError::Signaling(_) | CallEngineError::EngineStopped => ErrorKind::Signaling,
            CallEngineError::Negotiation(_) => ErrorKind::Negotiation,
            CallEngineError::ConnectivityLost => ErrorKind::ConnectivityLost,
        }
    }
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Eigenes Offer ist unterwegs
    Offering,
    /// Eingehendes Offer wartet auf `answer_call()`
    Receiving,
    /// Offer/Answer ausgetauscht, Verbindung wird hergestellt
    Connecting,
    /// Anruf aktiv
    Connected,
    /// Verbindung unterbrochen, Grace-Timer läuft
    Reconnecting,
}

impl CallState {
    pub fn is_idle(self) -> bool {
        self == CallState::Idle
    }

    /// CONNECTED oder RECONNECTING: eine etablierte Session
    pub fn is_established(self) -> bool {
        matches!(self, CallState::Connected | CallState::Reconnecting)
    }
}

/// Unterzustand der Offer/Answer-Verhandlung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Negotiation {
    /// Keine Verhandlung unterwegs
    Stable,
    /// Eigenes Offer erstellt bzw. publiziert, Answer steht aus
    AwaitingAnswer,
    /// Empfangenes Answer wird angewendet
    ApplyingAnswer,
    /// Eingehendes Offer wird angewendet und beantwortet
    Answering,
    /// Eigenes Offer wird nach Fehler oder Timeout zurückgenommen
    RollingBack,
}

impl Negotiation {
    pub fn is_in_flight(self) -> bool {
        self != Negotiation::Stable
    }
}

// ============================================================================
// SNAPSHOT & EVENTS
// ============================================================================

/// Welche lokalen Tracks aktuell gesendet werden
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LocalTrackFlags {
    pub mic: bool,
    pub camera: bool,
    pub screen: bool,
}

/// Beobachtbarer Zustand für die UI
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub state: CallState,
    pub negotiation: Negotiation,
    pub local: LocalTrackFlags,
    pub remote: RemoteTrackFlags,
    pub muted: bool,
    pub input_gain: f32,
    pub remote_audio_enabled: bool,
    pub stats: Option<ConnectivityStats>,
    pub last_error: Option<ErrorKind>,
    pub reconnect_pending: bool,
    pub stats_active: bool,
    pub remote_offer_pending: bool,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            negotiation: Negotiation::Stable,
            local: LocalTrackFlags::default(),
            remote: RemoteTrackFlags::default(),
            muted: false,
            input_gain: 1.0,
            remote_audio_enabled: true,
            stats: None,
            last_error: None,
            reconnect_pending: false,
            stats_active: false,
            remote_offer_pending: false,
        }
    }
}

impl CallSnapshot {
    /// Keine Timer und keine Geräte mehr aktiv
    pub fn is_torn_down(&self) -> bool {
        self.state.is_idle()
            && self.local == LocalTrackFlags::default()
            && !self.reconnect_pending
            && !self.stats_active
    }
}

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    RemoteTrack { sink: RemoteSink, track: RemoteTrack },
    RemoteTrackRemoved { sink: RemoteSink, track_id: String },
    Stats(ConnectivityStats),
    Error { kind: ErrorKind, message: String },
}
