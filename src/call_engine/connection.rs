//! Connection Core - Vertrag für die Transportverbindung
//!
//! Die Engine spricht die Peer Connection nur über [`ConnectionCore`] an.
//! Die Produktiv-Implementierung liegt in `peer.rs` (webrtc crate).

use super::stats::StatsReport;
use crate::config::IceServerConfig;
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Unknown track sender {0}")]
    UnknownSender(u64),

    #[error("Connection closed")]
    Closed,
}

// ============================================================================
// STATE TYPES
// ============================================================================

/// Signaling-Unterzustand der Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Konnektivität der Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Handle auf einen gesendeten Track, für `remove_track`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

/// Eingehender Track der Gegenseite
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    /// Stream-Label der Gegenseite (msid)
    pub stream_id: String,
    /// Der Track zum Rendern, falls aus einer echten Verbindung
    pub media: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, stream_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            stream_id: stream_id.into(),
            media: None,
        }
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

impl PartialEq for RemoteTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind && self.stream_id == other.stream_id
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events die von der Connection Core ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    LocalCandidate(IceCandidate),
    ConnectivityChanged(ConnectivityState),
    TrackAdded(RemoteTrack),
    TrackRemoved { track_id: String },
}

/// Rückkanal der Core-Events in die Engine
pub type CoreEventSender = mpsc::UnboundedSender<CoreEvent>;

// ============================================================================
// CONNECTION CORE
// ============================================================================

#[async_trait]
pub trait ConnectionCore: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, CoreError>;

    async fn remove_track(&self, sender: SenderId) -> Result<(), CoreError>;

    /// Erstellt ein Offer und setzt es als Local Description
    async fn create_offer(&self) -> Result<SessionDescription, CoreError>;

    /// Erstellt ein Answer und setzt es als Local Description
    async fn create_answer(&self) -> Result<SessionDescription, CoreError>;

    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<(), CoreError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), CoreError>;

    /// Verwirft ein eigenes, noch unbeantwortetes Offer
    async fn rollback(&self) -> Result<(), CoreError>;

    fn signaling_state(&self) -> SignalingState;

    async fn stats(&self) -> Result<StatsReport, CoreError>;

    async fn close(&self);
}

/// Erstellt pro Anruf eine neue Connection Core
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: CoreEventSender,
    ) -> Result<Arc<dyn ConnectionCore>, CoreError>;
}
