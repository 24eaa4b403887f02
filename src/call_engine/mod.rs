//! Call Engine Module - Session State Machine und Peer Connection
//!
//! Dieses Modul verwaltet:
//! - Den Lebenszyklus eines Zwei-Personen-Anrufs (IDLE bis CONNECTED)
//! - Offer/Answer-Verhandlung inkl. Renegotiation und Glare
//! - ICE Candidate Pufferung
//! - Zuordnung eingehender Tracks
//! - Verbindungsstatistiken

mod candidates;
mod connection;
mod engine;
mod peer;
mod router;
mod state;
mod stats;

pub use candidates::{CandidateApplier, CandidateBuffer};
pub use connection::{
    ConnectionCore, ConnectionFactory, ConnectivityState, CoreError, CoreEvent, CoreEventSender,
    RemoteTrack, SenderId, SignalingState,
};
pub use engine::{CallEngine, EngineParts};
pub use peer::{WebRtcConnection, WebRtcConnectionFactory};
pub use router::{RemoteSink, RemoteTrackFlags, TrackRouter};
pub use state::{
    CallEngineError, CallEvent, CallSnapshot, CallState, ErrorKind, LocalTrackFlags, Negotiation,
};
pub use stats::{
    spawn_monitor, CandidatePairReport, ConnectivityStats, InboundReport, StatsReport,
    RESOLUTION_UNAVAILABLE,
};
