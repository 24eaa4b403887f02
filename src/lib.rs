//! Pulse Call - P2P Zwei-Personen-Anrufe
//!
//! Session-Management für serverlose Audio/Video-Anrufe mit:
//! - Realtime-Broadcast als Signaling-Kanal
//! - WebRTC für die P2P-Verbindung
//! - Mikrofon, Kamera und Screen-Sharing als lokale Tracks
//!
//! Die UI bettet [`CallEngine`] ein, ruft die Befehle auf und beobachtet
//! [`CallSnapshot`] bzw. [`CallEvent`].

pub mod call_engine;
pub mod config;
pub mod media;
pub mod signaling;

pub use call_engine::{
    CallEngine, CallEngineError, CallEvent, CallSnapshot, CallState, EngineParts, ErrorKind,
    RemoteSink,
};
pub use config::{CallConfig, ConfigError, IceServerConfig};
pub use signaling::{RealtimeClient, RoomId, SignalingAdapter, SignalingMessage};

use tracing_subscriber::EnvFilter;

/// Initialisiert Logging. Mehrfacher Aufruf ist unkritisch.
pub fn init_tracing() {
    let mut filter = EnvFilter::from_default_env();
    for directive in ["pulse_call=debug", "webrtc=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
