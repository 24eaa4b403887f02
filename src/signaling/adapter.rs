//! Vertrag zwischen Call Engine und Realtime-Transport
//!
//! Der Transport ist ein externer Dienst. Die Engine leiht sich den Kanal
//! nur aus: sie abonniert einen Room-Topic, publiziert Nachrichten und
//! meldet sich beim Shutdown wieder ab, ohne den Kanal selbst zu schließen.

use super::messages::{RoomId, SignalingMessage};
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Already subscribed to room {0}")]
    AlreadySubscribed(String),
}

// ============================================================================
// ADAPTER TRAIT
// ============================================================================

/// Empfangsseite eines Room-Abos
pub type SignalingSink = mpsc::UnboundedSender<SignalingMessage>;

/// Best-effort Signaling-Kanal.
///
/// `publish` ist fire-and-forget: ein `Ok` bedeutet nur, dass die Nachricht
/// an den Transport übergeben wurde, nicht dass sie angekommen ist. Es gibt
/// weder Bestätigungen noch Wiederholungen noch eine Ordnungsgarantie.
/// Alle Methoden sind nicht-blockierend.
pub trait SignalingAdapter: Send + Sync {
    /// Abonniert den Topic eines Raums; eingehende Nachrichten landen in `sink`
    fn subscribe(&self, room: &RoomId, sink: SignalingSink) -> Result<(), SignalingError>;

    /// Übergibt eine Nachricht an den Transport
    fn publish(&self, room: &RoomId, message: &SignalingMessage) -> Result<(), SignalingError>;

    /// Beendet das Abo, der zugrunde liegende Kanal bleibt offen
    fn unsubscribe(&self, room: &RoomId);
}
