//! Signaling Module - Realtime-Broadcast für Offer/Answer/Candidates
//!
//! Dieses Modul verwaltet die Kommunikation über den Realtime-Transport:
//! - Wire-Format der vier Signaling-Nachrichten
//! - Adapter-Vertrag für die Call Engine
//! - WebSocket-Client für den Broadcast-Dienst
//!

mod adapter;
mod client;
mod messages;

pub use adapter::{SignalingAdapter, SignalingError, SignalingSink};
pub use client::{RealtimeClient, SignalingEvent};
pub use messages::*;
