//! Message Types für das Call-Signaling
//!
//! Das Wire-Format muss exakt dem der Web-Clients entsprechen:
//! `{ type, sdp?, candidate?, callerId? }`

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// SESSION DESCRIPTION
// ============================================================================

/// Typ einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session Description wie sie über das Signaling übertragen wird
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

// ============================================================================
// ICE CANDIDATE
// ============================================================================

/// ICE Candidate im JSON-Format des Browsers (`RTCIceCandidateInit`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

// ============================================================================
// SIGNALING MESSAGE
// ============================================================================

/// Alle Nachrichten die über den Room-Kanal laufen.
///
/// Zustellung ist fire-and-forget: keine Bestätigung, keine Wiederholung,
/// keine garantierte Reihenfolge. Empfänger dürfen nicht annehmen, dass
/// Candidates nach dem zugehörigen Answer eintreffen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// SDP Offer (initial oder Renegotiation)
    Offer {
        sdp: SessionDescription,
        #[serde(rename = "callerId", default)]
        caller_id: String,
    },

    /// SDP Answer
    Answer { sdp: SessionDescription },

    /// ICE Candidate
    Candidate { candidate: IceCandidate },

    /// Anruf beendet
    Hangup,
}

impl SignalingMessage {
    /// Kurzname für Logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
            SignalingMessage::Hangup => "hangup",
        }
    }
}

// ============================================================================
// ROOM IDENTITY
// ============================================================================

/// Broadcast-Topic eines Zwei-Personen-Raums.
///
/// Der Schlüssel ist die sortierte Verkettung beider Teilnehmer-IDs, damit
/// beide Seiten unabhängig voneinander denselben Topic berechnen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn between(a: &str, b: &str) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{first}{second}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
