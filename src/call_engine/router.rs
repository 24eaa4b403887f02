//! Track Router - eingehende Tracks auf zwei logische Senken verteilen
//!
//! `Primary` bündelt Mikrofon und Kamera, `Secondary` ist Screen-Sharing.
//! Tracks mit bekanntem Stream-Label werden nach Label zugeordnet. Ohne Label
//! gilt die Ankunftsreihenfolge: das erste Video ist die Kamera, jedes
//! weitere der Bildschirm. Das setzt voraus, dass die Kamera vor dem
//! Bildschirm verhandelt wird.

use super::connection::RemoteTrack;
use crate::media::{TrackKind, PRIMARY_STREAM_ID, SCREEN_STREAM_ID};
use serde::Serialize;

/// Logische Senke für eingehende Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteSink {
    Primary,
    Secondary,
}

#[derive(Debug, Default, Clone)]
struct SinkSlots {
    audio: Option<RemoteTrack>,
    video: Option<RemoteTrack>,
}

impl SinkSlots {
    fn slot(&mut self, kind: TrackKind) -> &mut Option<RemoteTrack> {
        match kind {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Video => &mut self.video,
        }
    }

    fn remove(&mut self, track_id: &str) -> bool {
        for slot in [&mut self.audio, &mut self.video] {
            if slot.as_ref().is_some_and(|t| t.id == track_id) {
                *slot = None;
                return true;
            }
        }
        false
    }

    fn contains(&self, track_id: &str) -> bool {
        [&self.audio, &self.video]
            .iter()
            .any(|slot| slot.as_ref().is_some_and(|t| t.id == track_id))
    }
}

/// Welche Remote-Senken aktuell belegt sind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemoteTrackFlags {
    pub primary_audio: bool,
    pub primary_video: bool,
    pub secondary_video: bool,
}

#[derive(Debug, Default)]
pub struct TrackRouter {
    primary: SinkSlots,
    secondary: SinkSlots,
}

impl TrackRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordnet einen eingehenden Track einer Senke zu. Ein bereits bekannter
    /// Track (gleiche ID) wird ignoriert.
    pub fn route(&mut self, track: RemoteTrack) -> Option<RemoteSink> {
        if self.primary.contains(&track.id) || self.secondary.contains(&track.id) {
            tracing::debug!("Track {} already routed", track.id);
            return None;
        }

        let sink = match (track.stream_id.as_str(), track.kind) {
            (SCREEN_STREAM_ID, _) => RemoteSink::Secondary,
            (PRIMARY_STREAM_ID, _) => RemoteSink::Primary,
            (_, TrackKind::Audio) => RemoteSink::Primary,
            (_, TrackKind::Video) if self.primary.video.is_none() => RemoteSink::Primary,
            (_, TrackKind::Video) => RemoteSink::Secondary,
        };

        let slots = match sink {
            RemoteSink::Primary => &mut self.primary,
            RemoteSink::Secondary => &mut self.secondary,
        };
        if let Some(previous) = slots.slot(track.kind).replace(track) {
            tracing::debug!("Replaced remote {:?} track {}", previous.kind, previous.id);
        }
        Some(sink)
    }

    /// Löst einen Track von seiner Senke
    pub fn remove(&mut self, track_id: &str) -> Option<RemoteSink> {
        if self.primary.remove(track_id) {
            Some(RemoteSink::Primary)
        } else if self.secondary.remove(track_id) {
            Some(RemoteSink::Secondary)
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.primary = SinkSlots::default();
        self.secondary = SinkSlots::default();
    }

    pub fn flags(&self) -> RemoteTrackFlags {
        RemoteTrackFlags {
            primary_audio: self.primary.audio.is_some(),
            primary_video: self.primary.video.is_some(),
            secondary_video: self.secondary.video.is_some(),
        }
    }
}
