//! Kamera- und Bildschirm-Capture
//!
//! Die eigentliche Aufnahme ist plattformspezifisch und wird vom Einbetter
//! über [`VideoCaptureBackend`] bereitgestellt. Das Backend schreibt
//! kodierte Samples in den übergebenen Track und meldet ein Geräte-Ende
//! über [`LocalTrack::end_of_stream`].

use super::track::LocalTrack;
use super::MediaError;

/// Video-Profil einer Kamera-Anfrage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl VideoConstraints {
    /// Festes 1080p/60-Profil, unabhängig vom Tarif des Anrufers
    pub const HIGH_QUALITY: Self = Self {
        width: 1920,
        height: 1080,
        frame_rate: 60,
    };
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self::HIGH_QUALITY
    }
}

/// Gibt das Capture-Gerät frei
pub type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Ergebnis eines gestarteten Screen-Captures
pub struct ScreenStart {
    pub release: ReleaseFn,
    /// Ob das Backend System-Audio in den Audio-Track liefert
    pub system_audio: bool,
}

/// Plattform-Backend für Kamera und Bildschirm
pub trait VideoCaptureBackend: Send + Sync {
    /// Startet die Kamera mit dem angefragten Profil
    fn start_camera(
        &self,
        constraints: &VideoConstraints,
        track: LocalTrack,
    ) -> Result<ReleaseFn, MediaError>;

    /// Startet das Screen-Capture; `system_audio` darf ignoriert werden
    fn start_screen(
        &self,
        video: LocalTrack,
        system_audio: LocalTrack,
    ) -> Result<ScreenStart, MediaError>;
}
