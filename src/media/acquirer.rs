//! Media Acquirer - lokale Capture-Geräte anfordern und freigeben

use super::audio::{open_microphone, CaptureBuffer};
use super::track::{GainStage, LocalTrack, TrackSource};
use super::video::{VideoCaptureBackend, VideoConstraints};
use super::MediaError;
use async_trait::async_trait;
use std::sync::Arc;

// ============================================================================
// CAPTURE RESULTS
// ============================================================================

/// Vom Mikrofon angefragte Vorverarbeitung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioProcessing {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioProcessing {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Ein geöffnetes Mikrofon: Roh-Signal, Gain-Stage, verarbeitetes Signal
#[derive(Debug, Clone)]
pub struct MicrophoneCapture {
    /// Hält das Gerät; stoppen gibt das Mikrofon frei
    pub raw: LocalTrack,
    /// Nach dem Gain, dieser Track geht an die Connection Core
    pub processed: LocalTrack,
    pub gain: GainStage,
    /// Verarbeitete Samples für den Encoder (nur bei echten Geräten)
    pub buffer: Option<CaptureBuffer>,
}

impl MicrophoneCapture {
    /// Verbindet Roh- und verarbeiteten Track, sodass beide gemeinsam enden
    pub fn new(raw: LocalTrack, buffer: Option<CaptureBuffer>) -> Self {
        let processed = LocalTrack::new(TrackSource::Microphone);
        let raw_clone = raw.clone();
        processed.set_on_stop(move || {
            raw_clone.stop();
        });

        Self {
            raw,
            processed,
            gain: GainStage::new(),
            buffer,
        }
    }

    pub fn stop(&self) {
        self.processed.stop();
        self.raw.stop();
    }
}

/// Ein geöffnetes Screen-Capture mit optionalem System-Audio
#[derive(Debug, Clone)]
pub struct ScreenCapture {
    pub video: LocalTrack,
    pub audio: Option<LocalTrack>,
}

impl ScreenCapture {
    pub fn tracks(&self) -> Vec<LocalTrack> {
        std::iter::once(self.video.clone())
            .chain(self.audio.clone())
            .collect()
    }
}

// ============================================================================
// ACQUIRER TRAIT
// ============================================================================

#[async_trait]
pub trait MediaAcquirer: Send + Sync {
    /// Öffnet das Mikrofon, Gain startet bei 1.0
    async fn acquire_microphone(
        &self,
        processing: AudioProcessing,
    ) -> Result<MicrophoneCapture, MediaError>;

    /// Öffnet die Kamera mit dem angegebenen Profil
    async fn acquire_camera(&self, constraints: VideoConstraints)
        -> Result<LocalTrack, MediaError>;

    /// Startet Screen-Sharing (plus System-Audio, falls verfügbar)
    async fn acquire_screen(&self) -> Result<ScreenCapture, MediaError>;
}

// ============================================================================
// DEVICE ACQUIRER
// ============================================================================

/// Acquirer für echte Geräte: Mikrofon über cpal, Video über ein Backend
#[derive(Clone, Default)]
pub struct DeviceMediaAcquirer {
    video: Option<Arc<dyn VideoCaptureBackend>>,
}

impl DeviceMediaAcquirer {
    pub fn new() -> Self {
        Self { video: None }
    }

    pub fn with_video_backend(mut self, backend: Arc<dyn VideoCaptureBackend>) -> Self {
        self.video = Some(backend);
        self
    }

    fn video_backend(&self, what: &str) -> Result<&Arc<dyn VideoCaptureBackend>, MediaError> {
        self.video
            .as_ref()
            .ok_or_else(|| MediaError::NoDevice(format!("{} (no video capture backend)", what)))
    }
}

#[async_trait]
impl MediaAcquirer for DeviceMediaAcquirer {
    async fn acquire_microphone(
        &self,
        processing: AudioProcessing,
    ) -> Result<MicrophoneCapture, MediaError> {
        // cpal liefert das Roh-Signal; die Flags sind Hinweise an Plattformen
        // mit eingebauter Sprachverarbeitung
        tracing::debug!("Requesting microphone with {:?}", processing);

        let buffer = CaptureBuffer::new();
        let capture = MicrophoneCapture::new(LocalTrack::new(TrackSource::Microphone), Some(buffer.clone()));
        open_microphone(&capture.raw, capture.gain.clone(), buffer).await?;

        tracing::info!("Microphone acquired: {}", capture.processed.id());
        Ok(capture)
    }

    async fn acquire_camera(
        &self,
        constraints: VideoConstraints,
    ) -> Result<LocalTrack, MediaError> {
        let backend = self.video_backend("camera")?;
        let track = LocalTrack::new(TrackSource::Camera);

        let release = backend.start_camera(&constraints, track.clone())?;
        track.set_on_stop(release);

        tracing::info!(
            "Camera acquired: {}x{}@{}",
            constraints.width,
            constraints.height,
            constraints.frame_rate
        );
        Ok(track)
    }

    async fn acquire_screen(&self) -> Result<ScreenCapture, MediaError> {
        let backend = self.video_backend("screen")?;
        let video = LocalTrack::new(TrackSource::Screen);
        let audio = LocalTrack::new(TrackSource::SystemAudio);

        let started = backend.start_screen(video.clone(), audio.clone())?;
        video.set_on_stop(started.release);

        let audio = if started.system_audio {
            Some(audio)
        } else {
            audio.stop();
            None
        };

        tracing::info!("Screen capture acquired (system audio: {})", audio.is_some());
        Ok(ScreenCapture { video, audio })
    }
}

impl std::fmt::Debug for DeviceMediaAcquirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMediaAcquirer")
            .field("has_video_backend", &self.video.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::video::{ReleaseFn, ScreenStart};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        released: Arc<AtomicUsize>,
        system_audio: bool,
    }

    impl VideoCaptureBackend for CountingBackend {
        fn start_camera(
            &self,
            _constraints: &VideoConstraints,
            _track: LocalTrack,
        ) -> Result<ReleaseFn, MediaError> {
            let released = Arc::clone(&self.released);
            Ok(Box::new(move || {
                released.fetch_add(1, Ordering::SeqCst);
            }))
        }

        fn start_screen(
            &self,
            _video: LocalTrack,
            _system_audio: LocalTrack,
        ) -> Result<ScreenStart, MediaError> {
            let released = Arc::clone(&self.released);
            Ok(ScreenStart {
                release: Box::new(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                }),
                system_audio: self.system_audio,
            })
        }
    }

    #[test]
    fn test_microphone_tracks_stop_together() {
        let capture = MicrophoneCapture::new(LocalTrack::new(TrackSource::Microphone), None);
        capture.processed.stop();
        assert!(capture.raw.is_stopped());
        capture.stop();
    }

    #[tokio::test]
    async fn test_camera_without_backend_is_device_error() {
        let acquirer = DeviceMediaAcquirer::new();
        let err = acquirer
            .acquire_camera(VideoConstraints::HIGH_QUALITY)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::NoDevice(_)));
    }

    #[tokio::test]
    async fn test_camera_release_runs_once() {
        let backend = Arc::new(CountingBackend::default());
        let acquirer = DeviceMediaAcquirer::new().with_video_backend(backend.clone());

        let track = acquirer.acquire_camera(VideoConstraints::default()).await.unwrap();
        track.stop();
        track.stop();
        assert_eq!(backend.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_screen_without_system_audio() {
        let backend = Arc::new(CountingBackend::default());
        let acquirer = DeviceMediaAcquirer::new().with_video_backend(backend);

        let screen = acquirer.acquire_screen().await.unwrap();
        assert!(screen.audio.is_none());
        assert_eq!(screen.tracks().len(), 1);
    }

    #[tokio::test]
    async fn test_screen_with_system_audio() {
        let backend = Arc::new(CountingBackend {
            system_audio: true,
            ..Default::default()
        });
        let acquirer = DeviceMediaAcquirer::new().with_video_backend(backend);

        let screen = acquirer.acquire_screen().await.unwrap();
        assert_eq!(screen.tracks().len(), 2);
        assert_eq!(screen.tracks()[1].source(), TrackSource::SystemAudio);
    }
}
