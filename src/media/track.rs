//! Lokale Tracks und Software-Gain
//!
//! Jeder erworbene Stream besitzt genau einen Stop-Handle. `stop()` darf
//! beliebig oft aufgerufen werden, nur der erste Aufruf hat eine Wirkung.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Stream-ID für Mikrofon und Kamera
pub const PRIMARY_STREAM_ID: &str = "primary";

/// Stream-ID für Screen-Sharing (inkl. System-Audio)
pub const SCREEN_STREAM_ID: &str = "screen";

/// Obergrenze des Software-Gains
pub const MAX_INPUT_GAIN: f32 = 3.0;

// ============================================================================
// TRACK KIND / SOURCE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Woher ein lokaler Track stammt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
    SystemAudio,
}

impl TrackSource {
    pub fn kind(self) -> TrackKind {
        match self {
            TrackSource::Microphone | TrackSource::SystemAudio => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }

    /// Stream-Label, über das die Gegenseite den Track zuordnet
    pub fn stream_id(self) -> &'static str {
        match self {
            TrackSource::Microphone | TrackSource::Camera => PRIMARY_STREAM_ID,
            TrackSource::Screen | TrackSource::SystemAudio => SCREEN_STREAM_ID,
        }
    }

    fn codec(self) -> RTCRtpCodecCapability {
        match self.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }
}

// ============================================================================
// LOCAL TRACK
// ============================================================================

type StopFn = Box<dyn FnOnce() + Send>;

struct Lifecycle {
    stopped: AtomicBool,
    on_stop: Mutex<Option<StopFn>>,
    ended_tx: watch::Sender<bool>,
}

/// Handle auf einen lokal erfassten Track.
///
/// Klone teilen sich denselben Lebenszyklus.
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    source: TrackSource,
    rtc: Arc<TrackLocalStaticSample>,
    lifecycle: Arc<Lifecycle>,
}

impl LocalTrack {
    pub fn new(source: TrackSource) -> Self {
        let id = format!("{:?}-{}", source, uuid::Uuid::new_v4()).to_lowercase();
        let rtc = Arc::new(TrackLocalStaticSample::new(
            source.codec(),
            id.clone(),
            source.stream_id().to_string(),
        ));
        let (ended_tx, _) = watch::channel(false);

        Self {
            id,
            source,
            rtc,
            lifecycle: Arc::new(Lifecycle {
                stopped: AtomicBool::new(false),
                on_stop: Mutex::new(None),
                ended_tx,
            }),
        }
    }

    /// Registriert die Aktion, die beim Stoppen das Gerät freigibt
    pub fn set_on_stop(&self, on_stop: impl FnOnce() + Send + 'static) {
        let mut slot = self.lifecycle.on_stop.lock();
        if self.is_stopped() {
            drop(slot);
            on_stop();
            return;
        }
        *slot = Some(Box::new(on_stop));
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    /// Der WebRTC-Track, in den Encoder ihre Samples schreiben
    pub fn rtc(&self) -> &Arc<TrackLocalStaticSample> {
        &self.rtc
    }

    /// Stoppt den Track. Gibt `true` zurück, wenn dieser Aufruf gestoppt hat.
    pub fn stop(&self) -> bool {
        if self.lifecycle.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(on_stop) = self.lifecycle.on_stop.lock().take() {
            on_stop();
        }
        self.lifecycle.ended_tx.send_replace(true);
        tracing::debug!("Local track {} stopped", self.id);
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.lifecycle.stopped.load(Ordering::SeqCst)
    }

    /// Meldet das Ende des Streams (Gerät entfernt, Berechtigung entzogen)
    pub fn end_of_stream(&self) {
        tracing::info!("Local track {} ended by device", self.id);
        self.lifecycle.ended_tx.send_replace(true);
    }

    /// Beobachter für das Stream-Ende
    pub fn ended(&self) -> watch::Receiver<bool> {
        self.lifecycle.ended_tx.subscribe()
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// ============================================================================
// GAIN STAGE
// ============================================================================

/// Begrenzt einen Gain-Wert auf `0.0..=MAX_INPUT_GAIN`, ungültige Werte werden 1.0
pub fn clamp_gain(gain: f32) -> f32 {
    if gain.is_finite() {
        gain.clamp(0.0, MAX_INPUT_GAIN)
    } else {
        1.0
    }
}

/// Software-Gain zwischen Roh- und verarbeitetem Mikrofon-Signal
#[derive(Debug, Clone)]
pub struct GainStage {
    gain: Arc<AtomicU32>,
    muted: Arc<AtomicBool>,
}

impl GainStage {
    pub fn new() -> Self {
        Self {
            gain: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            muted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setzt den Gain, begrenzt auf `0.0..=MAX_INPUT_GAIN`. Gibt den
    /// tatsächlich gesetzten Wert zurück.
    pub fn set_gain(&self, gain: f32) -> f32 {
        let gain = clamp_gain(gain);
        self.gain.store(gain.to_bits(), Ordering::Relaxed);
        gain
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Relaxed))
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
        tracing::debug!("Audio muted: {}", muted);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Wendet Gain bzw. Mute auf einen Sample-Block an
    pub fn apply(&self, samples: &mut [f32]) {
        if self.is_muted() {
            samples.iter_mut().for_each(|s| *s = 0.0);
            return;
        }

        let gain = self.gain();
        if (gain - 1.0).abs() < f32::EPSILON {
            return;
        }
        for sample in samples.iter_mut() {
            *sample = (*sample * gain).clamp(-1.0, 1.0);
        }
    }
}

impl Default for GainStage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_double_stop_is_noop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let track = LocalTrack::new(TrackSource::Camera);
        let counter = Arc::clone(&calls);
        track.set_on_stop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(track.stop());
        assert!(!track.stop());
        assert!(!track.clone().stop());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_stop_after_stop_runs_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let track = LocalTrack::new(TrackSource::Screen);
        track.stop();

        let counter = Arc::clone(&calls);
        track.set_on_stop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_signals_ended() {
        let track = LocalTrack::new(TrackSource::Microphone);
        let ended = track.ended();
        assert!(!*ended.borrow());
        track.stop();
        assert!(*ended.borrow());
    }

    #[test]
    fn test_end_of_stream_does_not_stop() {
        let track = LocalTrack::new(TrackSource::Camera);
        track.end_of_stream();
        assert!(*track.ended().borrow());
        assert!(!track.is_stopped());
    }

    #[test]
    fn test_stream_labels() {
        assert_eq!(TrackSource::Camera.stream_id(), PRIMARY_STREAM_ID);
        assert_eq!(TrackSource::Screen.stream_id(), SCREEN_STREAM_ID);
        assert_eq!(TrackSource::SystemAudio.kind(), TrackKind::Audio);
    }

    #[test]
    fn test_gain_is_clamped() {
        let stage = GainStage::new();
        assert_eq!(stage.set_gain(5.0), MAX_INPUT_GAIN);
        assert_eq!(stage.set_gain(-1.0), 0.0);
        assert_eq!(stage.set_gain(f32::NAN), 1.0);
    }

    #[test]
    fn test_gain_apply() {
        let stage = GainStage::new();
        stage.set_gain(2.0);
        let mut samples = [0.25, -0.25, 0.75];
        stage.apply(&mut samples);
        assert_eq!(samples, [0.5, -0.5, 1.0]);

        stage.set_muted(true);
        stage.apply(&mut samples);
        assert_eq!(samples, [0.0, 0.0, 0.0]);
    }
}
