//! Media Module - lokale Capture-Geräte
//!
//! Dieses Modul verwaltet:
//! - Mikrofon Capture mit Software-Gain
//! - Kamera und Screen-Sharing über ein Plattform-Backend
//! - Lebenszyklus lokaler Tracks (Stop genau einmal, End-of-Stream)

mod acquirer;
mod audio;
mod track;
mod video;

pub use acquirer::{
    AudioProcessing, DeviceMediaAcquirer, MediaAcquirer, MicrophoneCapture, ScreenCapture,
};
pub use audio::{CaptureBuffer, FRAME_SIZE};
pub use track::{
    clamp_gain, GainStage, LocalTrack, TrackKind, TrackSource, MAX_INPUT_GAIN, PRIMARY_STREAM_ID,
    SAMPLE_RATE, SCREEN_STREAM_ID,
};
pub use video::{ReleaseFn, ScreenStart, VideoCaptureBackend, VideoConstraints};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("No capture device available: {0}")]
    NoDevice(String),

    #[error("Permission denied for {0}")]
    PermissionDenied(String),

    #[error("Unsupported capture configuration: {0}")]
    Unsupported(String),

    #[error("Capture stream failed: {0}")]
    Stream(String),
}
