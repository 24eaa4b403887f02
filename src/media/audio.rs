//! Mikrofon-Capture über cpal
//!
//! cpal-Streams sind nicht `Send`. Der Stream lebt deshalb auf einem eigenen
//! Thread, der bis zum Stop-Signal blockiert; nach außen gehen nur der
//! Gain-Stage, der Ring-Buffer und ein Stop-Kanal.

use super::track::{GainStage, LocalTrack, SAMPLE_RATE};
use super::MediaError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use tokio::sync::oneshot;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für Audio-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// CAPTURE BUFFER
// ============================================================================

/// Ring-Buffer mit verarbeitetem Mikrofon-Audio (nach Gain), aus dem der
/// Encoder des Einbetters 20ms-Frames liest
#[derive(Clone)]
pub struct CaptureBuffer {
    inner: Arc<Mutex<HeapRb<f32>>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
        }
    }

    fn push(&self, samples: &[f32]) {
        let mut buffer = self.inner.lock();
        for sample in samples {
            let _ = buffer.try_push(*sample);
        }
    }

    /// Liest einen Frame von aufgenommenem Audio
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.inner.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }
        let mut frame = Vec::with_capacity(FRAME_SIZE);
        for _ in 0..FRAME_SIZE {
            if let Some(sample) = buffer.try_pop() {
                frame.push(sample);
            }
        }
        Some(frame)
    }
}

impl Default for CaptureBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CaptureBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureBuffer")
            .field("buffered", &self.inner.lock().occupied_len())
            .finish()
    }
}

// ============================================================================
// MICROPHONE STREAM
// ============================================================================

/// Öffnet das Standard-Mikrofon und startet die Aufnahme.
///
/// `raw` bekommt den Stop-Handle des Geräts; Stream-Fehler (Gerät entfernt)
/// werden als End-of-Stream auf `raw` gemeldet.
pub async fn open_microphone(
    raw: &LocalTrack,
    gain: GainStage,
    buffer: CaptureBuffer,
) -> Result<(), MediaError> {
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), MediaError>>();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
    let ended = raw.clone();

    std::thread::Builder::new()
        .name("mic-capture".to_string())
        .spawn(move || {
            let stream = match build_input_stream(gain, buffer, ended) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(MediaError::Stream(e.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            // Blockiert bis stop() oder bis der Sender gedroppt wird
            let _ = stop_rx.recv();
            drop(stream);
            tracing::info!("Audio capture stopped");
        })
        .map_err(|e| MediaError::Stream(e.to_string()))?;

    ready_rx
        .await
        .map_err(|_| MediaError::Stream("capture thread exited".to_string()))??;

    raw.set_on_stop(move || {
        let _ = stop_tx.send(());
    });
    Ok(())
}

fn build_input_stream(
    gain: GainStage,
    buffer: CaptureBuffer,
    ended: LocalTrack,
) -> Result<cpal::Stream, MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| MediaError::NoDevice("microphone".to_string()))?;

    let config = find_best_input_config(&device)?;

    tracing::info!(
        "Starting audio capture: {} Hz, {} channels",
        config.sample_rate.0,
        config.channels
    );

    let source_sample_rate = config.sample_rate.0;
    let channels = config.channels as usize;

    device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mut samples = resample(&downmix(data, channels), source_sample_rate, SAMPLE_RATE);
                gain.apply(&mut samples);
                buffer.push(&samples);
            },
            move |err| {
                tracing::error!("Audio capture error: {}", err);
                ended.end_of_stream();
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                MediaError::NoDevice("microphone".to_string())
            }
            other => MediaError::Stream(other.to_string()),
        })
}

/// Mischt mehrkanaliges Audio auf Mono
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Einfaches Linear-Resampling
fn resample(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || data.is_empty() {
        return data.to_vec();
    }
    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

/// Findet die beste Input-Konfiguration
fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| MediaError::Unsupported(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Wählt die beste Konfiguration aus einer Liste
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, MediaError> {
    // Priorität: 48kHz > andere, F32 > andere
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Ok(config.with_sample_rate(target_rate).into());
        }
    }

    for config in &configs {
        if config.sample_format() == SampleFormat::F32 {
            return Ok(config.with_max_sample_rate().into());
        }
    }

    Err(MediaError::Unsupported(
        "No f32 input configuration available".to_string(),
    ))
}
