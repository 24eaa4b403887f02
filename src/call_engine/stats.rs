//! Stats Monitor - Verbindungsqualität während CONNECTED
//!
//! Pollt die Connection Core im festen Intervall und leitet RTT, Paketverlust,
//! Auflösung und Framerate ab. Ein fehlgeschlagener Poll überspringt nur
//! diesen Tick, der Anruf läuft weiter.

use super::connection::ConnectionCore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Platzhalter, wenn kein Video empfangen wird
pub const RESOLUTION_UNAVAILABLE: &str = "N/A";

// ============================================================================
// RAW REPORTS
// ============================================================================

/// Aktives Candidate-Pair
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidatePairReport {
    /// Aktuelle Round-Trip-Time in Sekunden
    pub current_round_trip_time: Option<f64>,
}

/// Eingehender RTP-Stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundReport {
    pub packets_lost: i64,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    pub frames_per_second: Option<f64>,
}

/// Rohdaten eines Stats-Polls
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsReport {
    pub candidate_pair: Option<CandidatePairReport>,
    pub inbound_audio: Option<InboundReport>,
    pub inbound_video: Vec<InboundReport>,
}

// ============================================================================
// CONNECTIVITY STATS
// ============================================================================

/// Momentaufnahme der Verbindungsqualität, wird nie historisiert
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityStats {
    pub rtt_ms: u32,
    pub packets_lost: i64,
    pub resolution: String,
    pub fps: f64,
    pub sampled_at: DateTime<Utc>,
}

impl ConnectivityStats {
    pub fn from_report(report: &StatsReport) -> Self {
        let rtt_ms = report
            .candidate_pair
            .as_ref()
            .and_then(|pair| pair.current_round_trip_time)
            .filter(|rtt| rtt.is_finite() && *rtt >= 0.0)
            .map(|rtt| (rtt * 1000.0).round() as u32)
            .unwrap_or(0);

        let video = report.inbound_video.first();

        let packets_lost = report.inbound_audio.as_ref().map_or(0, |a| a.packets_lost)
            + video.map_or(0, |v| v.packets_lost);

        let resolution = video
            .and_then(|v| Some(format!("{}x{}", v.frame_width?, v.frame_height?)))
            .unwrap_or_else(|| RESOLUTION_UNAVAILABLE.to_string());

        let fps = video.and_then(|v| v.frames_per_second).unwrap_or(0.0);

        Self {
            rtt_ms,
            packets_lost,
            resolution,
            fps,
            sampled_at: Utc::now(),
        }
    }
}

// ============================================================================
// MONITOR TASK
// ============================================================================

/// Startet den Poll-Loop. `on_sample` gibt `false` zurück, um zu stoppen.
pub fn spawn_monitor<F>(
    core: Arc<dyn ConnectionCore>,
    interval: Duration,
    on_sample: F,
) -> JoinHandle<()>
where
    F: Fn(ConnectivityStats) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Der erste Tick kommt sofort, die erste Messung nach einem Intervall
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match core.stats().await {
                Ok(report) => {
                    if !on_sample(ConnectivityStats::from_report(&report)) {
                        break;
                    }
                }
                Err(e) => tracing::debug!("Stats poll skipped: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(lost: i64) -> InboundReport {
        InboundReport {
            packets_lost: lost,
            frame_width: Some(1280),
            frame_height: Some(720),
            frames_per_second: Some(29.97),
        }
    }

    #[test]
    fn test_full_report() {
        let report = StatsReport {
            candidate_pair: Some(CandidatePairReport {
                current_round_trip_time: Some(0.0425),
            }),
            inbound_audio: Some(InboundReport {
                packets_lost: 3,
                ..Default::default()
            }),
            inbound_video: vec![video(4), video(100)],
        };

        let stats = ConnectivityStats::from_report(&report);
        assert_eq!(stats.rtt_ms, 43);
        // Nur der erste Video-Report zählt
        assert_eq!(stats.packets_lost, 7);
        assert_eq!(stats.resolution, "1280x720");
        assert_eq!(stats.fps, 29.97);
    }

    #[test]
    fn test_audio_only_uses_sentinels() {
        let report = StatsReport {
            candidate_pair: None,
            inbound_audio: Some(InboundReport {
                packets_lost: 2,
                ..Default::default()
            }),
            inbound_video: Vec::new(),
        };

        let stats = ConnectivityStats::from_report(&report);
        assert_eq!(stats.rtt_ms, 0);
        assert_eq!(stats.packets_lost, 2);
        assert_eq!(stats.resolution, RESOLUTION_UNAVAILABLE);
        assert_eq!(stats.fps, 0.0);
    }

    #[test]
    fn test_video_without_dimensions() {
        let report = StatsReport {
            inbound_video: vec![InboundReport::default()],
            ..Default::default()
        };
        assert_eq!(
            ConnectivityStats::from_report(&report).resolution,
            RESOLUTION_UNAVAILABLE
        );
    }

    #[test]
    fn test_serializes_camel_case() {
        let stats = ConnectivityStats::from_report(&StatsReport::default());
        let value = serde_json::to_value(&stats).unwrap();
        assert!(value.get("rttMs").is_some());
        assert!(value.get("packetsLost").is_some());
    }
}
