//! WebRTC Connection Core
//!
//! Produktiv-Implementierung von [`ConnectionCore`] auf Basis der `webrtc`
//! crate. Callbacks der Peer Connection werden in [`CoreEvent`]s übersetzt.

use super::connection::{
    ConnectionCore, ConnectionFactory, ConnectivityState, CoreError, CoreEvent, CoreEventSender,
    RemoteTrack, SenderId, SignalingState,
};
use super::stats::{CandidatePairReport, InboundReport, StatsReport};
use crate::config::IceServerConfig;
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;

fn webrtc_err(e: webrtc::Error) -> CoreError {
    CoreError::WebRTC(e.to_string())
}

fn track_kind(kind: RTPCodecType) -> TrackKind {
    match kind {
        RTPCodecType::Video => TrackKind::Video,
        _ => TrackKind::Audio,
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erstellt pro Anruf eine neue [`WebRtcConnection`]
#[derive(Debug, Default)]
pub struct WebRtcConnectionFactory;

impl WebRtcConnectionFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: CoreEventSender,
    ) -> Result<Arc<dyn ConnectionCore>, CoreError> {
        let connection = WebRtcConnection::open(ice_servers, events).await?;
        Ok(Arc::new(connection))
    }
}

// ============================================================================
// CONNECTION
// ============================================================================

pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<u64, Arc<RTCRtpSender>>>,
    next_sender: AtomicU64,
    /// IDs der über `on_track` gemeldeten Remote-Tracks
    remote_tracks: Arc<Mutex<HashSet<String>>>,
    events: CoreEventSender,
}

impl WebRtcConnection {
    /// Erstellt eine neue Peer Connection
    pub async fn open(
        ice_servers: &[IceServerConfig],
        events: CoreEventSender,
    ) -> Result<Self, CoreError> {
        // Media Engine mit Opus/VP8 konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);

        let connection = Self {
            pc,
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(1),
            remote_tracks: Arc::new(Mutex::new(HashSet::new())),
            events,
        };
        connection.setup_handlers();

        Ok(connection)
    }

    /// Registriert Event Handler für die Peer Connection
    fn setup_handlers(&self) {
        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = match s {
                    RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                        ConnectivityState::New
                    }
                    RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectivityState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectivityState::Failed,
                    RTCPeerConnectionState::Closed => ConnectivityState::Closed,
                };
                let _ = events.send(CoreEvent::ConnectivityChanged(state));
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = events.send(CoreEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let events = self.events.clone();
        let remote_tracks = Arc::clone(&self.remote_tracks);
        self.pc.on_track(Box::new(move |track, _, _| {
            let id = track.id();
            if remote_tracks.lock().insert(id.clone()) {
                let remote = RemoteTrack {
                    id,
                    kind: track_kind(track.kind()),
                    stream_id: track.stream_id(),
                    media: Some(Arc::clone(&track)),
                };
                let _ = events.send(CoreEvent::TrackAdded(remote));
            }
            Box::pin(async {})
        }));
    }

    /// Meldet Remote-Tracks, deren Transceiver nicht mehr empfängt
    async fn detect_removed_tracks(&self) {
        let mut receiving = HashSet::new();
        for transceiver in self.pc.get_transceivers().await {
            let direction = transceiver.current_direction();
            if matches!(
                direction,
                RTCRtpTransceiverDirection::Recvonly | RTCRtpTransceiverDirection::Sendrecv
            ) {
                for track in transceiver.receiver().await.tracks().await {
                    receiving.insert(track.id());
                }
            }
        }

        let removed: Vec<String> = {
            let mut known = self.remote_tracks.lock();
            let removed = known
                .iter()
                .filter(|id| !receiving.contains(*id))
                .cloned()
                .collect::<Vec<_>>();
            for id in &removed {
                known.remove(id);
            }
            removed
        };

        for track_id in removed {
            let _ = self.events.send(CoreEvent::TrackRemoved { track_id });
        }
    }

    async fn set_local(&self, desc: RTCSessionDescription) -> Result<String, CoreError> {
        let sdp = desc.sdp.clone();
        self.pc.set_local_description(desc).await.map_err(webrtc_err)?;
        Ok(sdp)
    }
}

#[async_trait]
impl ConnectionCore for WebRtcConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, CoreError> {
        let rtc = Arc::clone(track.rtc()) as Arc<dyn TrackLocal + Send + Sync>;
        let sender = self.pc.add_track(rtc).await.map_err(webrtc_err)?;

        let id = self.next_sender.fetch_add(1, Ordering::Relaxed);
        self.senders.lock().insert(id, sender);
        tracing::debug!("Added local {:?} track {} as sender {}", track.kind(), track.id(), id);
        Ok(SenderId(id))
    }

    async fn remove_track(&self, sender: SenderId) -> Result<(), CoreError> {
        let rtp_sender = self
            .senders
            .lock()
            .remove(&sender.0)
            .ok_or(CoreError::UnknownSender(sender.0))?;
        self.pc.remove_track(&rtp_sender).await.map_err(webrtc_err)
    }

    async fn create_offer(&self) -> Result<SessionDescription, CoreError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        let sdp = self.set_local(offer).await?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CoreError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        let sdp = self.set_local(answer).await?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<(), CoreError> {
        let parsed = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
            other => return Err(CoreError::InvalidSdp(format!("unexpected {:?}", other))),
        }
        .map_err(|e| CoreError::InvalidSdp(e.to_string()))?;

        self.pc.set_remote_description(parsed).await.map_err(webrtc_err)?;
        self.detect_removed_tracks().await;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), CoreError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(webrtc_err)
    }

    async fn rollback(&self) -> Result<(), CoreError> {
        if self.signaling_state() == SignalingState::Stable {
            return Ok(());
        }
        // Rollback-Descriptions lassen sich nur über serde konstruieren
        let rollback: RTCSessionDescription =
            serde_json::from_value(serde_json::json!({ "type": "rollback", "sdp": "" }))
                .map_err(|e| CoreError::InvalidSdp(e.to_string()))?;
        self.pc.set_local_description(rollback).await.map_err(webrtc_err)
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    /// Einschränkung: `webrtc` füllt `InboundRTPStats` ohne `packetsLost`
    /// und ohne Frame-Felder, da nichts dekodiert wird. Verlust kommt daher
    /// aus `RemoteInboundRTP`, also aus dem Empfängerbericht der Gegenseite
    /// über unsere gesendeten Streams. Auflösung und FPS bleiben "N/A"/0.
    async fn stats(&self) -> Result<StatsReport, CoreError> {
        let raw = self.pc.get_stats().await;
        let mut report = StatsReport::default();
        let mut audio_lost = 0;
        let mut video_lost = 0;

        for stat in raw.reports.values() {
            match stat {
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    report.candidate_pair = Some(CandidatePairReport {
                        current_round_trip_time: Some(pair.current_round_trip_time),
                    });
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    if remote.kind == "video" {
                        video_lost += remote.packets_lost;
                    } else {
                        audio_lost += remote.packets_lost;
                    }
                }
                StatsReportType::InboundRTP(inbound) if inbound.kind == "video" => {
                    report.inbound_video.push(InboundReport::default());
                }
                StatsReportType::InboundRTP(_) => {
                    report.inbound_audio.get_or_insert_with(InboundReport::default);
                }
                _ => {}
            }
        }

        if let Some(audio) = report.inbound_audio.as_mut() {
            audio.packets_lost = audio_lost;
        }
        if let Some(video) = report.inbound_video.first_mut() {
            video.packets_lost = video_lost;
        }
        Ok(report)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error closing peer connection: {}", e);
        }
    }
}
