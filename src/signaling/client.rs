//! WebSocket Client für den Realtime-Broadcast-Dienst
//!
//! Verwaltet die WebSocket-Verbindung zum Realtime-Transport:
//! - Room-Topics abonnieren (`join` / `leave`)
//! - Broadcast-Nachrichten senden und empfangen
//! - Heartbeat-Keeping
//! - Event-basierte Kommunikation

use super::adapter::{SignalingAdapter, SignalingError, SignalingSink};
use super::messages::{RoomId, SignalingMessage};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Heartbeat-Intervall (der Transport schließt idle Verbindungen nach ~30s)
const HEARTBEAT_INTERVAL_SECS: u64 = 25;

/// Größe der ausgehenden Queue
const OUTBOUND_QUEUE_SIZE: usize = 100;

// ============================================================================
// WIRE ENVELOPES
// ============================================================================

/// Nachrichten vom Client an den Transport
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ClientEnvelope<'a> {
    Join {
        topic: &'a str,
        #[serde(rename = "clientId")]
        client_id: &'a str,
        timestamp: i64,
    },
    Leave {
        topic: &'a str,
        timestamp: i64,
    },
    Broadcast {
        topic: &'a str,
        payload: &'a SignalingMessage,
        timestamp: i64,
    },
    Heartbeat {
        timestamp: i64,
    },
}

/// Nachrichten vom Transport an den Client
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ServerEnvelope {
    Joined {
        topic: String,
    },
    Broadcast {
        topic: String,
        payload: serde_json::Value,
    },
    Error {
        code: i32,
        message: String,
    },
    Pong,
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom RealtimeClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Verbunden mit dem Transport
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Topic erfolgreich abonniert
    Joined { topic: String },

    /// Fehler vom Server
    Error { code: i32, message: String },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Default)]
struct ClientState {
    is_connected: bool,
    subscribers: HashMap<String, SignalingSink>,
}

// ============================================================================
// REALTIME CLIENT
// ============================================================================

/// WebSocket Client, der den [`SignalingAdapter`]-Vertrag erfüllt
pub struct RealtimeClient {
    server_url: String,
    client_id: String,
    state: Arc<RwLock<ClientState>>,
    tx: Option<mpsc::Sender<String>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl RealtimeClient {
    /// Erstellt einen neuen RealtimeClient
    pub fn new(server_url: String, client_id: String) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            server_url,
            client_id,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: None,
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe_events(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Baut die WebSocket-URL aus der konfigurierten Server-URL
    fn websocket_url(&self) -> Result<Url, SignalingError> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(SignalingError::ConnectionFailed(format!(
                    "unsupported scheme: {}",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| SignalingError::ConnectionFailed("invalid scheme".to_string()))?;

        let path = format!("{}/realtime", url.path().trim_end_matches('/'));
        url.set_path(&path);
        Ok(url)
    }

    /// Verbindet mit dem Realtime-Transport
    pub async fn connect(&mut self) -> Result<(), SignalingError> {
        let ws_url = self.websocket_url()?;

        tracing::info!("Connecting to realtime transport: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_SIZE);
        self.tx = Some(tx);

        self.state.write().is_connected = true;
        let _ = self.event_tx.send(SignalingEvent::Connected);

        // Read-Task starten
        let state_clone = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        Self::handle_server_message(&text, &state_clone, &event_tx);
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state_clone.write().is_connected = false;
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task starten
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        Ok(())
    }

    /// Startet einen Heartbeat-Task
    pub fn start_heartbeat(self: Arc<Self>) {
        let client = Arc::clone(&self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
            loop {
                interval.tick().await;
                if !client.is_connected() {
                    tracing::info!("Heartbeat: client disconnected, stopping heartbeat task");
                    break;
                }
                let envelope = ClientEnvelope::Heartbeat {
                    timestamp: Utc::now().timestamp_millis(),
                };
                if let Err(e) = client.send_envelope(&envelope) {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
    }

    /// Serialisiert einen Envelope und reiht ihn non-blocking ein
    fn send_envelope(&self, envelope: &ClientEnvelope<'_>) -> Result<(), SignalingError> {
        let tx = self.tx.as_ref().ok_or(SignalingError::NotConnected)?;
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let msg_string = serde_json::to_string(envelope)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        // try_send ist non-blocking
        tx.try_send(msg_string)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Verarbeitet eingehende Server-Nachrichten
    fn handle_server_message(
        text: &str,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<SignalingEvent>,
    ) {
        let envelope = match serde_json::from_str::<ServerEnvelope>(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!("Ignoring unparseable server message: {}", e);
                return;
            }
        };

        match envelope {
            ServerEnvelope::Joined { topic } => {
                tracing::info!("Joined topic {}", topic);
                let _ = event_tx.send(SignalingEvent::Joined { topic });
            }

            ServerEnvelope::Broadcast { topic, payload } => {
                let message = match serde_json::from_value::<SignalingMessage>(payload) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!("Dropping malformed signaling payload on {}: {}", topic, e);
                        return;
                    }
                };

                let sink = state.read().subscribers.get(&topic).cloned();
                match sink {
                    Some(sink) => {
                        tracing::debug!("Received {} on {}", message.kind(), topic);
                        if sink.send(message).is_err() {
                            // Empfänger ist weg, Abo aufräumen
                            state.write().subscribers.remove(&topic);
                        }
                    }
                    None => tracing::debug!("No subscriber for topic {}", topic),
                }
            }

            ServerEnvelope::Error { code, message } => {
                tracing::error!("Server error {}: {}", code, message);
                let _ = event_tx.send(SignalingEvent::Error { code, message });
            }

            ServerEnvelope::Pong => {
                // Heartbeat-Response - nichts zu tun
            }
        }
    }
}

impl SignalingAdapter for RealtimeClient {
    fn subscribe(&self, room: &RoomId, sink: SignalingSink) -> Result<(), SignalingError> {
        {
            let mut state = self.state.write();
            if state.subscribers.contains_key(room.as_str()) {
                return Err(SignalingError::AlreadySubscribed(room.to_string()));
            }
            state.subscribers.insert(room.to_string(), sink);
        }

        let envelope = ClientEnvelope::Join {
            topic: room.as_str(),
            client_id: &self.client_id,
            timestamp: Utc::now().timestamp_millis(),
        };
        if let Err(e) = self.send_envelope(&envelope) {
            self.state.write().subscribers.remove(room.as_str());
            return Err(e);
        }
        Ok(())
    }

    fn publish(&self, room: &RoomId, message: &SignalingMessage) -> Result<(), SignalingError> {
        tracing::debug!("Publishing {} on {}", message.kind(), room);
        let envelope = ClientEnvelope::Broadcast {
            topic: room.as_str(),
            payload: message,
            timestamp: Utc::now().timestamp_millis(),
        };
        self.send_envelope(&envelope)
    }

    fn unsubscribe(&self, room: &RoomId) {
        if self.state.write().subscribers.remove(room.as_str()).is_none() {
            return;
        }

        let envelope = ClientEnvelope::Leave {
            topic: room.as_str(),
            timestamp: Utc::now().timestamp_millis(),
        };
        // Leave ist best-effort, der Kanal selbst bleibt offen
        if let Err(e) = self.send_envelope(&envelope) {
            tracing::debug!("Failed to send leave for {}: {}", room, e);
        }
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("server_url", &self.server_url)
            .field("client_id", &self.client_id)
            .field("is_connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::messages::SessionDescription;

    fn state_with_subscriber(topic: &str) -> (Arc<RwLock<ClientState>>, mpsc::UnboundedReceiver<SignalingMessage>) {
        let (sink, rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ClientState::default()));
        state.write().subscribers.insert(topic.to_string(), sink);
        (state, rx)
    }

    #[test]
    fn test_broadcast_envelope_format() {
        let msg = SignalingMessage::Answer {
            sdp: SessionDescription::answer("v=0"),
        };
        let envelope = ClientEnvelope::Broadcast {
            topic: "alicebob",
            payload: &msg,
            timestamp: 42,
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["event"], "broadcast");
        assert_eq!(value["topic"], "alicebob");
        assert_eq!(value["payload"]["type"], "answer");
        assert_eq!(value["payload"]["sdp"]["sdp"], "v=0");
    }

    #[test]
    fn test_broadcast_is_routed_to_subscriber() {
        let (state, mut rx) = state_with_subscriber("alicebob");
        let (event_tx, _) = broadcast::channel(8);

        RealtimeClient::handle_server_message(
            r#"{"event":"broadcast","topic":"alicebob","payload":{"type":"hangup"}}"#,
            &state,
            &event_tx,
        );

        assert_eq!(rx.try_recv().unwrap(), SignalingMessage::Hangup);
    }

    #[test]
    fn test_other_topics_are_ignored() {
        let (state, mut rx) = state_with_subscriber("alicebob");
        let (event_tx, _) = broadcast::channel(8);

        RealtimeClient::handle_server_message(
            r#"{"event":"broadcast","topic":"carolbob","payload":{"type":"hangup"}}"#,
            &state,
            &event_tx,
        );

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        let (state, mut rx) = state_with_subscriber("alicebob");
        let (event_tx, _) = broadcast::channel(8);

        RealtimeClient::handle_server_message(
            r#"{"event":"broadcast","topic":"alicebob","payload":{"type":"offer"}}"#,
            &state,
            &event_tx,
        );

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_connection_fails() {
        let client = RealtimeClient::new("https://example.com".to_string(), "alice".to_string());
        let room = RoomId::between("alice", "bob");
        assert_eq!(
            client.publish(&room, &SignalingMessage::Hangup),
            Err(SignalingError::NotConnected)
        );
    }

    #[test]
    fn test_failed_subscribe_is_rolled_back() {
        let client = RealtimeClient::new("https://example.com".to_string(), "alice".to_string());
        let room = RoomId::between("alice", "bob");
        let (sink, _rx) = mpsc::unbounded_channel();

        assert!(client.subscribe(&room, sink).is_err());
        assert!(client.state.read().subscribers.is_empty());
    }

    #[test]
    fn test_websocket_url() {
        let client = RealtimeClient::new("https://rt.example.com/v1/".to_string(), "a".to_string());
        assert_eq!(
            client.websocket_url().unwrap().as_str(),
            "wss://rt.example.com/v1/realtime"
        );
    }
}
