//! Konfiguration der Call Engine
//!
//! ICE-Server, Timer und Signaling-Endpunkt. Die Werte werden beim Erzeugen
//! der Engine übergeben und sind während eines Anrufs nicht änderbar.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Standard Realtime-Endpunkt (kann über `SIGNALING_URL` überschrieben werden)
pub const DEFAULT_SIGNALING_URL: &str = "https://call-app-signaling.questxen.workers.dev";

/// Standard Grace-Periode nach Verbindungsverlust (15 Minuten)
pub const DEFAULT_RECONNECT_GRACE: Duration = Duration::from_secs(15 * 60);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("At least one ICE server is required")]
    NoIceServers,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Relay/Reflexive-Server Deskriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(urls: &[&str]) -> Self {
        Self {
            urls: urls.iter().map(|u| u.to_string()).collect(),
            username: None,
            credential: None,
        }
    }

    pub fn turn(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username: Some(username),
            credential: Some(credential),
        }
    }
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        // Google STUN Server (kostenlos, für ~90% der Verbindungen)
        IceServerConfig::stun(&[
            "stun:stun.l.google.com:19302",
            "stun:stun1.l.google.com:19302",
            "stun:stun2.l.google.com:19302",
        ]),
    ]
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Geordnete Liste der ICE-Server
    pub ice_servers: Vec<IceServerConfig>,

    /// Wie lange RECONNECTING dauern darf, bevor aufgeräumt wird
    #[serde(with = "duration_secs")]
    pub reconnect_grace: Duration,

    /// Maximale Wartezeit auf ein Answer bei Renegotiation
    #[serde(with = "duration_secs")]
    pub negotiation_timeout: Duration,

    /// Polling-Intervall des Stats Monitors
    #[serde(with = "duration_secs")]
    pub stats_interval: Duration,

    pub signaling_url: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            reconnect_grace: DEFAULT_RECONNECT_GRACE,
            negotiation_timeout: Duration::from_secs(10),
            stats_interval: Duration::from_secs(1),
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus einem JSON-Dokument (Dauern in Sekunden)
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Default-Konfiguration mit Overrides aus Umgebungsvariablen
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("SIGNALING_URL") {
            config.signaling_url = url;
        }

        if let Some(url) = lookup("TURN_URL") {
            config.ice_servers.push(IceServerConfig::turn(
                url,
                lookup("TURN_USERNAME").unwrap_or_default(),
                lookup("TURN_CREDENTIAL").unwrap_or_default(),
            ));
        }

        if let Some(raw) = lookup("RECONNECT_GRACE_SECS") {
            let secs = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue {
                    key: "RECONNECT_GRACE_SECS",
                    value: raw.clone(),
                })?;
            config.reconnect_grace = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Prüft die Konfiguration auf offensichtliche Fehler
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ice_servers.is_empty() || self.ice_servers.iter().all(|s| s.urls.is_empty()) {
            return Err(ConfigError::NoIceServers);
        }
        Url::parse(&self.signaling_url)?;

        if self.reconnect_grace.is_zero() {
            return Err(ConfigError::ZeroDuration("reconnect_grace"));
        }
        if self.negotiation_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("negotiation_timeout"));
        }
        if self.stats_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("stats_interval"));
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_is_valid() {
        let config = CallConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reconnect_grace, Duration::from_secs(900));
        assert_eq!(config.stats_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_from_json_partial() {
        let config = CallConfig::from_json(
            r#"{
                "ice_servers": [{ "urls": ["turn:turn.example.com:3478"], "username": "u", "credential": "p" }],
                "reconnect_grace": 30
            }"#,
        )
        .unwrap();

        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("u"));
        assert_eq!(config.reconnect_grace, Duration::from_secs(30));
        assert_eq!(config.negotiation_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_empty_ice_servers_rejected() {
        let err = CallConfig::from_json(r#"{ "ice_servers": [] }"#).unwrap_err();
        assert!(matches!(err, ConfigError::NoIceServers));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = CallConfig::from_json(r#"{ "stats_interval": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroDuration("stats_interval")));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SIGNALING_URL", "wss://rt.example.com"),
            ("TURN_URL", "turn:turn.example.com:3478"),
            ("TURN_USERNAME", "user"),
            ("TURN_CREDENTIAL", "secret"),
            ("RECONNECT_GRACE_SECS", "60"),
        ]
        .into_iter()
        .collect();

        let config = CallConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.signaling_url, "wss://rt.example.com");
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].credential.as_deref(), Some("secret"));
        assert_eq!(config.reconnect_grace, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_grace_env() {
        let err = CallConfig::from_lookup(|k| {
            (k == "RECONNECT_GRACE_SECS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "RECONNECT_GRACE_SECS",
                ..
            }
        ));
    }
}
