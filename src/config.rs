// Application configuration
// Logging can only be switched off at compile time in development builds

use crate::error::ConfigError;
use crate::peer::media::MediaConstraints;
use crate::peer::types::ServerConfig;
use crate::signaling::WireFormat;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // logging on in debug builds

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // logging off in release builds

#[cfg(debug_assertions)]
pub mod dev {
    // Set to false to silence logging entirely in development builds.
    // Only honoured in debug builds!
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Public STUN pair used when no servers are configured
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

/// How an incoming offer is handled while idle
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnswerMode {
    /// Hold the offer and ring until the user accepts or rejects
    #[default]
    Ring,
    /// Answer immediately
    AutoAccept,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    pub url: String,
    pub wire_format: WireFormat,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/signal".into(),
            wire_format: WireFormat::Json,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub enabled: bool,
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: LOGGING_ENABLED && dev::ENABLE_LOGGING,
            filter: "vidcall_lib=debug,webrtc=warn".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub answer_mode: AnswerMode,
    pub media: MediaConstraints,
    pub relay: RelayConfig,
    /// Candidates held while idle, waiting for the offer they belong to
    pub max_early_candidates: usize,
    pub log: LogConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            answer_mode: AnswerMode::default(),
            media: MediaConstraints::default(),
            relay: RelayConfig::default(),
            max_early_candidates: 64,
            log: LogConfig::default(),
        }
    }
}

impl CallConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&raw)?;
        info!("Loaded call config from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_ice_servers(&self.ice_servers)
    }

    /// Replaces the ICE servers; an empty list restores the defaults
    pub fn set_ice_servers(&mut self, servers: Vec<ServerConfig>) -> Result<(), ConfigError> {
        validate_ice_servers(&servers)?;
        info!("Setting {} custom ICE servers", servers.len());
        self.ice_servers = if servers.is_empty() {
            DEFAULT_ICE_SERVERS.clone()
        } else {
            servers
        };
        Ok(())
    }
}

fn validate_ice_servers(servers: &[ServerConfig]) -> Result<(), ConfigError> {
    for server in servers {
        if server.url.is_empty() {
            return Err(ConfigError::EmptyUrl);
        }
        if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
            return Err(ConfigError::MissingTurnCredentials(server.url.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = CallConfig::from_json_str(r#"{"answer_mode":"auto_accept"}"#).unwrap();
        assert_eq!(config.answer_mode, AnswerMode::AutoAccept);
        assert_eq!(config.ice_servers, *DEFAULT_ICE_SERVERS);
        assert_eq!(config.max_early_candidates, 64);
        assert!(config.media.audio && config.media.video);
    }

    #[test]
    fn turn_without_credentials_rejected() {
        let json = r#"{"ice_servers":[{"id":"t","type":"turn","url":"relay.example.org:3478"}]}"#;
        let err = CallConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, ConfigError::MissingTurnCredentials(_)));
    }

    #[test]
    fn empty_url_rejected() {
        let mut config = CallConfig::default();
        let err = config
            .set_ice_servers(vec![ServerConfig {
                id: "x".into(),
                r#type: "stun".into(),
                url: String::new(),
                username: None,
                credential: None,
            }])
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyUrl));
        assert_eq!(config.ice_servers, *DEFAULT_ICE_SERVERS);
    }

    #[test]
    fn empty_server_list_restores_defaults() {
        let mut config = CallConfig::default();
        config.ice_servers.clear();
        config.set_ice_servers(Vec::new()).unwrap();
        assert_eq!(config.ice_servers.len(), 2);
    }

    #[test]
    fn partial_sections_fall_back_to_defaults() {
        let config = CallConfig::from_json_str(
            r#"{"log":{"enabled":true},"relay":{"wire_format":"compact"}}"#,
        )
        .unwrap();
        assert!(config.log.enabled);
        assert_eq!(config.log.filter, LogConfig::default().filter);
        assert_eq!(config.relay.url, RelayConfig::default().url);
        assert_eq!(config.relay.wire_format, WireFormat::Compact);
    }
}
