use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub signaling: SignalingConfig,
    pub webrtc: WebRTCConfig,
    pub negotiation: NegotiationConfig,
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Signaling mailbox connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Base URL of the REST store (e.g. `https://project.supabase.co`)
    pub base_url: String,
    /// API key sent as `apikey` and bearer token
    pub api_key: String,
    /// Table holding signaling messages
    pub table: String,
    /// Mailbox poll interval
    pub poll_interval_ms: u64,
    /// Per-request timeout
    pub request_timeout_ms: u64,
    /// Total attempts for one append before the error surfaces
    pub append_max_attempts: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321".to_string(),
            api_key: String::new(),
            table: "signaling_messages".to_string(),
            poll_interval_ms: 1000,
            request_timeout_ms: 10_000,
            append_max_attempts: 3,
        }
    }
}

impl SignalingConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// ICE server URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceScheme {
    Stun,
    Stuns,
    Turn,
    Turns,
}

impl IceScheme {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stun => "stun",
            Self::Stuns => "stuns",
            Self::Turn => "turn",
            Self::Turns => "turns",
        }
    }

    #[must_use]
    pub const fn is_relay(&self) -> bool {
        matches!(self, Self::Turn | Self::Turns)
    }
}

impl fmt::Display for IceScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reflection/relay server used for network path discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub scheme: IceScheme,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    #[must_use]
    pub fn stun(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: IceScheme::Stun,
            host: host.into(),
            port,
            username: None,
            credential: None,
        }
    }

    /// Render as an ICE URL, e.g. `stun:stun.l.google.com:19302`
    #[must_use]
    pub fn url(&self) -> String {
        format!("{}:{}:{}", self.scheme, self.host, self.port)
    }
}

/// WebRTC configuration for the peer connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRTCConfig {
    /// Reflection (STUN) and relay (TURN) servers
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServerConfig::stun("stun.l.google.com", 19302),
                IceServerConfig::stun("stun1.l.google.com", 19302),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Delay between seeing the peer's join and sending the first offer
    pub offer_delay_ms: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self { offer_delay_ms: 500 }
    }
}

/// Connectivity recovery policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// How long ICE may stay `disconnected` before an ICE restart
    pub disconnected_grace_ms: u64,
    /// Consecutive ICE restarts before escalating to a full reinitialization
    pub max_ice_restarts: usize,
    /// Consecutive reinitializations before the call is ended
    pub max_reinitializations: usize,
    pub reinit_min_delay_ms: u64,
    pub reinit_max_delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            disconnected_grace_ms: 5000,
            max_ice_restarts: 3,
            max_reinitializations: 3,
            reinit_min_delay_ms: 500,
            reinit_max_delay_ms: 5000,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // PEERLINK__SIGNALING__BASE_URL, PEERLINK__RECOVERY__MAX_ICE_RESTARTS, ...
        builder = builder.add_source(
            Environment::with_prefix("PEERLINK")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check the configuration, collecting every problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match url::Url::parse(&self.signaling.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => errors.push(format!(
                "signaling.base_url must be http or https, got {}",
                url.scheme()
            )),
            Err(e) => errors.push(format!("signaling.base_url is invalid: {e}")),
        }
        if self.signaling.table.trim().is_empty() {
            errors.push("signaling.table must not be empty".to_string());
        }
        if self.signaling.poll_interval_ms == 0 {
            errors.push("signaling.poll_interval_ms must be greater than 0".to_string());
        }
        if self.signaling.append_max_attempts == 0 {
            errors.push("signaling.append_max_attempts must be at least 1".to_string());
        }

        for (i, server) in self.webrtc.ice_servers.iter().enumerate() {
            if server.host.trim().is_empty() {
                errors.push(format!("webrtc.ice_servers[{i}].host must not be empty"));
            }
            if server.port == 0 {
                errors.push(format!("webrtc.ice_servers[{i}].port must not be 0"));
            }
            if server.scheme.is_relay()
                && (server.username.is_none() || server.credential.is_none())
            {
                errors.push(format!(
                    "webrtc.ice_servers[{i}] ({}) requires username and credential",
                    server.url()
                ));
            }
        }

        if self.recovery.reinit_min_delay_ms > self.recovery.reinit_max_delay_ms {
            errors.push(format!(
                "recovery.reinit_min_delay_ms ({}) exceeds reinit_max_delay_ms ({})",
                self.recovery.reinit_min_delay_ms, self.recovery.reinit_max_delay_ms
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.signaling.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.recovery.disconnected_grace_ms, 5000);
        assert_eq!(config.webrtc.ice_servers.len(), 2);
    }

    #[test]
    fn test_ice_server_url() {
        let stun = IceServerConfig::stun("stun.example.com", 3478);
        assert_eq!(stun.url(), "stun:stun.example.com:3478");

        let turn = IceServerConfig {
            scheme: IceScheme::Turns,
            host: "relay.example.com".to_string(),
            port: 5349,
            username: Some("user".to_string()),
            credential: Some("secret".to_string()),
        };
        assert_eq!(turn.url(), "turns:relay.example.com:5349");
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.signaling.base_url = "ftp://example.com".to_string();
        config.signaling.poll_interval_ms = 0;
        config.recovery.reinit_min_delay_ms = 10_000;
        config.webrtc.ice_servers.push(IceServerConfig {
            scheme: IceScheme::Turn,
            host: "relay.example.com".to_string(),
            port: 3478,
            username: None,
            credential: None,
        });

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("base_url")));
        assert!(errors.iter().any(|e| e.contains("poll_interval_ms")));
        assert!(errors.iter().any(|e| e.contains("reinit_min_delay_ms")));
        assert!(errors.iter().any(|e| e.contains("requires username")));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
[signaling]
base_url = "https://mailbox.example.com"
poll_interval_ms = 250

[[webrtc.ice_servers]]
scheme = "stun"
host = "stun.example.com"
port = 3478
"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.signaling.base_url, "https://mailbox.example.com");
        assert_eq!(config.signaling.poll_interval_ms, 250);
        // Untouched fields keep their defaults
        assert_eq!(config.signaling.table, "signaling_messages");
        assert_eq!(config.webrtc.ice_servers.len(), 1);
        assert_eq!(config.webrtc.ice_servers[0].url(), "stun:stun.example.com:3478");
    }

    #[test]
    fn test_unknown_ice_scheme_is_rejected() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
[[webrtc.ice_servers]]
scheme = "quic"
host = "stun.example.com"
port = 3478
"#
        )
        .unwrap();

        assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
    }
}
