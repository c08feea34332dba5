//! Configuration inputs recognized by the session (spec §6).

use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Sentinel addresses that trigger discovery (spec §4.6, §9).
pub const ADDRESS_AUTO_SENTINELS: &[&str] = &["", "Auto", "0.0.0.0"];

#[derive(Deserialize)]
pub struct RawConfig {
    pub device_id: String,
    pub local_key: String,
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(default = "default_dialect")]
    pub dialect: String,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default)]
    pub persist: bool,
    #[serde(default)]
    pub cid: Option<String>,
}

fn default_protocol_version() -> String {
    "3.3".to_owned()
}

fn default_dialect() -> String {
    "default".to_owned()
}

fn default_connection_timeout_secs() -> u64 {
    5
}

#[derive(Debug)]
pub enum ConfigError {
    FileNotFound(String),
    ParseError(String),
    InvalidLocalKey,
    InvalidProtocolVersion(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {path}"),
            ConfigError::ParseError(msg) => write!(f, "Failed to parse config: {msg}"),
            ConfigError::InvalidLocalKey => write!(f, "local_key must be exactly 16 bytes"),
            ConfigError::InvalidProtocolVersion(v) => {
                write!(f, "protocol_version must be one of 3.3, 3.4, 3.5 (got {v})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Protocol version the device declares (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V33,
    V34,
    V35,
}

impl ProtocolVersion {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "3.3" => Some(ProtocolVersion::V33),
            "3.4" => Some(ProtocolVersion::V34),
            "3.5" => Some(ProtocolVersion::V35),
            _ => None,
        }
    }

    pub fn requires_handshake(self) -> bool {
        !matches!(self, ProtocolVersion::V33)
    }
}

/// Fully-validated session configuration (spec §6).
pub struct SessionConfig {
    pub device_id: String,
    pub local_key: [u8; 16],
    pub address: String,
    pub protocol_version: ProtocolVersion,
    pub dialect: String,
    pub connection_timeout: Duration,
    pub persist: bool,
    pub cid: Option<String>,
}

impl SessionConfig {
    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        if raw.local_key.as_bytes().len() != 16 {
            return Err(ConfigError::InvalidLocalKey);
        }
        let protocol_version = ProtocolVersion::parse(&raw.protocol_version)
            .ok_or_else(|| ConfigError::InvalidProtocolVersion(raw.protocol_version.clone()))?;

        let mut local_key = [0u8; 16];
        local_key.copy_from_slice(raw.local_key.as_bytes());

        Ok(SessionConfig {
            device_id: raw.device_id,
            local_key,
            address: raw.address,
            protocol_version,
            dialect: raw.dialect,
            connection_timeout: Duration::from_secs(raw.connection_timeout_secs),
            persist: raw.persist,
            cid: raw.cid,
        })
    }

    pub fn needs_discovery(&self) -> bool {
        ADDRESS_AUTO_SENTINELS.contains(&self.address.as_str())
    }
}

pub fn load_config(path: &str) -> Result<SessionConfig, ConfigError> {
    let contents =
        std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound(path.to_owned()))?;

    let raw: RawConfig = toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    SessionConfig::from_raw(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_local_key() {
        let raw = RawConfig {
            device_id: "dev1".into(),
            local_key: "short".into(),
            address: String::new(),
            protocol_version: "3.3".into(),
            dialect: "default".into(),
            connection_timeout_secs: 5,
            persist: false,
            cid: None,
        };
        assert!(matches!(SessionConfig::from_raw(raw), Err(ConfigError::InvalidLocalKey)));
    }

    #[test]
    fn auto_sentinels_trigger_discovery() {
        for addr in ADDRESS_AUTO_SENTINELS {
            let raw = RawConfig {
                device_id: "dev1".into(),
                local_key: "0123456789abcdef".into(),
                address: (*addr).to_owned(),
                protocol_version: "3.4".into(),
                dialect: "default".into(),
                connection_timeout_secs: 5,
                persist: false,
                cid: None,
            };
            let cfg = SessionConfig::from_raw(raw).unwrap();
            assert!(cfg.needs_discovery());
        }
    }

    #[test]
    fn concrete_address_does_not_trigger_discovery() {
        let raw = RawConfig {
            device_id: "dev1".into(),
            local_key: "0123456789abcdef".into(),
            address: "192.168.1.50".into(),
            protocol_version: "3.3".into(),
            dialect: "default".into(),
            connection_timeout_secs: 5,
            persist: false,
            cid: None,
        };
        let cfg = SessionConfig::from_raw(raw).unwrap();
        assert!(!cfg.needs_discovery());
    }

    #[test]
    fn v33_does_not_require_handshake_but_v34_v35_do() {
        assert!(!ProtocolVersion::V33.requires_handshake());
        assert!(ProtocolVersion::V34.requires_handshake());
        assert!(ProtocolVersion::V35.requires_handshake());
    }
}
