use serde::Deserialize;
use std::path::Path;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub forwarder: ForwarderConfig,
    pub gateway: GatewayConfig,
    pub radio: RadioConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub server: String,
    pub user: String,
    pub password: String,
    pub downlink_topic: String,
    pub uplink_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            server: "tcp://127.0.0.1:1883".to_string(),
            user: String::new(),
            password: String::new(),
            downlink_topic: "gateway/%s/command/down".to_string(),
            uplink_topic: "gateway/%s/event/up".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Network server IP address
    #[serde(rename = "nserver")]
    pub server: String,
    /// Network server UDP port, kept as text the way it is edited
    #[serde(rename = "nsport")]
    pub port: String,
    /// Local listen port for PULL_RESP; falls back to `port`
    pub bind_port: Option<String>,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".to_string(),
            port: "1700".to_string(),
            bind_port: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub mac: String,
    pub bridge_version: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mac: "DEADBEEFDEADBEEF".to_string(),
            bridge_version: "3".to_string(),
        }
    }
}

/// Radio parameters attached to the CLI's demo uplinks
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    pub channel: u32,
    pub rf_chain: u32,
    /// Hz
    pub frequency: u64,
    pub spreading_factor: u32,
    /// kHz
    pub bandwidth: u32,
    pub code_rate: String,
    pub rssi: i32,
    pub lora_snr: f64,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            channel: 0,
            rf_chain: 0,
            frequency: 868_100_000,
            spreading_factor: 7,
            bandwidth: 125,
            code_rate: "4/5".to_string(),
            rssi: -57,
            lora_snr: 7.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("failed to read {:?}: {}", path, e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Load(e.to_string()))
    }
}
